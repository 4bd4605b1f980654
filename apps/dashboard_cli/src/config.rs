use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const SETTINGS_FILE: &str = "dashboard.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub gateway_url: String,
    pub api_key: String,
    pub session_file: PathBuf,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:54321".into(),
            api_key: "dev-anon-key".into(),
            session_file: PathBuf::from("./data/session.json"),
            log_filter: "info".into(),
        }
    }
}

/// Defaults, then `dashboard.toml` in the working directory, then the
/// process environment.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    }

    apply_env(&mut settings, env);
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, String>>(raw)?;
    if let Some(v) = file_cfg.get("gateway_url") {
        settings.gateway_url = v.clone();
    }
    if let Some(v) = file_cfg.get("api_key") {
        settings.api_key = v.clone();
    }
    if let Some(v) = file_cfg.get("session_file") {
        settings.session_file = PathBuf::from(v);
    }
    if let Some(v) = file_cfg.get("log_filter") {
        settings.log_filter = v.clone();
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    // Later keys win, so the APP__ spelling overrides the Supabase one.
    let lookup = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| env(key).filter(|v| !v.trim().is_empty()))
            .last()
    };

    if let Some(v) = lookup(&["SUPABASE_URL", "APP__GATEWAY_URL"]) {
        settings.gateway_url = v;
    }
    if let Some(v) = lookup(&["SUPABASE_ANON_KEY", "APP__API_KEY"]) {
        settings.api_key = v;
    }
    if let Some(v) = lookup(&["APP__SESSION_FILE"]) {
        settings.session_file = PathBuf::from(v);
    }
    if let Some(v) = lookup(&["RUST_LOG"]) {
        settings.log_filter = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
