use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use shared::domain::Session;
use tokio::fs;

/// Where a signed-in session survives restarts. Without a path nothing is
/// persisted and every start begins signed out.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn load(&self) -> Result<Option<Session>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read session file '{}'", path.display())
                })
            }
        };

        if raw.trim().is_empty() {
            return Ok(None);
        }

        let session = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session file '{}'", path.display()))?;
        Ok(Some(session))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.with_context(|| {
                format!(
                    "failed to create parent directory '{}' for session file",
                    parent.display()
                )
            })?;
        }

        let raw = serde_json::to_vec_pretty(session)?;
        fs::write(path, raw)
            .await
            .with_context(|| format!("failed to write session file '{}'", path.display()))
    }

    pub async fn clear(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove session file '{}'", path.display())),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_store_tests.rs"]
mod tests;
