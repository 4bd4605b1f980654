use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dashboard_core::{
    format_currency, format_number, DashboardPipeline, DashboardSnapshot, Registration,
    RestGateway, SessionStateManager, SessionStore, TOP_MARKETS,
};
use serde_json::Value;
use shared::domain::{Credentials, Metadata};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(about = "Foreign trade dashboard over a Supabase gateway")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and persist the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account. Extra profile fields go in as `--field key=value`.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    Logout,
    /// Show the signed-in identity and its role.
    Whoami,
    /// Load the dashboard views and print the summary.
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings()?;

    let filter = EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|err| {
        eprintln!("ignoring invalid log filter '{}': {err}", settings.log_filter);
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let gateway = Arc::new(
        RestGateway::new(
            &settings.gateway_url,
            settings.api_key.clone(),
            SessionStore::at_path(&settings.session_file),
        )
        .context("invalid gateway configuration")?,
    );
    info!(
        "cli: gateway={} session_file={}",
        gateway.base_url(),
        settings.session_file.display()
    );

    let sessions = SessionStateManager::new(gateway.clone());
    sessions.start().await;

    let outcome = run(args.command, &sessions, gateway).await;
    sessions.shutdown();
    outcome
}

async fn run(
    command: Command,
    sessions: &Arc<SessionStateManager>,
    gateway: Arc<RestGateway>,
) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let user = sessions.login(&Credentials::new(email, password)).await?;
            println!(
                "Signed in as {} ({})",
                user.email.as_deref().unwrap_or("no email"),
                user.role().map_or("no role", |role| role.as_str())
            );
        }
        Command::Register {
            email,
            password,
            fields,
        } => match sessions
            .register(registration_fields(email, password, fields))
            .await?
        {
            Registration::Created(user) => {
                println!("Registered user {}", user.id);
                if !sessions.is_authenticated() {
                    println!("Confirm the account before signing in.");
                }
            }
            Registration::AcceptedWithoutIdentity => {
                println!("Registration accepted; no identity was returned yet.");
            }
        },
        Command::Logout => {
            sessions.logout().await;
            println!("Signed out.");
        }
        Command::Whoami => match sessions.current_user() {
            Some(user) => {
                println!("id:    {}", user.id);
                println!("email: {}", user.email.as_deref().unwrap_or("-"));
                println!(
                    "role:  {}",
                    sessions.role().map_or("-", |role| role.as_str())
                );
                println!("admin: {}", sessions.is_admin());
                println!("client: {}", sessions.is_client());
            }
            None => println!("Not signed in."),
        },
        Command::Dashboard => {
            if !sessions.is_authenticated() {
                println!("Limited access: not signed in, showing public data only.\n");
            }
            let pipeline = DashboardPipeline::new(gateway);
            match pipeline.fetch_dashboard().await {
                Ok(snapshot) => print!("{}", render_dashboard(&snapshot)),
                Err(failed) => {
                    warn!("cli: dashboard fetch failed");
                    bail!("{failed}. Run `dashboard` again to retry.");
                }
            }
        }
    }
    Ok(())
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn registration_fields(email: String, password: String, extra: Vec<(String, String)>) -> Metadata {
    let mut fields = Metadata::new();
    for (key, value) in extra {
        fields.insert(key, Value::String(value));
    }
    fields.insert("email".into(), Value::String(email));
    fields.insert("password".into(), Value::String(password));
    fields
}

fn render_dashboard(snapshot: &DashboardSnapshot) -> String {
    let metrics = &snapshot.metrics;
    let mut out = String::new();

    out.push_str(&format!(
        "Total operations:   {}\n",
        format_number(metrics.total_operations)
    ));
    out.push_str(&format!(
        "Destination countries: {}\n",
        format_number(metrics.total_countries)
    ));
    out.push_str(&format!(
        "Monthly average:    {}\n",
        format_number(metrics.monthly_average)
    ));
    out.push_str(&format!(
        "Maritime / land:    {} / {}\n",
        format_number(metrics.maritime_operations),
        format_number(metrics.land_operations)
    ));
    out.push_str(&format!(
        "Exports:            {} in {} operations\n",
        format_currency(metrics.exports_value_usd),
        format_number(metrics.exports_operations)
    ));

    out.push_str("\nMain markets\n");
    for (rank, market) in snapshot.top_markets(TOP_MARKETS).iter().enumerate() {
        out.push_str(&format!(
            "  {}. {} {}\n",
            rank + 1,
            market.nombre_del_pais_de_destino,
            format_currency(market.valor_total_usd)
        ));
    }

    out.push_str("\nTransport modes\n");
    for share in snapshot.transport_shares() {
        out.push_str(&format!(
            "  {:<20} {:>10} {:>5.1}%\n",
            share.label,
            format_number(share.operations),
            share.percent
        ));
    }

    out.push_str("\nMonthly operations\n");
    for row in &snapshot.monthly_operations {
        out.push_str(&format!("  {}\n", Value::Object(row.clone())));
    }

    out.push_str("\nRecent operations\n");
    for row in &snapshot.recent_operations {
        out.push_str(&format!("  {}\n", Value::Object(row.clone())));
    }
    out
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
