//! enginectl - profile switcher for audio-engine appliances
//!
//! Logs into the appliance's Digest-protected configuration page, lists the
//! profiles it offers and loads one, keeping a set of on/off control
//! endpoints in step with the active profile.

mod appliance;
mod config;
mod digest;
mod error;
mod http;
mod models;
mod parser;
mod resolver;
mod sync;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use models::{EndpointEvent, EndpointStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sync::Synchronizer;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "enginectl")]
#[command(about = "Audio engine profile switcher", long_about = None)]
struct Args {
    /// Config file path (default: ./enginectl.toml or ~/.config/enginectl/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the profiles the appliance offers
    Profiles {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Load a profile by identifier or title
    Load {
        /// Profile identifier (case-insensitive)
        profile: String,
    },

    /// Show the current status line
    Status,

    /// List control endpoints and their on/off state
    Endpoints {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Store connection settings
    SetCredentials {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Poll the appliance and report endpoint changes
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_path = config::Config::locate(args.config.as_deref());
    let mut cfg = config::Config::load_from(&config_path)?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Using config file {}", config_path.display());

    match args.command {
        Command::SetCredentials {
            host,
            port,
            username,
            password,
        } => set_credentials(&mut cfg, &config_path, host, port, username, password),
        Command::Profiles { json } => list_profiles(&connect(&cfg)?, json).await,
        Command::Load { profile } => {
            let sync = connect(&cfg)?;
            load_profile(&sync, &mut cfg, &config_path, &profile).await
        }
        Command::Status => show_status(&connect(&cfg)?).await,
        Command::Endpoints { json } => list_endpoints(&connect(&cfg)?, json).await,
        Command::Watch => run_watch(&connect(&cfg)?, &cfg, &config_path).await,
    }
}

/// Build a synchronizer over a real HTTP transport
fn connect(cfg: &config::Config) -> Result<Synchronizer> {
    let transport = http::HttpClient::with_timeouts(
        Duration::from_secs(cfg.http.timeout),
        Duration::from_secs(cfg.http.connect_timeout),
    )
    .context("Failed to create HTTP client")?;

    Ok(Synchronizer::new(
        Arc::new(transport),
        cfg.connection_settings(),
        cfg.restart_grace(),
    ))
}

fn set_credentials(
    cfg: &mut config::Config,
    path: &Path,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let appliance = &mut cfg.appliance;
    if let Some(host) = host {
        if host != appliance.host {
            // A different appliance has its own profile list
            appliance.profile = None;
        }
        appliance.host = host;
    }
    if let Some(port) = port {
        appliance.port = port;
    }
    if let Some(username) = username {
        appliance.username = username;
    }
    if let Some(password) = password {
        appliance.password = password;
    }

    cfg.save_to(path)?;
    tracing::info!("Connection settings saved to {}", path.display());

    if !cfg.connection_settings().is_complete() {
        tracing::warn!("Host, username and password are all required before connecting");
    }
    Ok(())
}

async fn list_profiles(sync: &Synchronizer, json: bool) -> Result<()> {
    let profiles = sync
        .fetch_profiles()
        .await
        .context("Failed to fetch profiles")?;
    let current = sync.current_profile();

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    if profiles.is_empty() {
        tracing::warn!("The appliance offers no selectable profiles");
    }
    for profile in &profiles {
        let marker = if current.as_ref() == Some(profile) { "*" } else { " " };
        println!("{} {:<20} {}", marker, profile.id, profile.title);
    }
    Ok(())
}

async fn load_profile(
    sync: &Synchronizer,
    cfg: &mut config::Config,
    path: &Path,
    requested: &str,
) -> Result<()> {
    let profile = sync
        .load_profile(requested)
        .await
        .with_context(|| format!("Failed to load profile '{}'", requested))?;

    cfg.appliance.profile = sync.settings().profile;
    cfg.save_to(path)?;

    println!("Loaded {}", profile);
    Ok(())
}

async fn show_status(sync: &Synchronizer) -> Result<()> {
    let status = sync.current_status().await;
    println!("{}", status.message);

    if status.is_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_endpoints(sync: &Synchronizer, json: bool) -> Result<()> {
    if let Err(e) = sync.fetch_profiles().await {
        tracing::warn!("Refresh failed, showing last known endpoints: {}", e);
    }
    let endpoints = sync.list_endpoints();

    if json {
        println!("{}", serde_json::to_string_pretty(&endpoints)?);
        return Ok(());
    }

    println!("surface: {}", sync.surface_status());
    for endpoint in &endpoints {
        println!(
            "{:<7} {:<20} {}",
            endpoint.status.to_string(),
            endpoint.key,
            endpoint.profile.title
        );
    }
    Ok(())
}

/// Watch mode - periodic status polling
async fn run_watch(sync: &Synchronizer, cfg: &config::Config, path: &Path) -> Result<()> {
    let poll_interval = Duration::from_secs(cfg.sync.poll_interval.max(1));
    let mut events = sync.subscribe();

    tracing::info!("Starting watch mode...");
    tracing::info!("Appliance: {}", cfg.connection_settings().credentials().base_url());
    tracing::info!("Poll interval: {}s", poll_interval.as_secs());
    tracing::info!("---");

    let mut ticker = tokio::time::interval(poll_interval);
    let mut last_message = String::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reload_settings(sync, path).await;
                let status = sync.current_status().await;
                if status.message != last_message {
                    if status.is_error {
                        tracing::error!("{}", status.message);
                    } else {
                        tracing::info!("{}", status.message);
                    }
                    last_message = status.message;
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} endpoint events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watch mode");
                return Ok(());
            }
        }
    }
}

/// Pick up credentials saved by another process while watching
async fn reload_settings(sync: &Synchronizer, path: &Path) {
    match config::Config::load_from(path) {
        Ok(cfg) => {
            let mut settings = cfg.connection_settings();
            let current = sync.settings();
            // The profile is ours to track; only connection changes matter
            settings.profile = current.profile.clone();
            if settings != current {
                tracing::info!("Config file changed, applying new connection settings");
                sync.update_settings(settings).await;
            }
        }
        Err(e) => tracing::warn!("Ignoring unreadable config file: {:#}", e),
    }
}

fn log_event(event: &EndpointEvent) {
    match event {
        EndpointEvent::Created(endpoint) => {
            tracing::info!("Endpoint '{}' added ({})", endpoint.key, endpoint.status)
        }
        EndpointEvent::Removed(key) => tracing::info!("Endpoint '{}' removed", key),
        EndpointEvent::StatusChanged { key, status } if *status == EndpointStatus::Selected => {
            tracing::info!("Endpoint '{}' is now active", key)
        }
        EndpointEvent::StatusChanged { key, status } => {
            tracing::debug!("Endpoint '{}' -> {}", key, status)
        }
    }
}
