//! MIDI Gatekeeper
//!
//! Connects allow-listed MIDI keyboards and pads and plays what they send.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midi_gatekeeper::config::{AppConfig, ConfigWatcher};
use midi_gatekeeper::handlers::builtin::builtin_profiles;
use midi_gatekeeper::handlers::{HandlerRegistry, RegisterOptions};
use midi_gatekeeper::host::{HostPort, MidiHost, MidirHost};
use midi_gatekeeper::security::{SecurityFilter, Verdict};
use midi_gatekeeper::services::{JsonFilePersistence, MemoryPersistence, PersistenceService};
use midi_gatekeeper::{AccessEvent, Message, MidiAccess};

/// MIDI Gatekeeper - allow-listed MIDI input with hotplug recovery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gatekeeper.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// List MIDI input ports with their authorization verdict
    #[arg(long)]
    list_ports: bool,

    /// Print every decoded message
    #[arg(long)]
    monitor: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("Starting MIDI Gatekeeper...");
    info!("Configuration file: {}", args.config);

    let (config_watcher, config) = load_config(&args.config).await?;

    if args.list_ports {
        list_ports_formatted(&config)?;
        return Ok(());
    }

    let access = build_access(&config)?;

    access.subscribe(Arc::new(|event: &AccessEvent| match event {
        AccessEvent::PermissionCountdown { remaining_secs } => {
            info!("⏳ Waiting for MIDI access ({}s left)", remaining_secs)
        }
        AccessEvent::AutoReconnectFailed { .. } => {
            warn!("⚠️  Expected devices did not come back")
        }
        other => debug!("Event: {}", other.name()),
    }));

    if args.monitor {
        access.on(None, |message: &Message| {
            println!("{} {}", message.device_id, message);
        });
    }

    if access.initialize("startup").await && access.connected_devices().is_empty() {
        // Devices from the last session may still be enumerating
        access.auto_reconnect("startup").await;
    }

    run_app(access, config, config_watcher, shutdown_signal()).await?;

    info!("MIDI Gatekeeper shutdown complete");
    Ok(())
}

fn build_access(config: &AppConfig) -> Result<MidiAccess> {
    let persistence: Arc<dyn PersistenceService> = match &config.persistence.snapshot_path {
        Some(path) => Arc::new(JsonFilePersistence::new(path)),
        None => Arc::new(MemoryPersistence::new()),
    };

    let access = midi_gatekeeper::MidiAccessBuilder::from_config(config)
        .persistence(persistence)
        .build()
        .context("failed to set up MIDI access")?;
    Ok(access)
}

async fn load_config(path: &str) -> Result<(Option<ConfigWatcher>, AppConfig)> {
    if !Path::new(path).exists() {
        warn!("Config file {} not found, using defaults", path);
        return Ok((None, AppConfig::default()));
    }

    let (watcher, config) = ConfigWatcher::new(path.to_string())
        .await
        .with_context(|| format!("failed to load configuration from {}", path))?;
    info!("Configuration loaded successfully with hot-reload enabled");
    Ok((Some(watcher), (*config).clone()))
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

async fn run_app(
    access: MidiAccess,
    mut config: AppConfig,
    mut config_watcher: Option<ConfigWatcher>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!("Ready to process MIDI input");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(new_config) = next_config(&mut config_watcher) => {
                info!("📝 Configuration file changed, reloading...");

                if new_config.playback.enabled != config.playback.enabled {
                    access.set_playback_mode(new_config.playback.enabled);
                }
                if new_config.reconnect != config.reconnect
                    || new_config.fingerprints != config.fingerprints
                    || new_config.permission != config.permission
                {
                    warn!("⚠️  Permission, reconnect and fingerprint changes apply on restart");
                }
                config = new_config;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    match serde_json::to_string(&access.stats()) {
        Ok(stats) => debug!("Final stats: {}", stats),
        Err(e) => warn!("Failed to serialize stats: {}", e),
    }
    access.destroy();

    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
        }))
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Print input ports with the verdict and profile each would get
fn list_ports_formatted(config: &AppConfig) -> Result<()> {
    use colored::*;

    let filter = SecurityFilter::new(&config.fingerprint_rules());
    let handlers = HandlerRegistry::new();
    for profile in builtin_profiles()? {
        handlers.register(profile, RegisterOptions::default())?;
    }

    let host = MidirHost::new(config.midi.client_name.clone(), config.hotplug_poll());
    let ports = host
        .input_ports()
        .context("failed to enumerate MIDI input ports")?;

    println!("\n{}", "=== MIDI Input Ports ===".bold().cyan());
    if ports.is_empty() {
        println!("  {}", "No input ports found".dimmed());
    }

    for port in ports {
        let info = port.info();
        let descriptor = info.descriptor();
        match filter.evaluate(&descriptor) {
            Verdict::Authorized { token } => {
                let profile = handlers
                    .resolve(&descriptor)
                    .map(|p| p.id().to_string())
                    .unwrap_or_else(|| "no handler".to_string());
                println!(
                    "  {} {} {}",
                    "[ALLOWED]".green(),
                    info.name.bright_white(),
                    format!("('{}' → {})", token, profile).dimmed()
                );
            }
            verdict @ Verdict::Excluded { .. } => {
                println!(
                    "  {} {} {}",
                    "[EXCLUDED]".red(),
                    info.name,
                    format!("({})", verdict.reason()).dimmed()
                );
            }
            Verdict::NotAllowed => {
                println!("  {} {}", "[IGNORED]".dimmed(), info.name);
            }
        }
    }

    println!();
    Ok(())
}
