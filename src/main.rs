//! OBS Scene-Sync Gateway
//!
//! Keeps several OBS Studio instances on a LAN visually identical: the
//! master node broadcasts its OBS state (scene selection, scene-item
//! transforms, filter settings, image-source contents) to slave nodes, which
//! apply it to their local OBS and watch for drift.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod engine;
mod error;
mod image;
mod master;
mod metrics;
mod obs;
mod protocol;
mod settings;
mod slave;

use crate::engine::{AppMode, EngineEvent, SyncEngine};
use crate::obs::ObsConnectionConfig;
use crate::protocol::AlertSeverity;

/// Mirror a master OBS instance to slave instances on the LAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OBS WebSocket host (overrides saved settings)
    #[arg(long, env = "OBS_HOST")]
    obs_host: Option<String>,

    /// OBS WebSocket port (overrides saved settings)
    #[arg(long, env = "OBS_PORT")]
    obs_port: Option<u16>,

    /// OBS WebSocket password (overrides saved settings)
    #[arg(long, env = "OBS_PASSWORD")]
    obs_password: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run as the source of truth, broadcasting OBS state to slaves
    Master {
        /// Listening port for slave connections
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run as a mirror, following a master's OBS state
    Slave {
        /// Master host to connect to
        #[arg(long)]
        host: Option<String>,

        /// Master port to connect to
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let engine = SyncEngine::new();
    info!(
        "Starting obs-sync-gw {} ({})",
        engine.get_app_version(),
        engine.get_git_commit()
    );

    let saved = engine.load_settings().await.unwrap_or_else(|e| {
        warn!("Could not load settings, using defaults: {e}");
        Default::default()
    });

    let obs_config = ObsConnectionConfig {
        host: args.obs_host.unwrap_or(saved.obs.host.clone()),
        port: args.obs_port.unwrap_or(saved.obs.port),
        password: args
            .obs_password
            .or_else(|| (!saved.obs.password.is_empty()).then(|| saved.obs.password.clone())),
    };
    engine
        .connect_obs(obs_config)
        .await
        .context("Failed to connect to OBS; is obs-websocket enabled?")?;

    let mut events = engine
        .subscribe_events()
        .expect("fresh engine owns its event stream");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::SlaveConnectionStatus(connected) => {
                    if connected {
                        info!("Connected to master");
                    } else {
                        warn!("Disconnected from master");
                    }
                }
                EngineEvent::DesyncAlert(alert) => match alert.severity {
                    AlertSeverity::Critical => warn!(
                        "DESYNC [{}/{}]: {}",
                        alert.scene_name, alert.source_name, alert.message
                    ),
                    AlertSeverity::Warning => info!(
                        "drift [{}/{}]: {}",
                        alert.scene_name, alert.source_name, alert.message
                    ),
                },
            }
        }
    });

    match args.role {
        Role::Master { port } => {
            engine.set_app_mode(AppMode::Master);
            let port = port.unwrap_or(saved.master.default_port);
            let bound = engine.start_master_server(port).await?;
            if let Some(ip) = engine.local_ip_address() {
                info!("Slaves can connect to {ip}:{bound}");
            }

            shutdown_signal().await;
            engine.stop_master_server().await?;
        }
        Role::Slave { host, port } => {
            engine.set_app_mode(AppMode::Slave);
            let host = host.unwrap_or(saved.slave.default_host.clone());
            let port = port.unwrap_or(saved.slave.default_port);
            engine.connect_to_master(&host, port).await?;

            shutdown_signal().await;
            engine.disconnect_from_master().await?;
        }
    }

    engine.disconnect_obs().await?;
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
