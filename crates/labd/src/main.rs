//! labd: the labgrid scheduler daemon.
//!
//! One replica of the scheduler. Any number of replicas share a Redis
//! backbone; each edge controller connects to exactly one of them, and
//! jobs for a lab are routed to whichever replica owns it.
//!
//! # Usage
//!
//! ```text
//! labd serve --config /etc/labgrid/labgrid.toml
//! labd serve --listen 0.0.0.0:8090 --redis-url redis://redis:6379/ --log-json
//! labd config > labgrid.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use labgrid_core::SchedulerConfig;
use labgrid_edge::{Control, ControlContext};
use labgrid_queue::{RedisBackbone, RedisConfig};
use labgrid_state::StateStore;

const DEFAULT_FILTER: &str = "info,labd=debug,labgrid=debug";

#[derive(Parser)]
#[command(name = "labd", about = "labgrid scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scheduler replica.
    Serve {
        /// Path to labgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address for the REST API and edge WebSocket.
        #[arg(long)]
        listen: Option<String>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        redis_url: Option<String>,

        /// Replica id; a random one is generated when absent.
        #[arg(long)]
        schedule_id: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            redis_url,
            schedule_id,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = SchedulerConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if let Some(url) = redis_url {
                config.redis.url = url;
            }
            config.validate()?;
            let schedule_id = schedule_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_serve(config, schedule_id).await
        }
        Command::Config { config } => {
            let config = SchedulerConfig::load(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_serve(config: SchedulerConfig, schedule_id: String) -> anyhow::Result<()> {
    info!(schedule_id = %schedule_id, "labgrid scheduler starting");

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("labgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Backbone ───────────────────────────────────────────────

    let backbone = Arc::new(RedisBackbone::new(RedisConfig::from(&config.redis))?);
    info!(url = %config.redis.url, namespace = ?config.redis.namespace, "redis backbone configured");

    // ── Control ────────────────────────────────────────────────

    let listen = config.server.listen.clone();
    let ctx = ControlContext::new(store, backbone, schedule_id, config);
    let control = Control::new(ctx);
    control.start().await;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // ── API server ─────────────────────────────────────────────

    let router = labgrid_api::build_router(control.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(addr = %listen, "API server starting");

    // Sessions are closed before the server drains so upgraded sockets end too.
    let shutdown_control = control.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            shutdown_control.shutdown().await;
        })
        .await?;

    info!("labgrid scheduler stopped");
    Ok(())
}
