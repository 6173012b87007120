//! WhatsApp AI Bot - HTTP service and CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use whatsapp_ai_bot::client::SidecarBridge;
use whatsapp_ai_bot::config::Config;
use whatsapp_ai_bot::health::mark_process_start;
use whatsapp_ai_bot::http::{router, AppState};
use whatsapp_ai_bot::responder::AiResponder;
use whatsapp_ai_bot::status::StatusStore;
use whatsapp_ai_bot::supervisor::Supervisor;

/// WhatsApp AI Bot - webhook service
#[derive(Parser)]
#[command(name = "whatsapp-ai-bot")]
#[command(about = "Bridge a WhatsApp session with an AI responder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service and the WhatsApp session
    Serve {
        /// Address to listen on
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
        bind: SocketAddr,

        /// Directory for the status file, QR file and session data
        #[arg(long, env = "WHATSAPP_TMP_DIR")]
        tmp_dir: Option<PathBuf>,

        /// Shell command that runs the WhatsApp bridge
        #[arg(long, env = "WHATSAPP_BRIDGE_CMD")]
        bridge: String,
    },

    /// Print the persisted status record
    Status {
        /// Directory holding the status file
        #[arg(long, env = "WHATSAPP_TMP_DIR")]
        tmp_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mark_process_start();
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            tmp_dir,
            bridge,
        } => cmd_serve(&load_config(tmp_dir), bind, &bridge).await,
        Commands::Status { tmp_dir } => cmd_status(&load_config(tmp_dir)),
    }
}

fn load_config(tmp_dir: Option<PathBuf>) -> Config {
    let tmp_dir = tmp_dir.unwrap_or_else(std::env::temp_dir);
    Config::from_env(&tmp_dir)
}

async fn cmd_serve(config: &Config, bind: SocketAddr, bridge: &str) -> anyhow::Result<()> {
    info!("WhatsApp bot starting");

    let store = StatusStore::new(config);
    store
        .init()
        .with_context(|| format!("Failed to prepare {}", config.tmp_dir.display()))?;
    info!("Session directory: {}", store.session_dir().display());

    let client = Arc::new(SidecarBridge::new(bridge, store.session_dir().to_path_buf()));
    let responder = Arc::new(AiResponder::from_config(config));
    let (supervisor, _task) = Supervisor::new(config, store.clone(), client, responder).spawn();

    // Boot the session right away instead of waiting for the first request
    supervisor.ensure_started().await?;

    let app = router(AppState {
        supervisor,
        store: Arc::new(store),
        platform: config.platform.clone(),
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", listener.local_addr()?);
    info!("  GET  /health");
    info!("  GET  /session?action=status|qr|restart");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("WhatsApp bot stopped");
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = StatusStore::new(config);
    match store.read_raw()? {
        status if status.is_empty() => {
            println!("No status recorded at {}", store.status_file().display());
        }
        status => println!("{}", serde_json::to_string_pretty(&status)?),
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
}
