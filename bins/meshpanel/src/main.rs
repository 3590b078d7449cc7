//! Mesh Panel Daemon
//!
//! Serves the federation runtime API to peer panels and the control channel
//! to local nodes from one HTTP listener.

mod config;
mod federation_api;
mod flow_api;
mod node_channel;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshpanel_control::{LeaseManager, TunnelProvisioner};
use meshpanel_core::store::{leases, nodes};
use meshpanel_core::{PanelConfig, Store};
use meshpanel_federation::types::{API_PREFIX, PATH_APPLY, PATH_CONNECT, PATH_DIAGNOSE, PATH_RELEASE};
use meshpanel_federation::FederationClient;
use meshpanel_network::SessionRegistry;

use crate::state::AppState;

/// Mesh Panel
#[derive(Parser)]
#[command(name = "meshpanel")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/meshpanel/panel.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the panel
    Serve,

    /// Generate default config
    GenConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a node shared by a peer panel
    ImportNode {
        /// Base URL of the peer panel
        #[arg(long)]
        url: String,

        /// Share token issued by the peer
        #[arg(long)]
        token: String,

        /// Local name; defaults to the shared node's name
        #[arg(long)]
        name: Option<String>,
    },

    /// List peer shares with their traffic
    Shares,

    /// Zero a peer share's traffic counter
    ResetShareFlow {
        /// Share id
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::GenConfig { output } => cmd_gen_config(output).await,
        Commands::ImportNode { url, token, name } => {
            cmd_import_node(&cli.config, &url, &token, name.as_deref()).await
        }
        Commands::Shares => cmd_shares(&cli.config).await,
        Commands::ResetShareFlow { id } => cmd_reset_share_flow(&cli.config, id).await,
    }
}

async fn cmd_serve(config_path: &PathBuf) -> Result<()> {
    let config = config::load(config_path).await?;
    info!("Starting mesh panel...");
    info!("Database: {}", config.database_path);

    let store = Store::open(&config.database_path).context("Failed to open database")?;

    // sessions do not survive a restart
    let stale = store.write(|tx| nodes::mark_all_offline(tx))?;
    if stale > 0 {
        info!("Marked {} nodes offline from the previous run", stale);
    }

    let sessions = Arc::new(SessionRegistry::new(config.control.command_timeout()));
    let leases = Arc::new(LeaseManager::new(store.clone(), sessions.clone()));
    let state = AppState {
        store,
        sessions,
        leases,
        control: config.control.clone(),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    })
    .await?;

    info!("Mesh panel stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    let federation = Router::new()
        .route(PATH_CONNECT, post(federation_api::connect))
        .route(PATH_APPLY, post(federation_api::apply))
        .route(PATH_RELEASE, post(federation_api::release))
        .route(PATH_DIAGNOSE, post(federation_api::diagnose));

    Router::new()
        .nest(API_PREFIX, federation)
        .route(node_channel::NODE_CHANNEL_PATH, get(node_channel::node_ws_handler))
        .route(flow_api::FLOW_UPLOAD_PATH, post(flow_api::upload))
        .with_state(state)
}

async fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let toml = toml::to_string_pretty(&PanelConfig::default())?;

    if let Some(path) = output {
        tokio::fs::write(&path, &toml).await?;
        println!("Config written to {:?}", path);
    } else {
        println!("{}", toml);
    }

    Ok(())
}

async fn cmd_import_node(config_path: &PathBuf, url: &str, token: &str, name: Option<&str>) -> Result<()> {
    let config = config::load(config_path).await?;
    let store = Store::open(&config.database_path).context("Failed to open database")?;

    let client = Arc::new(FederationClient::new(
        config.federation.request_timeout(),
        config.panel_domain.clone(),
    )?);
    let provisioner = TunnelProvisioner::new(store, client.clone(), client);

    let node = provisioner
        .import_remote_node(url, token, name)
        .await
        .context("Failed to import node")?;

    println!("Imported node {} ({}) ports {}", node.id, node.name, node.port);
    Ok(())
}

async fn cmd_shares(config_path: &PathBuf) -> Result<()> {
    let config = config::load(config_path).await?;
    let store = Store::open(&config.database_path).context("Failed to open database")?;

    for share in store.read(|conn| leases::list_shares(conn))? {
        let limit = match share.max_bandwidth {
            0 => "unlimited".to_string(),
            max => max.to_string(),
        };
        println!(
            "{}\t{}\tnode {}\tports {}-{}\tflow {}/{}\t{}",
            share.id,
            share.name,
            share.node_id,
            share.port_range_start,
            share.port_range_end,
            share.current_flow,
            limit,
            if share.is_active { "active" } else { "disabled" }
        );
    }
    Ok(())
}

async fn cmd_reset_share_flow(config_path: &PathBuf, share_id: i64) -> Result<()> {
    let config = config::load(config_path).await?;
    let store = Store::open(&config.database_path).context("Failed to open database")?;

    store
        .write(|tx| leases::reset_share_flow(tx, share_id))
        .with_context(|| format!("Failed to reset share {}", share_id))?;
    println!("Traffic of share {} reset", share_id);
    Ok(())
}
