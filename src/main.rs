use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use go2_bridge::config::ConfigStore;
use go2_bridge::robot::RtpIngestConnector;
use go2_bridge::state::AppState;
use go2_bridge::video::JpegTranscoder;
use go2_bridge::web;
use go2_bridge::webrtc::{WebRtcEngine, PUBLIC_STUN_SERVER};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// go2-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "go2-bridge")]
#[command(version, about = "Robot video bridge for browser viewers", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "go2-bridge.json")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting go2-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(&args.config).await?;
    tracing::info!("Configuration loaded from {}", args.config.display());

    // An empty server list would leave remote viewers without traversal
    if !config_store.get().webrtc.has_ice_servers() {
        config_store
            .update(|config| {
                config.webrtc.stun_servers = vec![PUBLIC_STUN_SERVER.to_string()];
            })
            .await?;
        tracing::info!("No ICE servers configured, using {}", PUBLIC_STUN_SERVER);
    }

    // CLI overrides stay in memory
    let mut config = (*config_store.get()).clone();
    if let Some(address) = args.address {
        config.web.bind_address = address;
    }
    if let Some(port) = args.port {
        config.web.http_port = port;
    }
    config_store.set_in_memory(config.clone());

    let engine = Arc::new(WebRtcEngine::new(&config.webrtc)?);
    let connector = Arc::new(RtpIngestConnector::new(
        config.robot.ingest_addr()?,
        config.robot.codec,
        config.robot.idle_timeout(),
    ));
    let transcoders = JpegTranscoder::factory(config.stream.quality());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(config_store, engine, connector, transcoders, shutdown_tx);

    let app = web::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", addr);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    state.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "go2_bridge=error,tower_http=error",
        LogLevel::Warn => "go2_bridge=warn,tower_http=warn",
        LogLevel::Info => "go2_bridge=info,tower_http=info",
        LogLevel::Verbose => "go2_bridge=debug,tower_http=info",
        LogLevel::Debug => "go2_bridge=debug,tower_http=debug",
        LogLevel::Trace => "go2_bridge=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
