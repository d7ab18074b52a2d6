//! Sonant Server - Standalone headless server for Sonant Bridge.
//!
//! Terminates carrier media-stream WebSockets and bridges each call to
//! the model provider's bidirectional streaming RPC. Designed to run as
//! a background daemon behind the TLS-terminating frontend that also
//! hosts the carrier webhook.
//!
//! Exit codes: 0 normal shutdown, 1 startup validation failure, 2 fatal
//! supervisor exit.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sonant_core::{
    AppState, BackoffPolicy, BufferPool, CallRegistry, CircuitBreaker, HttpModelConnector,
    LoggingQualitySink, ProcMeminfoPressure, RpcDriver, SessionRegistry, SharedConfig,
};
use tokio::signal;

/// Sonant Server - Headless carrier-to-model realtime audio bridge.
#[derive(Parser, Debug)]
#[command(name = "sonant-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Overrides config.
    #[arg(short, long, env = "SONANT_LOG_LEVEL")]
    log_level: Option<log::LevelFilter>,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SONANT_BIND_PORT")]
    port: Option<u16>,
}

fn main() {
    // Startup validation failures exit 1, fatal runtime failures exit 2.
    let code = match run() {
        Ok(()) => 0,
        Err(exit) => exit,
    };
    std::process::exit(code);
}

fn run() -> Result<(), i32> {
    let args = Args::parse();

    let mut config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err:#}");
            return Err(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let level = args
        .log_level
        .or_else(|| sonant_core::config::log_level_filter(&config.logging.level))
        .unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    log::info!("Sonant Server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(err) = config.validate() {
        log::error!("Invalid configuration: {err}");
        return Err(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            log::error!("Failed to start runtime: {err}");
            2
        })?;

    runtime.block_on(serve(config)).map_err(|err| {
        log::error!("Fatal: {err:#}");
        2
    })
}

async fn serve(config: sonant_core::Config) -> Result<()> {
    // Companding tables are built before the first media frame arrives.
    sonant_core::codec::init_tables();

    let shared_config = SharedConfig::new(config.clone());

    let pool = Arc::new(BufferPool::new(
        config.buffer_pool,
        Arc::new(ProcMeminfoPressure),
    ));
    pool.start_maintenance();

    let registry = SessionRegistry::new(config.bedrock.max_audio_queue_size);
    registry.start_sweep(config.health_check.stale_session_timeout_ms);

    // Calls registered by the webhook stay valid for the idle timeout.
    let calls = Arc::new(CallRegistry::new(Duration::from_millis(
        config.bedrock.session_timeout_ms,
    )));

    let connector =
        HttpModelConnector::new(&config.bedrock).context("Failed to build model connector")?;
    let driver = Arc::new(RpcDriver {
        connector: Arc::new(connector),
        breaker: Arc::new(CircuitBreaker::new()),
        backoff: BackoffPolicy::default(),
        request_timeout: Duration::from_millis(config.bedrock.request_timeout_ms),
    });

    let state = AppState::new(
        shared_config,
        registry,
        calls,
        pool,
        Arc::new(ProcMeminfoPressure),
        Arc::new(LoggingQualitySink),
        driver,
    );

    log::info!("Services bootstrapped successfully");

    let server_state = state.clone();
    let mut server_handle =
        tokio::spawn(async move { sonant_core::start_server(server_state).await });

    log::info!("Bridge listening on port {}", config.server.port);

    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            sonant_core::api::shutdown(&state).await;
            server_handle.abort();
            log::info!("Shutdown complete");
            Ok(())
        }
        result = &mut server_handle => {
            // The server future only returns on failure.
            match result {
                Ok(Ok(())) => anyhow::bail!("server exited unexpectedly"),
                Ok(Err(err)) => Err(err).context("server failed"),
                Err(join_err) => Err(join_err).context("server task panicked"),
            }
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
