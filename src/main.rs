//! # Transcribe Gateway - Main Application Entry Point
//!
//! HTTP front door for the transcription worker. Requests arrive over HTTP and are
//! relayed to the worker as RPC calls over RabbitMQ; the worker's reply becomes the
//! HTTP response.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **rpc**: Broker transport, pending-call registry and the request/reply bridge
//! - **handlers**: HTTP endpoints that map onto worker commands
//! - **health**: Gateway liveness and metrics endpoints
//! - **middleware**: Per-endpoint request metrics
//! - **state**: Shared configuration and metrics
//! - **error**: Error types and their HTTP responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod rpc;
mod state;

use actix_cors::Cors;
use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use rpc::{AmqpTransport, RpcBridge};
use state::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Connects to the broker** and builds the RPC bridge on top of it
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**, then closes the broker connection
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcribe-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, worker queue '{}'",
        config.server.host, config.server.port, config.broker.queue
    );

    let transport = AmqpTransport::connect_with_retry(&config.broker)
        .await
        .with_context(|| format!("could not connect to broker at {}", config.broker.url))?;
    let bridge = web::Data::new(RpcBridge::new(Arc::new(transport), config.broker.queue.clone())?);

    let app_state = web::Data::new(AppState::new(config.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = {
        let bridge = bridge.clone();
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .app_data(app_state.clone())
                .app_data(bridge.clone())
                // Middleware executes in reverse order for responses
                .wrap(cors)
                .wrap(from_fn(middleware::request_metrics))
                .wrap(TracingLogger::default())
                .configure(handlers::configure)
        })
        .bind(&bind_addr)?
        .run()
    };

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    bridge.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "transcribe_gateway=trace")
/// - If not set, defaults to "transcribe_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Listen for SIGTERM / SIGINT and flip the returned watch channel to `true`.
fn setup_signal_handlers() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        }

        let _ = tx.send(true);
    });

    rx
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Signal task gave up; keep serving until the server exits on its own.
            std::future::pending::<()>().await;
        }
    }
}
