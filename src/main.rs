//! # Live Transcription Relay
//!
//! WebSocket relay bridging browser audio sessions with a realtime
//! transcription provider. Clients connect to `/v1/transcriptions`,
//! send a JSON start message followed by binary PCM16 audio frames, and
//! receive partial/final transcripts back as JSON.
//!
//! ## Architecture:
//! - **config**: layered configuration (defaults, config.toml, env)
//! - **state**: shared config, metrics, and the credential HTTP client
//! - **websocket**: the per-connection session coordinator actor
//! - **relay**: the provider-side streaming task and both forwarders
//! - **provider**: credential minting, link setup, wire-event parsing
//! - **health**: health and metrics endpoints
//! - **middleware**: request metrics collection

mod config;
mod error;
mod health;
mod middleware;
mod provider;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Process-wide shutdown flag set by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    config.validate()?;

    init_tracing(&config.logging.level)?;

    info!("Starting live-transcribe-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, model {}",
        config.server.host, config.server.port, config.provider.model
    );

    if config.provider.api_key.is_empty() {
        // The server still starts so the health endpoint stays useful,
        // but every session will fail to authorize.
        error!("OPENAI_API_KEY is not set; transcription sessions will fail");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .route(
                "/v1/transcriptions",
                web::get().to(websocket::transcription_websocket),
            )
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` wins, otherwise the configured level
/// applies to this crate with actix kept at info.
fn init_tracing(default_level: &str) -> Result<()> {
    let fallback = format!("live_transcribe_relay={},actix_web=info", default_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
