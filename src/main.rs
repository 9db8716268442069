//! # Voice Assistant Backend - Main Application Entry Point
//!
//! Sets up an Actix-web server that turns a live audio stream into spoken
//! replies:
//!
//! ## Application Architecture:
//! - **audio**: per-session decoder process bridge and PCM framing
//! - **recognition**: Whisper model, utterance segmentation, wake word gate
//! - **session**: conversation state machine and the session registry
//! - **dispatch**: answer engine, text normalization, synthesis, WAV artifacts
//! - **websocket**: the `/ws/audio` transport, one session per connection
//! - **handlers**: direct ask, configuration, session listing, artifact serving
//! - **health**: health and metrics endpoints
//! - **config** / **error** / **state**: configuration, error types, shared state

mod audio;
mod config;
mod dispatch;
mod error;
mod handlers;
mod health;
mod recognition;
mod services;
mod session;
mod state;
mod websocket;

#[cfg(test)]
mod test_support;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use services::Services;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-assistant-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Model download and load happen here, before the port is bound
    let app_state = Services::initialize(config.clone()).await?;
    info!(
        model = %app_state.model_name,
        max_sessions = config.performance.max_concurrent_sessions,
        "Services initialized"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/ask", web::post().to(handlers::ask)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ask", web::post().to(handlers::ask))
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .route("/static/audio/{slot}/{file}", web::get().to(handlers::serve_audio))
    })
    // Signals are handled below so sessions can be torn down first
    .disable_signals()
    .bind(&bind_addr)?
    .run();

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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    app_state.sessions.shutdown_all().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter, e.g. `voice_assistant_backend=trace`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_assistant_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
