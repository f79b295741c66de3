//! # Voice Input Backend - Main Application Entry Point
//!
//! An actix-web server exposing a memory-expensive speech recognition model
//! to multiple concurrent WebSocket sessions while keeping it unloaded when
//! idle.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state wiring the singletons together
//! - **model**: the recognizer, its lifecycle manager, and the idle monitor
//! - **session**: the WebSocket protocol and the connected-session registry
//! - **websocket**: the per-connection session actor
//! - **handlers / health**: the REST surface
//! - **middleware**: request metrics and logging
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the whole server is asynchronous on tokio
//! - **Arc**: one lifecycle manager and one registry shared by every task
//! - **actors**: each WebSocket connection is an independent actix actor

mod audio;      // Audio payload decoding
mod config;     // Configuration management
mod device;     // Compute device selection
mod error;      // HTTP error types
mod handlers;   // REST request handlers
mod health;     // Health and metrics endpoints
mod middleware; // Request metrics middleware
mod model;      // Recognizer lifecycle management
mod session;    // WebSocket protocol and session registry
mod state;      // Shared application state
mod websocket;  // WebSocket session actor

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use model::IdleMonitor;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag flipped by the signal handler task. AtomicBool so
/// every task can read it without locking.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-input-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, model '{}', idle timeout {}s",
        config.server.host,
        config.server.port,
        config.model.size,
        config.lifecycle.idle_timeout_secs
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Background eviction of an idle model; aborted on shutdown
    let idle_monitor = IdleMonitor::new(
        Arc::clone(&app_state.lifecycle),
        Duration::from_secs(config.lifecycle.idle_check_interval_secs),
    )
    .spawn();

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
            .wrap(Logger::default())
            .wrap(middleware::RequestMetrics)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/model", web::get().to(handlers::model_status))
                    .route("/model/load", web::post().to(handlers::load_model))
                    .route("/model/unload", web::post().to(handlers::unload_model)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
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

    idle_monitor.abort();
    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging via tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_input_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or SIGINT so in-flight requests can
/// finish before the process exits.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

/// Poll the shutdown flag without busy-waiting.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
