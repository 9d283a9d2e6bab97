//! # Wellness Call Backend - Main Application Entry Point
//!
//! Boots the whole service: configuration, logging, the shared state, the
//! telephony and realtime-AI managers, the ARI event loop, and the
//! operational HTTP API.
//!
//! ## Application Architecture:
//! - **config / state / error**: configuration, shared state and the error
//!   taxonomy
//! - **telephony**: Asterisk ARI client and per-call channel management
//! - **openai**: realtime speech sessions (socket ownership, commit
//!   scheduling, reconnection)
//! - **audio**: mu-law ⇄ PCM16 transcoding and the pending-frame queue
//! - **events**: the notification bus linking the two sides
//! - **conversation**: the persistence collaborator boundary
//! - **handlers / middleware / health**: the HTTP surface

mod audio;
mod config;
mod conversation;
mod error;
mod events;
mod handlers;
mod health;
mod middleware;
mod openai;
mod state;
mod telephony;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use conversation::InMemoryConversationStore;
use events::NotificationBus;
use openai::RealtimeSessionManager;
use state::AppState;
use telephony::{AriClient, CallSessionManager};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting wellness-call-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, ARI app '{}'",
        config.server.host, config.server.port, config.asterisk.app_name
    );
    if config.openai.api_key.is_empty() {
        error!("OPENAI_API_KEY is not set; realtime sessions will fail to authenticate");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Explicit service construction: every collaborator is built here and
    // handed down, no implicit singletons.
    let bus = NotificationBus::new();
    let store: Arc<dyn conversation::ConversationStore> = Arc::new(InMemoryConversationStore::new());
    let ari = Arc::new(AriClient::new(config.asterisk.clone()));
    let realtime = Arc::new(RealtimeSessionManager::new(
        bus.clone(),
        store.clone(),
        app_state.clone(),
    ));
    let calls = Arc::new(CallSessionManager::new(
        ari,
        realtime.clone(),
        store,
        bus,
        app_state.clone(),
    ));

    let ari_loop = calls.spawn_ari_event_loop();
    let forwarder = calls.spawn_event_forwarder();
    let sweeper = realtime.spawn_idle_sweeper(Duration::from_secs(30));

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let realtime_data = web::Data::new(realtime.clone());
    let calls_data = web::Data::new(calls.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(realtime_data.clone())
            .app_data(calls_data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::Telemetry)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{call_id}/message", web::post().to(handlers::send_text))
                    .route("/calls/{call_id}", web::delete().to(handlers::end_call)),
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

    // Close live AI sessions before the process goes away so calls do not
    // linger half-bridged inside Asterisk.
    realtime.shutdown().await;
    ari_loop.abort();
    forwarder.abort();
    sweeper.abort();

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wellness_call_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
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

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
