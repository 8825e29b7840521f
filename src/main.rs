//! # Speech Relay - Main Application Entry Point
//!
//! Starts two listeners that share one `AppState`:
//! - the **streaming endpoint** (tokio-tungstenite), where clients send audio and receive
//!   transcripts
//! - the **ops HTTP API** (actix-web): health, metrics, effective config, live sessions
//!
//! Recognition models are resolved once at startup so a missing model fails the process
//! instead of every session.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use speech_relay::config::AppConfig;
use speech_relay::session::SessionContext;
use speech_relay::state::AppState;
use speech_relay::transcription::{EngineFactory, WhisperEngineFactory};
use speech_relay::websocket::StreamServer;
use speech_relay::{handlers, health, middleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives; both listeners watch it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: ops http://{}, stream ws://{}",
        config.server_addr(),
        config.stream_addr()
    );

    let factory: Arc<dyn EngineFactory> =
        Arc::new(WhisperEngineFactory::prepare(&config.recognition).await?);
    info!("Recognition engine '{}' ready", factory.name());

    let app_state = AppState::new(config.clone());
    let ctx = SessionContext {
        state: app_state.clone(),
        factory: Arc::clone(&factory),
    };

    setup_signal_handlers();

    let stream_server = StreamServer::bind(&config.stream_addr(), ctx).await?;
    let stream_task = tokio::spawn(stream_server.run_until(wait_for_shutdown()));

    let bind_addr = config.server_addr();
    info!("Starting ops HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::from(Arc::clone(&factory)))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
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
                Ok(Err(e)) => error!("Ops server error: {}", e),
                Err(e) => error!("Ops server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping servers...");
            server_handle.stop(true).await;
        }
    }

    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    if let Err(e) = stream_task.await {
        error!("Stream server task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default `speech_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
