use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chatbet_gateway::coordinator::EchoCoordinator;
use chatbet_gateway::websocket::WebSocketServer;
use chatbet_gateway::{health_check, status, AppState, Settings};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    // Load configuration
    let config = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded successfully");

    let shutdown = CancellationToken::new();
    // The echo coordinator stands in until a conversation engine is wired
    // in by the embedding service.
    let state = AppState::new(config, Arc::new(EchoCoordinator), shutdown.clone());
    let settings = state.settings.clone();

    // Start the WebSocket listener on its own port
    let ws_addr = format!("{}:{}", settings.server.host, settings.server.ws_port);
    let ws_listener = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", ws_addr))?;
    info!("WebSocket server ready at ws://{}/ws", ws_addr);

    let ws_server = Arc::new(WebSocketServer::new(&state, shutdown.clone()));
    tokio::spawn(async move {
        if let Err(e) = ws_server.run(ws_listener).await {
            error!("WebSocket listener failed: {}", e);
        }
    });

    let http_addr = format!("{}:{}", settings.server.host, settings.server.http_port);
    info!(
        "Starting HTTP server at {} ({} workers)",
        http_addr, settings.server.workers
    );

    let state = web::Data::new(state);
    let http_settings = settings.clone();
    HttpServer::new(move || {
        let cors = if http_settings.cors.enabled {
            let cors_config = Cors::default();

            let cors_config = if http_settings.cors.allow_any_origin {
                cors_config
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .expose_any_header()
            } else {
                cors_config
                    .allowed_origin("http://localhost:8080")
                    .allowed_origin("http://127.0.0.1:8080")
                    .allowed_methods(vec!["GET"])
                    .allowed_headers(vec!["Content-Type"])
            };

            cors_config.max_age(http_settings.cors.max_age as usize)
        } else {
            Cors::default()
        };

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .route("/status", web::get().to(status))
    })
    .bind(&http_addr)
    .with_context(|| format!("failed to bind HTTP server on {}", http_addr))?
    .workers(settings.server.workers as usize)
    .run()
    .await?;

    // The HTTP server handles SIGINT itself; once it is down, take the
    // WebSocket side and the actors with it.
    info!("HTTP server stopped, shutting down gateway");
    shutdown.cancel();

    Ok(())
}
