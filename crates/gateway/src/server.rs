use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        routing::{get, post},
    },
    deskbridge_config::DeskbridgeConfig,
    tokio_util::sync::CancellationToken,
    tower::ServiceBuilder,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{error, info},
};

use crate::{routes, services::GatewayServices, state::GatewayState};

/// Build the widget API router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    // The widget is embedded on other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let widget = Router::new()
        .route("/sessions", post(routes::open_session))
        .route("/connect", post(routes::connect))
        .route("/disconnect", post(routes::disconnect))
        .route("/messages", post(routes::send_message))
        .route("/history", get(routes::history));

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/departments", get(routes::departments))
        .nest("/api/widget", widget)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start every service and serve the widget API until Ctrl-C.
pub async fn start_gateway(config: DeskbridgeConfig) -> anyhow::Result<()> {
    let services = GatewayServices::init(&config).await?;
    services.startup_maintenance(&config).await;

    let cancel = CancellationToken::new();
    if let Err(e) = services.start_bot_channel(&config, &cancel).await {
        error!(error = format!("{e:#}"), "bot channel not started, relay disabled");
    }

    let app = build_gateway_app(GatewayState::new(Arc::clone(&services.widget)));
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "widget API listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
                () = shutdown.cancelled() => {},
            }
        })
        .await?;
    cancel.cancel();
    Ok(())
}
