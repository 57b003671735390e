//! HTTP and WebSocket bindings for the ASAP reliability runtime.

pub mod handlers;
pub mod http;
pub mod state;
pub mod tasks;
pub mod ws;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use handlers::{EnvelopeHandler, HandlerRegistry};
pub use state::AppState;
pub use tasks::{TaskRecord, TaskStore};

pub const RPC_ROUTE: &str = "/asap";
pub const WS_ROUTE: &str = "/asap/ws";
pub const HEALTH_ROUTE: &str = "/.well-known/asap/health";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(RPC_ROUTE, post(http::handle_rpc))
        .route(WS_ROUTE, get(ws::ws_handler))
        .route(HEALTH_ROUTE, get(http::health))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([CONTENT_TYPE]),
        )
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind ASAP server to {addr}"))
}

/// Serve on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, identity = %state.identity(), "ASAP server listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("ASAP server encountered an unrecoverable error")?;

    tracing::info!("ASAP server stopped");
    Ok(())
}
