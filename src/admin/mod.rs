//! Operator admin API.
//!
//! Bearer-key protected JSON endpoints. Read-only apart from requeue and
//! drain.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::ledger::LedgerStore;
use crate::settlement::QueueProcessor;

pub use self::handlers::AdminState;

impl AdminState {
    pub fn new(store: LedgerStore, processor: Arc<QueueProcessor>, api_key: &str) -> Self {
        Self {
            store,
            processor,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/queue", get(get_queue))
        .route("/admin/tx/{id}", get(get_tx))
        .route("/admin/tx/{id}/requeue", post(requeue_tx))
        .route("/admin/drain", post(trigger_drain))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until the shutdown broadcast fires.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
