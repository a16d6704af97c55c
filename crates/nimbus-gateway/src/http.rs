// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of the gateway.
//!
//! Three routes: a liveness probe, a graceful-shutdown trigger, and the
//! function-invocation endpoint. The invocation handler parks on a
//! oneshot receiver; the engine completes it from whichever connection
//! task observes the call's settlement.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use nimbus_protocol::FuncConfig;

use crate::engine::Engine;
use crate::error::GatewayError;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// The invocation engine.
    pub engine: Arc<Engine>,
    /// Function name lookups.
    pub func_config: Arc<FuncConfig>,
    /// Graceful-shutdown trigger.
    pub shutdown: watch::Sender<bool>,
}

/// Build the gateway router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/shutdown", post(shutdown))
        .route("/function/{name}", post(invoke_function))
        .with_state(state)
}

/// Serve the router until the shutdown signal fires.
pub async fn run_http_server(
    listener: TcpListener,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("HTTP server running");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|&stop| stop).await;
            info!("HTTP server received shutdown signal");
        })
        .await
}

async fn hello() -> &'static str {
    "Hello world\n"
}

async fn shutdown(State(state): State<HttpState>) -> &'static str {
    warn!("shutdown requested over HTTP");
    let _ = state.shutdown.send(true);
    "Server is shutting down\n"
}

async fn invoke_function(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some(entry) = state.func_config.find_by_func_name(&name) else {
        let err = GatewayError::UnknownFunction { name };
        return (StatusCode::NOT_FOUND, format!("{}\n", err)).into_response();
    };
    let (tx, rx) = oneshot::channel();
    state.engine.new_http_func_call(entry.func_id(), body, tx);
    match rx.await {
        Ok(reply) => {
            let status =
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, reply.body).into_response()
        }
        Err(_) => {
            // The context was dropped without a terminal call; that is an
            // engine bug, not a caller problem.
            error!("call context dropped without finishing");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
