// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for agents, clients, and operators.

pub mod auth;
pub mod completions;
pub mod http;
pub mod sse;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::PoolState;

/// Build the axum `Router` with all coordinator routes.
pub fn build_router(state: Arc<PoolState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Agent lifecycle
        .route("/api/v1/agents/register", post(http::register_agent))
        .route("/api/v1/agents/{id}/heartbeat", post(http::heartbeat))
        // Client traffic
        .route("/v1/completions", post(completions::completions))
        // Admin
        .route("/api/v1/admin/agents", get(http::list_agents))
        .route("/api/v1/admin/stats", get(http::stats))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
