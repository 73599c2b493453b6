// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ring::digest::{digest, SHA256};

use crate::error::{ErrorCode, PoolError};
use crate::state::PoolState;

/// Which credential a route requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Open,
    Agent,
    Client,
    Admin,
}

impl Scope {
    pub fn for_path(path: &str) -> Self {
        if path == "/api/v1/health" {
            Self::Open
        } else if path.starts_with("/api/v1/admin/") {
            Self::Admin
        } else if path.starts_with("/api/v1/agents/") {
            Self::Agent
        } else {
            Self::Client
        }
    }
}

/// Constant-time comparison. Both sides are hashed first so neither the
/// content nor the length of the expected token leaks through timing.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = digest(&SHA256, presented.as_bytes());
    let b = digest(&SHA256, expected.as_bytes());
    let mut acc = 0u8;
    for (x, y) in a.as_ref().iter().zip(b.as_ref()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers. `None` disables the check.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), PoolError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let unauthorized = || PoolError::new(ErrorCode::Unauthorized, "missing or invalid bearer token");

    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or_else(unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;
    if tokens_match(token, expected) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

/// Axum middleware enforcing the credential each route requires.
///
/// Client and agent checks are skipped when their token is unset. The admin
/// surface has no such escape: without an admin token it is closed.
pub async fn auth_layer(
    state: State<Arc<PoolState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let config = &state.config;
    let checked = match Scope::for_path(req.uri().path()) {
        Scope::Open => Ok(()),
        Scope::Agent => validate_bearer(req.headers(), config.agent_token.as_deref()),
        Scope::Client => validate_bearer(req.headers(), config.api_token.as_deref()),
        Scope::Admin => match config.admin_token.as_deref() {
            Some(token) => validate_bearer(req.headers(), Some(token)),
            None => Err(PoolError::new(ErrorCode::Unauthorized, "admin access is not configured")),
        },
    };

    match checked {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
