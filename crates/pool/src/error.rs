// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable machine-readable error codes shared by the registry, scheduler,
/// relay, and HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCapability,
    UnknownAgent,
    CapacityExceeded,
    AgentOffline,
    NoCapableAgents,
    NoAvailableAgents,
    AgentTimeout,
    AgentFailed,
    StoreUnavailable,
    Unauthorized,
    BadRequest,
    /// The caller went away before the request finished.
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCapability => 400,
            Self::UnknownAgent => 404,
            Self::CapacityExceeded => 409,
            Self::AgentOffline => 409,
            Self::NoCapableAgents => 404,
            Self::NoAvailableAgents => 503,
            Self::AgentTimeout => 504,
            Self::AgentFailed => 502,
            Self::StoreUnavailable => 503,
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            // nginx's "client closed request".
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCapability => "INVALID_CAPABILITY",
            Self::UnknownAgent => "UNKNOWN_AGENT",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::AgentOffline => "AGENT_OFFLINE",
            Self::NoCapableAgents => "NO_CAPABLE_AGENTS",
            Self::NoAvailableAgents => "NO_AVAILABLE_AGENTS",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::AgentFailed => "AGENT_FAILED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry the same request later and expect a
    /// different answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoAvailableAgents | Self::StoreUnavailable)
    }

    /// Reliability failures are charged to the agent that was serving.
    pub fn counts_against_agent(&self) -> bool {
        matches!(self, Self::AgentTimeout | Self::AgentFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error code paired with free-text detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolError {
    pub code: ErrorCode,
    pub message: String,
    /// Retry hint in seconds, only meaningful for transient codes.
    pub retry_after_secs: Option<u64>,
}

impl PoolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_secs: None }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code.as_str().to_owned(),
            message: self.message.clone(),
            retry_after_secs: self.retry_after_secs,
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PoolError {}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after_secs;
        let body = ErrorResponse { error: self.to_error_body() };
        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            resp.headers_mut().insert("retry-after", HeaderValue::from(secs));
        }
        resp
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
