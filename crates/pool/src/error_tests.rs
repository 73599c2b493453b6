// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::response::IntoResponse;

use super::*;

#[yare::parameterized(
    invalid_capability = { ErrorCode::InvalidCapability, 400, "INVALID_CAPABILITY" },
    unknown_agent = { ErrorCode::UnknownAgent, 404, "UNKNOWN_AGENT" },
    no_capable = { ErrorCode::NoCapableAgents, 404, "NO_CAPABLE_AGENTS" },
    no_available = { ErrorCode::NoAvailableAgents, 503, "NO_AVAILABLE_AGENTS" },
    agent_timeout = { ErrorCode::AgentTimeout, 504, "AGENT_TIMEOUT" },
    agent_failed = { ErrorCode::AgentFailed, 502, "AGENT_FAILED" },
    unauthorized = { ErrorCode::Unauthorized, 401, "UNAUTHORIZED" },
    cancelled = { ErrorCode::Cancelled, 499, "CANCELLED" },
)]
fn code_mapping(code: ErrorCode, status: u16, wire: &str) {
    assert_eq!(code.http_status(), status);
    assert_eq!(code.as_str(), wire);
    assert_eq!(code.to_string(), wire);
}

#[test]
fn serde_uses_wire_strings() -> anyhow::Result<()> {
    let json = serde_json::to_string(&ErrorCode::NoAvailableAgents)?;
    assert_eq!(json, "\"NO_AVAILABLE_AGENTS\"");
    let back: ErrorCode = serde_json::from_str("\"AGENT_FAILED\"")?;
    assert_eq!(back, ErrorCode::AgentFailed);
    Ok(())
}

#[test]
fn only_relay_failures_count_against_agent() {
    assert!(ErrorCode::AgentTimeout.counts_against_agent());
    assert!(ErrorCode::AgentFailed.counts_against_agent());
    assert!(!ErrorCode::NoAvailableAgents.counts_against_agent());
    assert!(!ErrorCode::CapacityExceeded.counts_against_agent());
    assert!(!ErrorCode::Cancelled.counts_against_agent());
}

#[test]
fn transient_codes() {
    assert!(ErrorCode::NoAvailableAgents.is_transient());
    assert!(!ErrorCode::NoCapableAgents.is_transient());
}

#[test]
fn retry_after_sets_header() {
    let err = PoolError::new(ErrorCode::NoAvailableAgents, "busy").with_retry_after(30);
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 503);
    let header = resp.headers().get("retry-after").and_then(|v| v.to_str().ok());
    assert_eq!(header, Some("30"));
}

#[test]
fn display_includes_code_and_detail() {
    let err = PoolError::new(ErrorCode::UnknownAgent, "agent a1 is not registered");
    assert_eq!(err.to_string(), "UNKNOWN_AGENT: agent a1 is not registered");
    assert!(err.to_error_body().retry_after_secs.is_none());
}
