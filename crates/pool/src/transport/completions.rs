// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `POST /v1/completions`: schedule, then relay as SSE or a single body.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::BytesMut;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, PoolError};
use crate::relay::RelayEvent;
use crate::state::PoolState;
use crate::transport::sse::SseEncoder;
use crate::work::WorkRequest;

pub async fn completions(
    State(s): State<Arc<PoolState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, PoolError> {
    let model = body
        .get("model")
        .and_then(serde_json::Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| PoolError::new(ErrorCode::BadRequest, "request body needs a \"model\" string"))?
        .to_owned();
    let streaming = body.get("stream").and_then(serde_json::Value::as_bool).unwrap_or(false);

    let cancel = CancellationToken::new();
    let mut request = WorkRequest::new(model, body, streaming, cancel.clone());
    let reservation = match s.scheduler.select_for(&mut request) {
        Ok(r) => r,
        Err(e) => {
            s.stats.record_rejected();
            tracing::info!(request_id = %request.id(), model = %request.model(), code = %e.code, "request rejected");
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(s.config.stream_buffer);
    let relay_state = Arc::clone(&s);
    tokio::spawn(async move {
        let mut tx = tx;
        let _ = relay_state.relay.stream(reservation, request, &mut tx).await;
    });

    // Dropping the response (client gone) cancels the relay.
    let guard = cancel.drop_guard();
    if streaming {
        Ok(sse_response(rx, guard))
    } else {
        collect_response(rx, guard).await
    }
}

fn sse_response(rx: mpsc::Receiver<RelayEvent>, guard: tokio_util::sync::DropGuard) -> Response {
    let mut encoder = SseEncoder::default();
    let events = ReceiverStream::new(rx)
        .map(move |event| {
            let _held = &guard;
            stream::iter(encoder.encode(event).into_iter().map(Ok::<_, Infallible>))
        })
        .flatten();
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn collect_response(
    mut rx: mpsc::Receiver<RelayEvent>,
    guard: tokio_util::sync::DropGuard,
) -> Result<Response, PoolError> {
    let mut body = BytesMut::new();
    let terminal = loop {
        match rx.recv().await {
            Some(RelayEvent::Chunk(chunk)) => body.extend_from_slice(&chunk),
            Some(terminal) => break terminal,
            None => break RelayEvent::Failed(PoolError::new(ErrorCode::Internal, "relay ended without a result")),
        }
    };
    drop(guard);

    match terminal {
        RelayEvent::Done => {
            Ok(([(header::CONTENT_TYPE, "application/json")], body.freeze()).into_response())
        }
        RelayEvent::Failed(e) => Err(e),
        // Only reachable once the client is gone, so nobody reads this body.
        RelayEvent::Cancelled => Err(PoolError::new(ErrorCode::Cancelled, "request cancelled")),
        RelayEvent::Chunk(_) => Err(PoolError::new(ErrorCode::Internal, "relay ended mid-stream")),
    }
}
