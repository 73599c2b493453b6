// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::PoolError;

/// What the relay writes into a sink: chunks, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Chunk(Bytes),
    Done,
    Failed(PoolError),
    Cancelled,
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Destination for relayed output.
pub trait EventSink: Send {
    /// Deliver one event, waiting for room. Returns `false` once the
    /// receiving side has gone away.
    fn send(&mut self, event: RelayEvent) -> impl Future<Output = bool> + Send;
}

impl EventSink for mpsc::Sender<RelayEvent> {
    async fn send(&mut self, event: RelayEvent) -> bool {
        mpsc::Sender::send(self, event).await.is_ok()
    }
}
