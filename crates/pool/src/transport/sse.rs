// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay events rendered as server-sent events.

use axum::response::sse::Event;

use crate::error::ErrorBody;
use crate::relay::RelayEvent;

/// Incremental UTF-8 decoder that holds back a trailing partial sequence
/// until the bytes completing it arrive.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode as much of `pending + chunk` as forms complete characters.
    /// Invalid sequences become U+FFFD.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Stateful translation of relay events into SSE frames.
#[derive(Debug, Default)]
pub struct SseEncoder {
    carry: Utf8Carry,
}

impl SseEncoder {
    pub fn encode(&mut self, event: RelayEvent) -> Vec<Event> {
        let mut frames = Vec::with_capacity(1);
        match event {
            RelayEvent::Chunk(bytes) => {
                let text = self.carry.push(&bytes);
                if !text.is_empty() {
                    frames.push(chunk(text));
                }
            }
            terminal => {
                if let Some(rest) = self.carry.finish() {
                    frames.push(chunk(rest));
                }
                frames.push(terminal_frame(terminal));
            }
        }
        frames
    }
}

fn chunk(text: String) -> Event {
    Event::default().event("chunk").data(text)
}

fn terminal_frame(event: RelayEvent) -> Event {
    match event {
        RelayEvent::Failed(e) => {
            let body = ErrorBody { code: e.code.as_str().to_owned(), message: e.message, retry_after_secs: None };
            Event::default()
                .event("error")
                .json_data(&body)
                .unwrap_or_else(|_| Event::default().event("error").data(body.code))
        }
        RelayEvent::Cancelled => Event::default().event("cancelled").data("{}"),
        RelayEvent::Done | RelayEvent::Chunk(_) => Event::default().event("done").data("[DONE]"),
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
