// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY Bridge (PB) — §4.5.
//!
//! One instance per `(session, client stream)` pair. Owns the attached
//! [`Pty`] exclusively for its lifetime; two pump tasks move bytes in each
//! direction through bounded channels, and a supervisor task selects over
//! both pumps plus the heartbeat timer, matching the single-task-owns-
//! multiple-branches shape used by the sweeper (§4.4) and the AES crash
//! probe (§4.3).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::{Pty, PtySize};

/// Maximum single-frame payload, per §6/§8 boundary behavior.
const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Downstream read buffer and coalescing thresholds, per §4.5.
const DOWNSTREAM_READ_BUF: usize = 8 * 1024;
const COALESCE_WINDOW: Duration = Duration::from_millis(2);
const COALESCE_MAX_BYTES: usize = 32 * 1024;
/// Bounded channel capacity between raw read and frame emission, per §4.5.
const CHANNEL_CAPACITY: usize = 16;
/// Heartbeat cadence and missed-pong budget, per §4.5.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;
/// Bad-control-frame flood threshold, per §4.5.
const BAD_FRAME_LIMIT: usize = 16;
const BAD_FRAME_WINDOW: Duration = Duration::from_secs(10);
/// Cancellation drain budget, per §5.
const CANCEL_DRAIN_BUDGET: Duration = Duration::from_millis(100);

/// Which frame type the downstream pump emits by default, per §4.6 — `/pty`
/// prefers Binary, `/ws` prefers Text (raw UTF-8, not line-buffered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Binary,
    Text,
}

/// Why the bridge returned, per §4.5's completion semantics — the caller
/// (Transport Endpoint) uses this to decide the session's next state.
#[derive(Debug)]
pub enum BridgeOutcome {
    /// PTY reached EOF: the container process exited.
    PtyClosed,
    /// Client closed the stream cleanly; container is still running.
    ClientClosed,
    /// SM requested cancellation (e.g. operator delete).
    Cancelled,
    /// Two consecutive missed pongs.
    HeartbeatTimeout,
    /// Control-frame flood or oversized frame.
    SecurityViolation(String),
}

#[derive(Debug)]
enum UpstreamItem {
    Data(Vec<u8>),
    Resize(PtySize),
    Pong,
    /// Recognized-but-inapplicable control (e.g. `resize` with a zero
    /// dimension) or an unrecognized control kind — logged and dropped,
    /// per §4.5, but does not count toward the flood threshold.
    Dropped,
    /// Malformed JSON in a `{`-prefixed text frame — counts toward the
    /// flood threshold.
    BadFrame,
    TooLarge,
}

/// Run the bridge to completion, consuming both halves of the PTY and the
/// client socket. Returns once either side is closed, the heartbeat times
/// out, or `cancel` fires.
pub async fn run(mut pty: Pty, socket: WebSocket, mode: FrameMode, cancel: CancellationToken) -> BridgeOutcome {
    let (mut ws_sink, ws_stream) = socket.split();
    let (down_tx, mut down_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (up_tx, mut up_rx) = mpsc::channel::<UpstreamItem>(CHANNEL_CAPACITY);

    let downstream_handle = tokio::spawn(downstream_pump(pty.reader, down_tx));
    let upstream_handle = tokio::spawn(upstream_pump(ws_stream, up_tx));

    let mut missed_pongs = 0u32;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; consume it so the cadence starts at 30s.
    let mut bad_frames: VecDeque<Instant> = VecDeque::new();

    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break BridgeOutcome::Cancelled;
            }

            maybe_chunk = down_rx.recv() => {
                match maybe_chunk {
                    Some(bytes) => {
                        if ws_sink.send(downstream_frame(mode, &bytes)).await.is_err() {
                            break BridgeOutcome::ClientClosed;
                        }
                    }
                    None => break BridgeOutcome::PtyClosed,
                }
            }

            maybe_item = up_rx.recv() => {
                match maybe_item {
                    Some(UpstreamItem::Data(bytes)) => {
                        if pty.writer.write_all(&bytes).await.is_err() {
                            break BridgeOutcome::PtyClosed;
                        }
                    }
                    Some(UpstreamItem::Resize(size)) => {
                        if let Err(err) = pty.control.resize(size).await {
                            debug!(%err, "resize rejected");
                        }
                    }
                    Some(UpstreamItem::Pong) => {
                        missed_pongs = 0;
                    }
                    Some(UpstreamItem::Dropped) => {
                        debug!("dropped unrecognized or inapplicable control frame");
                    }
                    Some(UpstreamItem::BadFrame) => {
                        let now = Instant::now();
                        bad_frames.push_back(now);
                        while bad_frames.front().is_some_and(|t| now.duration_since(*t) > BAD_FRAME_WINDOW) {
                            bad_frames.pop_front();
                        }
                        if bad_frames.len() > BAD_FRAME_LIMIT {
                            break BridgeOutcome::SecurityViolation(
                                "too many malformed control frames".to_owned(),
                            );
                        }
                    }
                    Some(UpstreamItem::TooLarge) => {
                        break BridgeOutcome::SecurityViolation("frame exceeded 64 KiB".to_owned());
                    }
                    None => break BridgeOutcome::ClientClosed,
                }
            }

            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    break BridgeOutcome::HeartbeatTimeout;
                }
                missed_pongs += 1;
                if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break BridgeOutcome::ClientClosed;
                }
            }
        }
    };

    if matches!(outcome, BridgeOutcome::Cancelled) {
        let drain_deadline = tokio::time::sleep(CANCEL_DRAIN_BUDGET);
        tokio::pin!(drain_deadline);
        loop {
            tokio::select! {
                _ = &mut drain_deadline => break,
                maybe_chunk = down_rx.recv() => {
                    match maybe_chunk {
                        Some(bytes) => {
                            if ws_sink.send(downstream_frame(mode, &bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    downstream_handle.abort();
    upstream_handle.abort();
    pty.control.close().await;

    if mode == FrameMode::Text {
        let _ = ws_sink.send(Message::Text(EXIT_INTERACTIVE_FRAME.into())).await;
    }

    if let Some((code, reason)) = close_code_for(&outcome) {
        let _ = ws_sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
    }
    let _ = ws_sink.close().await;

    outcome
}

/// Wire encoding for a downstream chunk, per §6/§9 — `/pty` forwards the raw
/// bytes, `/ws` wraps them in the legacy text-transport control envelope so a
/// plain-text client can tell PTY output apart from a future control type.
fn downstream_frame(mode: FrameMode, bytes: &[u8]) -> Message {
    match mode {
        FrameMode::Binary => Message::Binary(bytes.to_vec().into()),
        FrameMode::Text => {
            let envelope = serde_json::json!({
                "type": "pty_output",
                "data": String::from_utf8_lossy(bytes),
            });
            Message::Text(envelope.to_string().into())
        }
    }
}

/// Sent once, on every bridge exit, to `/ws` clients only — tells a
/// plain-text client the interactive session ended, per §6.
const EXIT_INTERACTIVE_FRAME: &str = r#"{"type":"exit_interactive"}"#;

/// WebSocket close code/reason for outcomes the bridge itself decides to
/// close with a specific code, per §6/§8. Outcomes driven by a plain client
/// or PTY disconnect carry no extra close frame — the underlying socket is
/// already gone or closing normally.
fn close_code_for(outcome: &BridgeOutcome) -> Option<(u16, &'static str)> {
    match outcome {
        BridgeOutcome::HeartbeatTimeout => Some((4008, "idle timeout")),
        BridgeOutcome::SecurityViolation(_) => Some((4011, "security violation")),
        _ => None,
    }
}

/// Reads PTY bytes into a bounded buffer, coalescing immediately-following
/// reads within 2 ms up to 32 KiB total, per §4.5.
async fn downstream_pump(
    mut reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = vec![0u8; DOWNSTREAM_READ_BUF];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "pty read failed");
                return;
            }
        };
        let mut chunk = buf[..n].to_vec();

        while chunk.len() < COALESCE_MAX_BYTES {
            match tokio::time::timeout(COALESCE_WINDOW, reader.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(more)) => chunk.extend_from_slice(&buf[..more]),
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

/// Reads raw client frames, demultiplexes the control-message grammar, and
/// forwards the result, per §4.5/§6.
async fn upstream_pump(mut stream: SplitStream<WebSocket>, tx: mpsc::Sender<UpstreamItem>) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => return,
        };
        let item = match message {
            Message::Binary(bytes) => {
                if bytes.len() > MAX_FRAME_BYTES {
                    UpstreamItem::TooLarge
                } else {
                    UpstreamItem::Data(bytes.to_vec())
                }
            }
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    UpstreamItem::TooLarge
                } else {
                    parse_text_frame(&text)
                }
            }
            Message::Pong(_) => UpstreamItem::Pong,
            Message::Ping(_) => continue,
            Message::Close(_) => return,
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }
}

/// Demultiplex a text frame per §6: raw UTF-8 if it doesn't start with `{`;
/// otherwise a control message with exactly one recognized top-level key
/// (`resize`). JSON syntax errors count toward the flood threshold; a
/// well-formed-but-inapplicable or unrecognized control does not.
fn parse_text_frame(text: &str) -> UpstreamItem {
    if !text.starts_with('{') {
        return UpstreamItem::Data(text.as_bytes().to_vec());
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return UpstreamItem::BadFrame,
    };
    match value.get("resize") {
        Some(resize_value) => match serde_json::from_value::<(u16, u16)>(resize_value.clone()) {
            Ok((cols, rows)) if cols != 0 && rows != 0 => UpstreamItem::Resize(PtySize { cols, rows }),
            Ok(_) => UpstreamItem::Dropped,
            Err(_) => UpstreamItem::BadFrame,
        },
        None => UpstreamItem::Dropped,
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
