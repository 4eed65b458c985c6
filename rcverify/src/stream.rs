//! Streaming analysis progress.
//!
//! The streaming analyze endpoint answers with a chunked body of
//! newline-terminated lines; every line of the form `data: <json>` carries one
//! event. Three layers consume it:
//!
//! - [`EventDecoder`]: a synchronous byte-level state machine. Chunk boundaries
//!   may fall anywhere (mid-line, mid-JSON, mid-UTF-8 sequence) without changing
//!   the decoded sequence.
//! - [`AnalysisStream`]: a lazy, finite, non-restartable async sequence of
//!   [`AnalysisEvent`]s read from any chunk stream, cancellable via [`CancelToken`].
//! - [`AnalysisStream::dispatch`]: drives the sequence into an
//!   [`AnalysisHandler`] (progress / complete / error callbacks).

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ClientError, ClientResult};
use crate::types::AnalysisResultBatch;

/// Prefix of every event-carrying line
pub const EVENT_LINE_PREFIX: &str = "data:";

/// One decoded event of an analysis job
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Progress {
        current: u32,
        total: u32,
        label: String,
    },
    Complete(AnalysisResultBatch),
    Error(String),
}

impl AnalysisEvent {
    /// `Complete` and `Error` end the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisEvent::Progress { .. })
    }
}

// Servers name the same field differently and some send several spellings at
// once, so each spelling is its own optional field rather than a serde alias.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Progress {
        current: u32,
        total: u32,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        element: Option<String>,
        #[serde(default)]
        pier: Option<String>,
    },
    Complete(AnalysisResultBatch),
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

enum Line {
    Event(AnalysisEvent),
    Ignored,
    Malformed,
}

fn decode_line(raw: &[u8]) -> Line {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Skipping event line with invalid UTF-8: {}", e);
            return Line::Malformed;
        }
    };

    // Blank keep-alives, SSE comments and `event:`/`id:` fields carry nothing for us
    let Some(payload) = text.strip_prefix(EVENT_LINE_PREFIX) else {
        return Line::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Line::Ignored;
    }

    match serde_json::from_str::<WireEvent>(payload) {
        Ok(WireEvent::Progress { current, total, .. }) if current > total => {
            tracing::warn!("Skipping progress event with current {} > total {}", current, total);
            Line::Malformed
        }
        Ok(WireEvent::Progress {
            current,
            total,
            label,
            element,
            pier,
        }) => Line::Event(AnalysisEvent::Progress {
            current,
            total,
            label: first_non_empty([label, element, pier]).unwrap_or_default(),
        }),
        Ok(WireEvent::Complete(batch)) => Line::Event(AnalysisEvent::Complete(batch)),
        Ok(WireEvent::Error { message, error }) => {
            let message =
                first_non_empty([message, error]).unwrap_or_else(|| "Analysis failed".to_string());
            Line::Event(AnalysisEvent::Error(message))
        }
        Err(e) => {
            tracing::warn!("Skipping malformed event line ({}): {:.120}", e, payload);
            Line::Malformed
        }
    }
}

/// Incremental decoder for the `data: <json>` line protocol
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    finished: bool,
    malformed: usize,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every event completed by it in arrival order.
    ///
    /// An unterminated tail stays buffered for the next chunk. Once a terminal
    /// event has been produced all further input is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AnalysisEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            let line = decode_line(&self.buffer[consumed..end]);
            consumed = end + 1;

            match line {
                Line::Event(event) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        self.finished = true;
                        break;
                    }
                }
                Line::Malformed => self.malformed += 1,
                Line::Ignored => {}
            }
        }

        if self.finished {
            self.buffer = Vec::new();
        } else {
            self.buffer.drain(..consumed);
        }
        events
    }

    /// Decode whatever unterminated line is left once the body has ended.
    pub fn finish(&mut self) -> Option<AnalysisEvent> {
        if self.finished || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        match decode_line(&tail) {
            Line::Event(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            Line::Malformed => {
                self.malformed += 1;
                None
            }
            Line::Ignored => None,
        }
    }

    /// Whether a `complete` or `error` event has been produced
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of lines skipped because they could not be decoded
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }
}

/// Cooperative cancellation shared between the stream reader and its owner
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { state: Arc::new(tx) }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = ClientResult<Vec<u8>>> + Send>>;

/// Async sequence of events from one streaming analysis
pub struct AnalysisStream {
    chunks: ChunkStream,
    decoder: EventDecoder,
    pending: VecDeque<AnalysisEvent>,
    cancel: CancelToken,
    eof: bool,
    done: bool,
}

impl AnalysisStream {
    pub fn from_chunks<S>(chunks: S, cancel: CancelToken) -> Self
    where
        S: Stream<Item = ClientResult<Vec<u8>>> + Send + 'static,
    {
        Self {
            chunks: Box::pin(chunks),
            decoder: EventDecoder::new(),
            pending: VecDeque::new(),
            cancel,
            eof: false,
            done: false,
        }
    }

    /// Next event in arrival order.
    ///
    /// `Ok(None)` once a terminal event has been returned. A transport failure,
    /// a body that ends without a terminal event, or cancellation is returned
    /// as `Err` exactly once, after which the sequence is exhausted.
    pub async fn next_event(&mut self) -> ClientResult<Option<AnalysisEvent>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                }
                return Ok(Some(event));
            }

            if self.eof {
                self.done = true;
                return Err(ClientError::StreamEnded);
            }

            if self.cancel.is_cancelled() {
                self.done = true;
                return Err(ClientError::Cancelled);
            }

            let cancel = self.cancel.clone();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = self.chunks.next() => Some(chunk),
            };

            match next {
                None => {
                    tracing::info!("Streaming analysis cancelled");
                    self.done = true;
                    return Err(ClientError::Cancelled);
                }
                Some(Some(Ok(chunk))) => {
                    let events = self.decoder.push(&chunk);
                    self.pending.extend(events);
                }
                Some(Some(Err(e))) => {
                    tracing::warn!("Analysis stream failed: {}", e);
                    self.done = true;
                    return Err(e);
                }
                Some(None) => {
                    self.eof = true;
                    if let Some(event) = self.decoder.finish() {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }

    /// Lines skipped so far because they could not be decoded
    pub fn malformed_lines(&self) -> usize {
        self.decoder.malformed_lines()
    }

    /// Drive the stream to its end, invoking `handler` for each event.
    ///
    /// `on_error` is called at most once and never after `on_complete`;
    /// cancellation ends the run silently.
    pub async fn dispatch<H>(mut self, handler: &mut H) -> StreamOutcome
    where
        H: AnalysisHandler + ?Sized,
    {
        loop {
            match self.next_event().await {
                Ok(Some(AnalysisEvent::Progress { current, total, label })) => {
                    handler.on_progress(current, total, &label);
                }
                Ok(Some(AnalysisEvent::Complete(batch))) => {
                    tracing::info!("Analysis complete: {} elements", batch.len());
                    handler.on_complete(batch);
                    return StreamOutcome::Completed;
                }
                Ok(Some(AnalysisEvent::Error(message))) => {
                    tracing::warn!("Analysis reported error: {}", message);
                    handler.on_error(ClientError::Server(message));
                    return StreamOutcome::Failed;
                }
                Ok(None) => {
                    handler.on_error(ClientError::StreamEnded);
                    return StreamOutcome::Failed;
                }
                Err(ClientError::Cancelled) => return StreamOutcome::Cancelled,
                Err(e) => {
                    handler.on_error(e);
                    return StreamOutcome::Failed;
                }
            }
        }
    }
}

/// How a streaming analysis run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Consumer callbacks for a streaming analysis
pub trait AnalysisHandler {
    fn on_progress(&mut self, current: u32, total: u32, label: &str);

    fn on_complete(&mut self, batch: AnalysisResultBatch);

    fn on_error(&mut self, error: ClientError);
}

/// [`AnalysisHandler`] built from three closures
pub struct FnHandler<P, C, E> {
    pub on_progress: P,
    pub on_complete: C,
    pub on_error: E,
}

pub fn handler_fn<P, C, E>(on_progress: P, on_complete: C, on_error: E) -> FnHandler<P, C, E>
where
    P: FnMut(u32, u32, &str),
    C: FnMut(AnalysisResultBatch),
    E: FnMut(ClientError),
{
    FnHandler {
        on_progress,
        on_complete,
        on_error,
    }
}

impl<P, C, E> AnalysisHandler for FnHandler<P, C, E>
where
    P: FnMut(u32, u32, &str),
    C: FnMut(AnalysisResultBatch),
    E: FnMut(ClientError),
{
    fn on_progress(&mut self, current: u32, total: u32, label: &str) {
        (self.on_progress)(current, total, label)
    }

    fn on_complete(&mut self, batch: AnalysisResultBatch) {
        (self.on_complete)(batch)
    }

    fn on_error(&mut self, error: ClientError) {
        (self.on_error)(error)
    }
}
