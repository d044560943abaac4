//! Observability event types and per-thread streaming.
//!
//! Every analysis emits typed lifecycle events keyed by its thread id.
//! Delivery is fan-out: a bounded ring buffer per thread for polling
//! clients plus live push subscribers. Producers never block on slow
//! consumers; a subscriber that falls behind is sent a terminal error
//! event and disconnected.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Suggested client polling cadence in milliseconds.
pub const POLLING_INTERVAL_MS: u64 = 500;

/// Types of lifecycle events emitted during an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Analysis accepted, thread created
    RunStart,
    /// A stage began
    StageStart,
    /// A stage finished
    StageEnd,
    /// A retrieval or reasoner tool call began
    ToolCallStart,
    /// A retrieval or reasoner tool call finished
    ToolCallEnd,
    /// A decision was written (provisional or final)
    DecisionEmitted,
    /// Something went wrong; the analysis may still complete degraded
    Error,
    /// Free-form progress update
    StatusUpdate,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RunStart => "RUN_START",
            Self::StageStart => "STAGE_START",
            Self::StageEnd => "STAGE_END",
            Self::ToolCallStart => "TOOL_CALL_START",
            Self::ToolCallEnd => "TOOL_CALL_END",
            Self::DecisionEmitted => "DECISION_EMITTED",
            Self::Error => "ERROR",
            Self::StatusUpdate => "STATUS_UPDATE",
        };
        write!(f, "{}", s)
    }
}

/// A lifecycle event for one analysis thread.
///
/// Append-only; per-thread ordered by timestamp, globally ordered by
/// `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    /// Globally monotonic sequence number, assigned at emit time
    pub event_id: u64,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl ObservabilityEvent {
    /// Create an event; the id is assigned when the streamer accepts it.
    pub fn new(kind: EventKind, thread_id: impl Into<String>) -> Self {
        Self {
            event_id: 0,
            thread_id: thread_id.into(),
            run_id: None,
            kind,
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Add one field to the payload object.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.payload.is_object() {
            self.payload = Value::Object(Default::default());
        }
        if let Some(map) = self.payload.as_object_mut() {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Get a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.as_object()?.get(key)
    }

    // Convenience constructors for common events

    pub fn run_start(thread_id: impl Into<String>, txn_id: &str) -> Self {
        Self::new(EventKind::RunStart, thread_id).with_field("txn_id", txn_id)
    }

    pub fn stage_start(thread_id: impl Into<String>, stage: u8) -> Self {
        Self::new(EventKind::StageStart, thread_id).with_field("stage", stage)
    }

    pub fn stage_end(thread_id: impl Into<String>, stage: u8, elapsed_ms: u64) -> Self {
        Self::new(EventKind::StageEnd, thread_id)
            .with_field("stage", stage)
            .with_field("elapsed_ms", elapsed_ms)
    }

    pub fn tool_call_start(thread_id: impl Into<String>, tool: &str) -> Self {
        Self::new(EventKind::ToolCallStart, thread_id).with_field("tool", tool)
    }

    pub fn tool_call_end(
        thread_id: impl Into<String>,
        tool: &str,
        elapsed_ms: u64,
        result_size: usize,
    ) -> Self {
        Self::new(EventKind::ToolCallEnd, thread_id)
            .with_field("tool", tool)
            .with_field("elapsed_ms", elapsed_ms)
            .with_field("result_size", result_size)
    }

    pub fn decision_emitted(thread_id: impl Into<String>, verdict: &str, final_: bool) -> Self {
        Self::new(EventKind::DecisionEmitted, thread_id)
            .with_field("verdict", verdict)
            .with_field("final", final_)
    }

    pub fn error(thread_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, thread_id).with_field("message", message.into())
    }

    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }
}

/// A push subscription to one thread's events.
pub struct EventStream {
    rx: mpsc::Receiver<ObservabilityEvent>,
}

impl Stream for EventStream {
    type Item = ObservabilityEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A boxed stream of observability events.
pub type BoxedEventStream = Pin<Box<dyn Stream<Item = ObservabilityEvent> + Send>>;

struct Subscriber {
    tx: mpsc::Sender<ObservabilityEvent>,
}

#[derive(Default)]
struct ThreadEvents {
    history: VecDeque<ObservabilityEvent>,
    subscribers: Vec<Subscriber>,
}

/// Snapshot of streamer health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamerStats {
    pub threads_tracked: usize,
    pub events_retained: usize,
    pub live_subscribers: usize,
}

/// Per-thread fan-out of lifecycle events.
pub struct ObservabilityStreamer {
    threads: RwLock<HashMap<String, ThreadEvents>>,
    sequence: AtomicU64,
    /// Per-thread ring buffer size
    history_limit: usize,
    /// Per-subscriber bounded buffer size
    subscriber_buffer: usize,
}

impl ObservabilityStreamer {
    pub fn new(history_limit: usize, subscriber_buffer: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(1),
            history_limit: history_limit.max(1),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    /// Enqueue an event: assign its id, append to the thread's ring buffer,
    /// and fan out to live subscribers. Never blocks on a slow subscriber.
    pub async fn emit(&self, mut event: ObservabilityEvent) {
        event.event_id = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut threads = self.threads.write().await;
        let entry = threads.entry(event.thread_id.clone()).or_default();

        entry.history.push_back(event.clone());
        while entry.history.len() > self.history_limit {
            entry.history.pop_front();
        }

        let mut dropped = Vec::new();
        for (i, sub) in entry.subscribers.iter().enumerate() {
            if sub.tx.try_send(event.clone()).is_err() {
                dropped.push(i);
            }
        }

        // Disconnect overflowing subscribers with a terminal error event.
        if !dropped.is_empty() {
            warn!(
                thread_id = %event.thread_id,
                count = dropped.len(),
                "dropping slow observability subscribers"
            );
            let terminal = ObservabilityEvent {
                event_id: self.sequence.fetch_add(1, Ordering::SeqCst),
                thread_id: event.thread_id.clone(),
                run_id: None,
                kind: EventKind::Error,
                timestamp: Utc::now(),
                payload: serde_json::json!({ "message": "subscriber buffer overflow, disconnected" }),
            };
            for &i in dropped.iter().rev() {
                let sub = entry.subscribers.remove(i);
                let _ = sub.tx.try_send(terminal.clone());
                // Dropping the sender closes the stream.
            }
        }
    }

    /// Open a live push subscription for a thread.
    pub async fn subscribe(&self, thread_id: &str) -> EventStream {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        let mut threads = self.threads.write().await;
        let entry = threads.entry(thread_id.to_string()).or_default();
        entry.subscribers.push(Subscriber { tx });

        debug!(thread_id, subscribers = entry.subscribers.len(), "subscriber attached");
        EventStream { rx }
    }

    /// Events strictly after `after_event_id`, oldest first, up to `limit`.
    ///
    /// An unknown `after_event_id` returns all retained events.
    pub async fn poll(
        &self,
        thread_id: &str,
        after_event_id: Option<u64>,
        limit: usize,
    ) -> Vec<ObservabilityEvent> {
        let threads = self.threads.read().await;
        let Some(entry) = threads.get(thread_id) else {
            return Vec::new();
        };

        let start = match after_event_id {
            Some(id) => match entry.history.iter().position(|e| e.event_id == id) {
                Some(pos) => pos + 1,
                None => 0,
            },
            None => 0,
        };

        entry.history.iter().skip(start).take(limit).cloned().collect()
    }

    /// The most recent `limit` events for a thread.
    pub async fn history(&self, thread_id: &str, limit: usize) -> Vec<ObservabilityEvent> {
        let threads = self.threads.read().await;
        let Some(entry) = threads.get(thread_id) else {
            return Vec::new();
        };

        let skip = entry.history.len().saturating_sub(limit);
        entry.history.iter().skip(skip).cloned().collect()
    }

    /// Drop a thread's buffer and disconnect its subscribers.
    pub async fn clear(&self, thread_id: &str) {
        let mut threads = self.threads.write().await;
        threads.remove(thread_id);
    }

    /// Health snapshot across all threads.
    pub async fn stats(&self) -> StreamerStats {
        let threads = self.threads.read().await;
        StreamerStats {
            threads_tracked: threads.len(),
            events_retained: threads.values().map(|t| t.history.len()).sum(),
            live_subscribers: threads.values().map(|t| t.subscribers.len()).sum(),
        }
    }
}

impl Default for ObservabilityStreamer {
    fn default() -> Self {
        Self::new(200, 64)
    }
}
