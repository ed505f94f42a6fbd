//! Telemetry
//!
//! Span records and counters for each query, delivered to a pluggable
//! [`TelemetrySink`] by a background task. Emission only enqueues, so the
//! response path never waits on the sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::provider::TokenUsage;

/// Terminal status of a span
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum SpanStatus {
    Ok,
    Error(String),
    Cancelled,
}

/// One finished span
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub trace_id: String,
    pub span_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub status: SpanStatus,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Per-query counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCounters {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
}

/// What the sink receives
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Span(SpanRecord),
    Counters {
        trace_id: String,
        #[serde(flatten)]
        counters: QueryCounters,
    },
}

/// Destination for telemetry records
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn export(&self, record: TelemetryRecord);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn export(&self, _record: TelemetryRecord) {}
}

/// Emits records as `tracing` events on the `telemetry` target
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn export(&self, record: TelemetryRecord) {
        match record {
            TelemetryRecord::Span(span) => {
                let attributes = serde_json::to_string(&span.attributes).unwrap_or_default();
                tracing::info!(
                    target: "telemetry",
                    trace_id = %span.trace_id,
                    span = %span.name,
                    span_id = span.span_id,
                    parent_id = ?span.parent_id,
                    duration_ms = span.duration_ms(),
                    status = ?span.status,
                    %attributes,
                    "span"
                );
            }
            TelemetryRecord::Counters { trace_id, counters } => {
                tracing::info!(
                    target: "telemetry",
                    %trace_id,
                    tokens_in = counters.tokens_in,
                    tokens_out = counters.tokens_out,
                    latency_ms = counters.latency_ms,
                    "counters"
                );
            }
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Span(span) => Some(span),
                TelemetryRecord::Counters { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn export(&self, record: TelemetryRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

enum Envelope {
    Record(TelemetryRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle for emitting telemetry; cheap to clone
#[derive(Clone, Debug, Default)]
pub struct TelemetryEmitter {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Record(_) => f.write_str("Record"),
            Envelope::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl TelemetryEmitter {
    /// Spawn the forwarding task onto the current runtime
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Record(record) => sink.export(record).await,
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx: Some(tx) }
    }

    /// No-op emitter with the same API
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, record: TelemetryRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(Envelope::Record(record)).is_err() {
                tracing::debug!("Telemetry forwarder gone, record dropped");
            }
        }
    }

    /// Wait until everything emitted so far has reached the sink
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Open the root span of one query
    pub fn begin_query(&self, name: impl Into<String>) -> QueryTrace {
        QueryTrace::new(self.clone(), name.into())
    }
}

#[derive(Debug)]
struct OpenSpan {
    name: String,
    start: DateTime<Utc>,
    attributes: BTreeMap<String, serde_json::Value>,
}

/// A started child span; hand back to [`QueryTrace::end`]
#[derive(Debug)]
#[must_use = "spans must be ended"]
pub struct SpanHandle {
    id: u64,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl SpanHandle {
    pub fn attr(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.into(), value.into());
    }
}

/// Root span of one query plus its children
///
/// Children still open at [`QueryTrace::finish`] are closed as cancelled
/// first, so every child ends before its parent. Dropping an unfinished
/// trace finishes it as cancelled.
#[derive(Debug)]
pub struct QueryTrace {
    emitter: TelemetryEmitter,
    trace_id: String,
    root: OpenSpan,
    started: Instant,
    next_id: u64,
    open: HashMap<u64, OpenSpan>,
    finished_children: Vec<SpanRecord>,
    counters: QueryCounters,
    done: bool,
}

const ROOT_SPAN_ID: u64 = 0;

impl QueryTrace {
    fn new(emitter: TelemetryEmitter, name: String) -> Self {
        Self {
            emitter,
            trace_id: uuid::Uuid::now_v7().to_string(),
            root: OpenSpan {
                name,
                start: Utc::now(),
                attributes: BTreeMap::new(),
            },
            started: Instant::now(),
            next_id: ROOT_SPAN_ID + 1,
            open: HashMap::new(),
            finished_children: Vec::new(),
            counters: QueryCounters::default(),
            done: false,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Attribute on the root span
    pub fn attr(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.root.attributes.insert(key.into(), value.into());
    }

    pub fn begin(&mut self, name: impl Into<String>) -> SpanHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(
            id,
            OpenSpan {
                name: name.into(),
                start: Utc::now(),
                attributes: BTreeMap::new(),
            },
        );
        SpanHandle {
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn end(&mut self, span: SpanHandle, status: SpanStatus) {
        if let Some(mut open) = self.open.remove(&span.id) {
            open.attributes.extend(span.attributes);
            let record = self.close_span(span.id, Some(ROOT_SPAN_ID), open, status);
            self.finished_children.push(record);
        }
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.counters.tokens_in += u64::from(usage.prompt_tokens);
        self.counters.tokens_out += u64::from(usage.completion_tokens);
    }

    pub fn counters(&self) -> QueryCounters {
        self.counters
    }

    /// Close the root span and hand everything to the emitter
    pub fn finish(mut self, status: SpanStatus) -> String {
        self.finish_inner(status);
        self.trace_id.clone()
    }

    fn finish_inner(&mut self, status: SpanStatus) {
        if self.done {
            return;
        }
        self.done = true;

        let mut dangling: Vec<(u64, OpenSpan)> = self.open.drain().collect();
        dangling.sort_by_key(|(id, _)| *id);
        for (id, open) in dangling {
            let record = self.close_span(id, Some(ROOT_SPAN_ID), open, SpanStatus::Cancelled);
            self.finished_children.push(record);
        }

        self.counters.latency_ms = self.started.elapsed().as_millis() as u64;
        let root = OpenSpan {
            name: std::mem::take(&mut self.root.name),
            start: self.root.start,
            attributes: std::mem::take(&mut self.root.attributes),
        };
        let root = self.close_span(ROOT_SPAN_ID, None, root, status);

        for child in self.finished_children.drain(..) {
            self.emitter.emit(TelemetryRecord::Span(child));
        }
        self.emitter.emit(TelemetryRecord::Span(root));
        self.emitter.emit(TelemetryRecord::Counters {
            trace_id: self.trace_id.clone(),
            counters: self.counters,
        });
    }

    fn close_span(
        &self,
        span_id: u64,
        parent_id: Option<u64>,
        open: OpenSpan,
        status: SpanStatus,
    ) -> SpanRecord {
        SpanRecord {
            name: open.name,
            trace_id: self.trace_id.clone(),
            span_id,
            parent_id,
            start: open.start,
            end: Utc::now(),
            attributes: open.attributes,
            status,
        }
    }
}

impl Drop for QueryTrace {
    fn drop(&mut self) {
        self.finish_inner(SpanStatus::Cancelled);
    }
}
