//! Distributed tracing: trace/span IDs, tags, per-span timing, pluggable
//! collectors (spec.md §4.14).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info};
use uuid::Uuid;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Started,
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub method: String,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub status: SpanStatus,
    pub tags: HashMap<String, String>,
    pub logs: HashMap<String, String>,
}

impl Span {
    fn new(trace_id: String, span_id: String, parent_span_id: Option<String>, service: &str, method: &str) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            service: service.to_string(),
            method: method.to_string(),
            start_ms: now_ms(),
            end_ms: None,
            status: SpanStatus::Started,
            tags: HashMap::new(),
            logs: HashMap::new(),
        }
    }

    /// `end - start` in milliseconds, `0` while still running (spec.md §4.14).
    pub fn duration_ms(&self) -> i64 {
        self.end_ms.map(|end| end - self.start_ms).unwrap_or(0)
    }
}

/// A destination for finished spans (spec.md §4.14).
pub trait SpanCollector: Send + Sync {
    fn collect(&self, span: &Span);
}

/// Logs success at info, errors at error (spec.md §4.14 "default collector").
pub struct LoggingCollector;

impl SpanCollector for LoggingCollector {
    fn collect(&self, span: &Span) {
        match span.status {
            SpanStatus::Error => error!(
                "span {} ({}::{}) failed after {}ms: {:?}",
                span.span_id,
                span.service,
                span.method,
                span.duration_ms(),
                span.logs.get("error")
            ),
            _ => info!(
                "span {} ({}::{}) completed in {}ms",
                span.span_id,
                span.service,
                span.method,
                span.duration_ms()
            ),
        }
    }
}

/// Maintains the current span per logical call path: one active span per
/// concurrent context (spec.md §4.14). Modeled as an explicit stack rather
/// than a thread-local since `async` tasks may hop OS threads.
pub struct CallContext {
    stack: Mutex<Vec<Span>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }

    fn current_trace_id(&self) -> Option<String> {
        self.stack.lock().unwrap().last().map(|s| s.trace_id.clone())
    }

    fn current_span_id(&self) -> Option<String> {
        self.stack.lock().unwrap().last().map(|s| s.span_id.clone())
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide tracing manager: owns the registered collectors and the
/// per-context span stack (spec.md §4.14, §6).
pub struct TraceManager {
    context: CallContext,
    collectors: Vec<Arc<dyn SpanCollector>>,
}

impl TraceManager {
    pub fn new() -> Self {
        Self {
            context: CallContext::new(),
            collectors: vec![Arc::new(LoggingCollector)],
        }
    }

    pub fn with_collectors(collectors: Vec<Arc<dyn SpanCollector>>) -> Self {
        Self {
            context: CallContext::new(),
            collectors,
        }
    }

    pub fn register_collector(&mut self, collector: Arc<dyn SpanCollector>) {
        self.collectors.push(collector);
    }

    /// Starts a fresh trace with a new trace ID and a root span (spec.md
    /// §4.14).
    pub fn start_trace(&self, service: &str, method: &str) {
        let trace_id = Uuid::new_v4().to_string();
        let span_id = Uuid::new_v4().to_string();
        let span = Span::new(trace_id, span_id, None, service, method);
        self.context.stack.lock().unwrap().push(span);
    }

    /// Starts a child span under the current span, preserving the trace ID
    /// (spec.md §4.14).
    pub fn start_child_trace(&self, service: &str, method: &str) {
        let trace_id = self
            .context
            .current_trace_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent = self.context.current_span_id();
        let span_id = Uuid::new_v4().to_string();
        let span = Span::new(trace_id, span_id, parent, service, method);
        self.context.stack.lock().unwrap().push(span);
    }

    pub fn add_tag(&self, key: &str, value: &str) {
        if let Some(span) = self.context.stack.lock().unwrap().last_mut() {
            span.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn add_log(&self, key: &str, value: &str) {
        if let Some(span) = self.context.stack.lock().unwrap().last_mut() {
            span.logs.insert(key.to_string(), value.to_string());
        }
    }

    fn finish(&self, status: SpanStatus) -> Option<Span> {
        let mut span = self.context.stack.lock().unwrap().pop()?;
        span.end_ms = Some(now_ms());
        span.status = status;
        for collector in &self.collectors {
            collector.collect(&span);
        }
        Some(span)
    }

    pub fn finish_trace(&self) -> Option<Span> {
        self.finish(SpanStatus::Success)
    }

    pub fn finish_trace_with_error(&self, message: &str) -> Option<Span> {
        self.add_log("error", message);
        self.finish(SpanStatus::Error)
    }
}

impl Default for TraceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingCollector {
        spans: StdMutex<Vec<Span>>,
    }

    impl SpanCollector for RecordingCollector {
        fn collect(&self, span: &Span) {
            self.spans.lock().unwrap().push(span.clone());
        }
    }

    #[test]
    fn child_span_shares_trace_id_and_references_parent() {
        let manager = TraceManager::new();
        manager.start_trace("svc", "root");
        let root_span_id = manager.context.current_span_id().unwrap();
        manager.start_child_trace("svc", "child");

        let child = manager.finish_trace().unwrap();
        assert_eq!(child.parent_span_id.as_deref(), Some(root_span_id.as_str()));

        let root = manager.finish_trace().unwrap();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);
    }

    #[test]
    fn finish_with_error_sets_error_status_and_log() {
        let recorder = Arc::new(RecordingCollector {
            spans: StdMutex::new(Vec::new()),
        });
        let manager = TraceManager::with_collectors(vec![recorder.clone()]);
        manager.start_trace("svc", "method");
        manager.add_tag("key", "value");
        manager.finish_trace_with_error("boom");

        let spans = recorder.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].logs.get("error").unwrap(), "boom");
        assert_eq!(spans[0].tags.get("key").unwrap(), "value");
    }

    #[test]
    fn duration_is_nonnegative_after_finish() {
        let manager = TraceManager::new();
        manager.start_trace("svc", "method");
        let span = manager.finish_trace().unwrap();
        assert!(span.duration_ms() >= 0);
    }
}
