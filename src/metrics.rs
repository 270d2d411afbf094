//! Metrics / callback fan-out (spec §4.10, plus §B subscribe/unsubscribe
//! and snapshot additions).
//!
//! In-process, synchronous with respect to any one request; catches and
//! counts exceptions from subscribers without failing the request.
//! Grounded on `dashflow_observability::cost::CostTracker::report()`
//! (counter snapshot pattern) and the teacher's general
//! registered-at-construction subscriber model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Typed lifecycle events (spec §4.10).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum MetricEvent {
    /// A request began.
    QueryStart {
        /// Correlates all events for one request.
        trace_id: String,
    },
    /// Complexity classification completed.
    ComplexityDetected {
        /// Correlates all events for one request.
        trace_id: String,
        /// Classified level, as its spec-facing string tag.
        level: String,
    },
    /// A routing strategy was chosen.
    StrategySelected {
        /// Correlates all events for one request.
        trace_id: String,
        /// Chosen strategy, as its spec-facing string tag.
        strategy: String,
    },
    /// A provider call started.
    ModelCallStart {
        /// Correlates all events for one request.
        trace_id: String,
        /// Model invoked.
        model: String,
    },
    /// A provider call completed successfully.
    ModelCallComplete {
        /// Correlates all events for one request.
        trace_id: String,
        /// Model invoked.
        model: String,
        /// Wall-clock duration in milliseconds.
        latency_ms: u64,
    },
    /// A provider call failed.
    ModelCallError {
        /// Correlates all events for one request.
        trace_id: String,
        /// Model invoked.
        model: String,
        /// Error message.
        error: String,
    },
    /// A cascade decision (accept/escalate) was made.
    CascadeDecision {
        /// Correlates all events for one request.
        trace_id: String,
        /// Whether the draft was accepted.
        draft_accepted: bool,
    },
    /// A cache lookup hit.
    CacheHit {
        /// Correlates all events for one request.
        trace_id: String,
    },
    /// A cache lookup missed.
    CacheMiss {
        /// Correlates all events for one request.
        trace_id: String,
    },
    /// A request finished successfully.
    QueryComplete {
        /// Correlates all events for one request.
        trace_id: String,
        /// Total USD cost.
        total_cost: f64,
    },
    /// A request finished with an error.
    QueryError {
        /// Correlates all events for one request.
        trace_id: String,
        /// Error message.
        error: String,
    },
}

impl MetricEvent {
    fn kind_tag(&self) -> &'static str {
        match self {
            MetricEvent::QueryStart { .. } => "query_start",
            MetricEvent::ComplexityDetected { .. } => "complexity_detected",
            MetricEvent::StrategySelected { .. } => "strategy_selected",
            MetricEvent::ModelCallStart { .. } => "model_call_start",
            MetricEvent::ModelCallComplete { .. } => "model_call_complete",
            MetricEvent::ModelCallError { .. } => "model_call_error",
            MetricEvent::CascadeDecision { .. } => "cascade_decision",
            MetricEvent::CacheHit { .. } => "cache_hit",
            MetricEvent::CacheMiss { .. } => "cache_miss",
            MetricEvent::QueryComplete { .. } => "query_complete",
            MetricEvent::QueryError { .. } => "query_error",
        }
    }
}

/// A subscriber callback. Must not block the pipeline; long work is the
/// subscriber's own responsibility to offload (spec §4.10).
pub type Subscriber = Arc<dyn Fn(&MetricEvent) + Send + Sync>;

/// Opaque handle returned by [`MetricsManager::subscribe`], used to
/// [`MetricsManager::unsubscribe`] later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Snapshot of event counts by kind, for a cheap synchronous health check
/// without wiring a subscriber (spec §B).
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Count of dispatched events, keyed by kind tag.
    pub counts: HashMap<String, u64>,
    /// Count of subscriber callbacks that panicked or otherwise errored.
    pub subscriber_errors: u64,
}

/// In-process event fan-out manager.
#[derive(Default)]
pub struct MetricsManager {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
    counts: DashMap<&'static str, u64>,
    subscriber_errors: AtomicU64,
}

impl MetricsManager {
    /// Construct an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, returning a handle for later
    /// [`MetricsManager::unsubscribe`]. Subscribers are registered at
    /// construction time in the common case; unregistering mid-flight is
    /// allowed but does not cancel in-flight dispatches (spec §5).
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Remove a previously registered subscriber. No-op if already
    /// removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Dispatch `event` to every subscriber, counting it in the snapshot.
    /// A subscriber that panics is caught and counted, never propagated
    /// to the caller or to other subscribers.
    pub fn emit(&self, event: MetricEvent) {
        *self.counts.entry(event.kind_tag()).or_insert(0) += 1;

        let subscribers = self.subscribers.read().clone();
        for (_, subscriber) in subscribers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(&event)));
            if result.is_err() {
                self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                warn!("metrics subscriber panicked while handling {}", event.kind_tag());
            }
        }
    }

    /// A point-in-time snapshot of dispatched event counts.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counts: self
                .counts
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            subscriber_errors: self.subscriber_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsManager")
            .field("subscriber_count", &self.subscribers.read().len())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Helper to build a JSON-ish audit value from an event, for callers that
/// want to forward events to an external sink without matching on every
/// variant (spec §6 "discriminated record with a type tag and a data
/// object").
#[must_use]
pub fn event_to_json(event: &MetricEvent) -> Value {
    serde_json::to_value(event).unwrap_or(Value::Null)
}
