use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluxora_core::TransactionId;

/// Target used for every metric event emitted through `tracing`.
pub const METRICS_TARGET: &str = "fluxora::metrics";

/// A state transition or terminal outcome worth counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceEvent {
    CircuitOpened {
        dependency: String,
        consecutive_failures: u32,
    },
    CircuitHalfOpened {
        dependency: String,
    },
    CircuitClosed {
        dependency: String,
    },
    /// A call was rejected by an open (or saturated half-open) circuit.
    CallRejected {
        dependency: String,
    },
    ResourceExhausted {
        pool: String,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay: Duration,
    },
    RetriesExhausted {
        operation: String,
        attempts: u32,
    },
    SagaCompleted {
        saga: String,
        transaction_id: TransactionId,
    },
    SagaCompensated {
        saga: String,
        transaction_id: TransactionId,
    },
    /// A compensation failed and the execution waits for an operator.
    SagaHalted {
        saga: String,
        transaction_id: TransactionId,
        step: String,
    },
    OutboxDispatched {
        topic: String,
    },
    EntryDeadLettered {
        source: String,
        attempts: u32,
    },
    DeadLetterReplayed {
        source: String,
    },
    DeadLetterDiscarded {
        source: String,
    },
}

impl ResilienceEvent {
    /// Stable metric name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit_opened_total",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened_total",
            Self::CircuitClosed { .. } => "circuit_closed_total",
            Self::CallRejected { .. } => "circuit_rejected_calls_total",
            Self::ResourceExhausted { .. } => "resource_exhausted_total",
            Self::RetryScheduled { .. } => "retry_scheduled_total",
            Self::RetriesExhausted { .. } => "retries_exhausted_total",
            Self::SagaCompleted { .. } => "saga_completed_total",
            Self::SagaCompensated { .. } => "saga_compensated_total",
            Self::SagaHalted { .. } => "saga_halted_total",
            Self::OutboxDispatched { .. } => "outbox_dispatched_total",
            Self::EntryDeadLettered { .. } => "dead_lettered_total",
            Self::DeadLetterReplayed { .. } => "dead_letter_replayed_total",
            Self::DeadLetterDiscarded { .. } => "dead_letter_discarded_total",
        }
    }

    /// The single label value the metric is keyed by (dependency, pool, saga, topic...).
    pub fn label(&self) -> &str {
        match self {
            Self::CircuitOpened { dependency, .. }
            | Self::CircuitHalfOpened { dependency }
            | Self::CircuitClosed { dependency }
            | Self::CallRejected { dependency } => dependency,
            Self::ResourceExhausted { pool } => pool,
            Self::RetryScheduled { operation, .. } | Self::RetriesExhausted { operation, .. } => {
                operation
            }
            Self::SagaCompleted { saga, .. }
            | Self::SagaCompensated { saga, .. }
            | Self::SagaHalted { saga, .. } => saga,
            Self::OutboxDispatched { topic } => topic,
            Self::EntryDeadLettered { source, .. }
            | Self::DeadLetterReplayed { source }
            | Self::DeadLetterDiscarded { source } => source,
        }
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.name(), self.label())
    }
}

/// Receiver of resilience events (metrics exporter, audit log, test probe).
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn record(&self, event: ResilienceEvent);
}

pub type SharedMetricsSink = Arc<dyn MetricsSink>;

impl<S> MetricsSink for Arc<S>
where
    S: MetricsSink + ?Sized,
{
    fn record(&self, event: ResilienceEvent) {
        (**self).record(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl NoopMetricsSink {
    pub fn shared() -> SharedMetricsSink {
        Arc::new(NoopMetricsSink)
    }
}

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _event: ResilienceEvent) {}
}

/// Emits every event as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl TracingMetricsSink {
    pub fn shared() -> SharedMetricsSink {
        Arc::new(TracingMetricsSink)
    }
}

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: ResilienceEvent) {
        match &event {
            ResilienceEvent::SagaHalted {
                transaction_id,
                step,
                ..
            } => ::tracing::warn!(
                target: METRICS_TARGET,
                metric = event.name(),
                label = event.label(),
                transaction_id = %transaction_id,
                step = %step,
                "resilience event"
            ),
            ResilienceEvent::EntryDeadLettered { attempts, .. } => ::tracing::warn!(
                target: METRICS_TARGET,
                metric = event.name(),
                label = event.label(),
                attempts = *attempts,
                "resilience event"
            ),
            ResilienceEvent::RetryScheduled { attempt, delay, .. } => ::tracing::debug!(
                target: METRICS_TARGET,
                metric = event.name(),
                label = event.label(),
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                "resilience event"
            ),
            _ => ::tracing::info!(
                target: METRICS_TARGET,
                metric = event.name(),
                label = event.label(),
                "resilience event"
            ),
        }
    }
}

/// Records events in memory; used by tests to assert on transitions.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of events with this metric name, across all labels.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn count_labeled(&self, name: &str, label: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name && e.label() == label)
            .count()
    }

    /// Counter view: `(name, label) -> count`.
    pub fn counters(&self) -> HashMap<(&'static str, String), usize> {
        let mut out = HashMap::new();
        for event in self.events.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            *out.entry((event.name(), event.label().to_string())).or_insert(0) += 1;
        }
        out
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, event: ResilienceEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
