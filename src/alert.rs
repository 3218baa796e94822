//! Alert channel for an external security-coordination layer.
//!
//! Alerts fan out two ways: synchronous handlers registered with
//! [`AlertBus::on_alert`] run inline on the emitting thread, and a
//! `tokio::sync::broadcast` channel serves async consumers. Neither path can
//! fail the operation that raised the alert.

use crate::health::HealthState;
use crate::types::{KeyId, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Buffered alerts per broadcast subscriber before the slowest one lags.
const BROADCAST_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Why an audit entry looked suspicious.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspicionKind {
    UnauthorizedAccess,
    RepeatedFailures { count: usize, window_secs: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub kind: SuspicionKind,
    /// `None` for key-less operations, which share one global window.
    pub key_id: Option<KeyId>,
    pub operation: OperationType,
    pub operation_id: String,
    pub actor: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    PerformanceTargetExceeded {
        operation: OperationType,
        operation_id: String,
        key_id: Option<KeyId>,
        duration_ms: u64,
        target_ms: u64,
    },
    SuspiciousActivity(SuspiciousActivity),
    AuditFlushFailed {
        /// Entries returned to the buffer for retry.
        entries: usize,
        error: String,
    },
    HealthChanged {
        from: HealthState,
        to: HealthState,
        reason: String,
    },
}

impl AlertKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PerformanceTargetExceeded { .. } => "performance-target-exceeded",
            Self::SuspiciousActivity(_) => "suspicious-activity",
            Self::AuditFlushFailed { .. } => "audit-flush-failed",
            Self::HealthChanged { .. } => "health-changed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub at: DateTime<Utc>,
    pub kind: AlertKind,
}

impl Alert {
    pub fn now(kind: AlertKind) -> Self {
        Self { at: Utc::now(), kind }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub type AlertHandler = Arc<dyn Fn(&Alert) + Send + Sync>;

pub struct AlertBus {
    handlers: RwLock<Vec<AlertHandler>>,
    tx: broadcast::Sender<Alert>,
    emitted: AtomicU64,
}

impl AlertBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            tx,
            emitted: AtomicU64::new(0),
        }
    }

    /// Register a handler invoked synchronously for every alert.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.push(Arc::new(handler));
    }

    /// Subscribe to alerts emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: AlertKind) {
        let alert = Alert::now(kind);
        self.emitted.fetch_add(1, Ordering::Relaxed);

        // Clone the list so a handler may register another handler.
        let handlers: Vec<AlertHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&alert))).is_err() {
                tracing::warn!(alert = alert.kind.name(), "alert handler panicked");
            }
        }

        // No subscribers is not an error.
        let _ = self.tx.send(alert);
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}
