//! Per-operation counters and latency figures.

use crate::types::OperationType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub target_breaches: u64,
}

impl OperationStats {
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }

    fn add(&mut self, success: bool, duration_ms: u64, within_target: bool) {
        self.count += 1;
        if success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        self.total_ms = self.total_ms.saturating_add(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
        if !within_target {
            self.target_breaches += 1;
        }
    }

    fn merge(&mut self, other: &OperationStats) {
        self.count += other.count;
        self.success += other.success;
        self.failure += other.failure;
        self.total_ms = self.total_ms.saturating_add(other.total_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
        self.target_breaches += other.target_breaches;
    }
}

/// Snapshot keyed by operation name.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationStats>,
    pub total: OperationStats,
}

#[derive(Default)]
pub struct Metrics {
    ops: Mutex<BTreeMap<OperationType, OperationStats>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: OperationType, success: bool, duration_ms: u64, within_target: bool) {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        ops.entry(operation).or_default().add(success, duration_ms, within_target);
    }

    pub fn get(&self, operation: OperationType) -> OperationStats {
        let ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        ops.get(&operation).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        let mut snapshot = MetricsSnapshot::default();
        for (op, stats) in ops.iter() {
            snapshot.total.merge(stats);
            snapshot.operations.insert(op.as_str().to_string(), stats.clone());
        }
        snapshot
    }
}
