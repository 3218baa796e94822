//! Compliance statistics over a window of audit entries.

use super::entry::AuditEntry;
use crate::types::OperationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `duration` leading up to now.
    pub fn last(duration: chrono::Duration) -> Self {
        let end = Utc::now();
        Self { start: end - duration, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub unauthorized: u64,
    pub error: u64,
    pub average_latency_ms: f64,
    pub target_breaches: u64,
    /// Success rate over the window; 1.0 when the window is empty.
    pub compliance_score: f64,
    pub by_operation: BTreeMap<String, u64>,
}

impl AuditStatistics {
    pub fn compute<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>, range: &TimeRange) -> Self {
        let mut stats = Self::default();
        let mut latency_total: u64 = 0;

        for entry in entries.into_iter().filter(|e| range.contains(e.timestamp)) {
            stats.total += 1;
            match entry.result {
                OperationResult::Success => stats.success += 1,
                OperationResult::Failure => stats.failure += 1,
                OperationResult::Unauthorized => stats.unauthorized += 1,
                OperationResult::Error => stats.error += 1,
            }
            if !entry.performance.within_target {
                stats.target_breaches += 1;
            }
            latency_total = latency_total.saturating_add(entry.performance.duration_ms);
            *stats
                .by_operation
                .entry(entry.operation.as_str().to_string())
                .or_insert(0) += 1;
        }

        if stats.total > 0 {
            stats.average_latency_ms = latency_total as f64 / stats.total as f64;
            stats.compliance_score = stats.success as f64 / stats.total as f64;
        } else {
            stats.compliance_score = 1.0;
        }
        stats
    }

    /// Everything that was not a success.
    pub fn non_success(&self) -> u64 {
        self.failure + self.unauthorized + self.error
    }
}
