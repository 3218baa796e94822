//! Suspicious-activity detection over the audit stream.
//!
//! Two patterns: any `unauthorized` result, and `threshold` non-success
//! results for one key inside a rolling window. Key-less operations share
//! one global window.

use super::entry::AuditEntry;
use crate::alert::{SuspicionKind, SuspiciousActivity};
use crate::types::{KeyId, OperationResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Keys tracked at once. Past this the key with the oldest failure is evicted.
pub const MAX_TRACKED_KEYS: usize = 4096;

pub struct SuspicionDetector {
    threshold: usize,
    window: ChronoDuration,
    failures: HashMap<Option<KeyId>, VecDeque<DateTime<Utc>>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl SuspicionDetector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX),
            failures: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Inspect one entry; returns what it found, if anything.
    pub fn observe(&mut self, entry: &AuditEntry) -> Option<SuspiciousActivity> {
        if entry.result.is_success() {
            return None;
        }
        let found = |kind| SuspiciousActivity {
            kind,
            key_id: entry.key_id.clone(),
            operation: entry.operation,
            operation_id: entry.operation_id.to_string(),
            actor: entry.security.actor.clone(),
        };

        if entry.result == OperationResult::Unauthorized {
            // Still counted towards the failure window below.
            self.record_failure(entry);
            return Some(found(SuspicionKind::UnauthorizedAccess));
        }

        let count = self.record_failure(entry);
        if count >= self.threshold {
            // Start over so one burst raises one alert.
            self.failures.remove(&entry.key_id);
            return Some(found(SuspicionKind::RepeatedFailures {
                count,
                window_secs: self.window.num_seconds().max(0) as u64,
            }));
        }
        None
    }

    /// Failures currently inside the window for a key (`None` = key-less).
    pub fn recent_failures(&self, key: &Option<KeyId>) -> usize {
        self.failures.get(key).map_or(0, |q| q.len())
    }

    /// Keys with at least one failure still remembered.
    pub fn tracked_keys(&self) -> usize {
        self.failures.len()
    }

    fn record_failure(&mut self, entry: &AuditEntry) -> usize {
        let cutoff = entry.timestamp.checked_sub_signed(self.window);
        if let Some(cutoff) = cutoff {
            self.sweep(entry.timestamp, cutoff);
        }

        let times = self.failures.entry(entry.key_id.clone()).or_default();
        times.push_back(entry.timestamp);
        if let Some(cutoff) = cutoff {
            prune(times, cutoff);
        }
        let count = times.len();

        if self.failures.len() > MAX_TRACKED_KEYS {
            let oldest = self
                .failures
                .iter()
                .filter(|(key, _)| **key != entry.key_id)
                .min_by_key(|(_, times)| times.back().copied())
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                self.failures.remove(&key);
            }
        }
        count
    }

    /// Drop expired failures for every key, at most once per window.
    fn sweep(&mut self, now: DateTime<Utc>, cutoff: DateTime<Utc>) {
        let due = self
            .last_sweep
            .map_or(true, |at| now.signed_duration_since(at) >= self.window);
        if !due {
            return;
        }
        self.last_sweep = Some(now);
        self.failures.retain(|_, times| {
            prune(times, cutoff);
            !times.is_empty()
        });
    }
}

fn prune(times: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while times.front().map_or(false, |t| *t < cutoff) {
        times.pop_front();
    }
}
