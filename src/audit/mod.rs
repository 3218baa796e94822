//! Audit logger: buffered, hash-chained, rotating append-only log of every
//! operation.
//!
//! The hot path ([`AuditLogger::log_operation`]) only stamps the entry and
//! enqueues it. A background task owns flushing: every `flush_interval`,
//! when the buffer reaches `flush_threshold`, or right away for a
//! high-priority entry. A failed flush puts the batch back at the front of
//! the buffer, so entries are delivered at least once and in order.

pub mod detector;
pub mod entry;
pub mod sink;
pub mod stats;
pub mod verify;

pub use detector::SuspicionDetector;
pub use entry::{genesis_hash, AuditEntry, AuditRecord, OperationId, PerformanceInfo, SecurityContext};
pub use sink::{AuditSink, ChainHead, MemorySink, RotatingFileSink, TracingAuditSink};
pub use stats::{AuditStatistics, TimeRange};
pub use verify::{verify_log_directory, ChainVerifier, VerificationReport};

use crate::alert::{AlertBus, AlertKind};
use crate::config::{AuditConfig, AuditLevel};
use crate::error::HsmError;
use crate::types::{KeyId, OperationResult, OperationType};

use rand_core::RngCore;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Whether an operation's entry survives the configured level.
pub fn retains(level: AuditLevel, operation: OperationType, result: OperationResult) -> bool {
    match level {
        AuditLevel::Minimal => !result.is_success(),
        AuditLevel::Standard => operation.is_lifecycle() || !result.is_success(),
        AuditLevel::Comprehensive => true,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditCounters {
    /// Operation ids handed out.
    pub assigned: u64,
    /// Entries dropped by the level filter.
    pub filtered: u64,
    pub flushed: u64,
    pub flush_failures: u64,
    pub pending: usize,
}

struct Buffer {
    pending: VecDeque<AuditEntry>,
    next_sequence: u64,
    prev_hash: String,
}

struct Shared {
    config: AuditConfig,
    instance: String,
    buffer: Mutex<Buffer>,
    /// Flushed entries, newest last, capped at `history_capacity`.
    history: Mutex<VecDeque<AuditEntry>>,
    detector: Mutex<SuspicionDetector>,
    sink: Arc<dyn AuditSink>,
    alerts: Arc<AlertBus>,
    /// Serializes flushes so batches reach the sink in sequence order.
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    stopping: AtomicBool,
    assigned: AtomicU64,
    filtered: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn pending_len(&self) -> usize {
        lock(&self.buffer).pending.len()
    }

    async fn flush(&self) -> Result<usize, HsmError> {
        let _flushing = self.flush_lock.lock().await;

        let batch: Vec<AuditEntry> = lock(&self.buffer).pending.drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let sink = self.sink.clone();
        let to_write = batch.clone();
        let written = match tokio::task::spawn_blocking(move || sink.write_batch(&to_write)).await {
            Ok(result) => result,
            Err(join) => Err(HsmError::AuditFlush(format!("sink panicked: {}", join))),
        };

        let count = batch.len();
        match written {
            Ok(()) => {
                if self.config.mirror_to_tracing {
                    let _ = TracingAuditSink.write_batch(&batch);
                }
                let mut history = lock(&self.history);
                history.extend(batch);
                while history.len() > self.config.history_capacity {
                    history.pop_front();
                }
                drop(history);
                self.flushed.fetch_add(count as u64, Ordering::Relaxed);
                tracing::debug!(entries = count, "audit batch flushed");
                Ok(count)
            }
            Err(e) => {
                {
                    let mut buffer = lock(&self.buffer);
                    for entry in batch.into_iter().rev() {
                        buffer.pending.push_front(entry);
                    }
                }
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(entries = count, error = %e, "audit flush failed, entries requeued");
                self.alerts.emit(AlertKind::AuditFlushFailed {
                    entries: count,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// Cloneable handle to one audit log.
#[derive(Clone)]
pub struct AuditLogger {
    shared: Arc<Shared>,
    flusher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditLogger {
    /// Build the logger `config` describes: a rotating file sink when
    /// `log_dir` is set (encrypted when `encrypt` is), memory otherwise.
    pub fn new(config: AuditConfig, alerts: Arc<AlertBus>) -> Result<Self, HsmError> {
        let sink: Arc<dyn AuditSink> = match &config.log_dir {
            Some(dir) => {
                let key = config.load_key()?;
                Arc::new(RotatingFileSink::open(dir.clone(), config.max_file_bytes, key)?)
            }
            None => Arc::new(MemorySink::new()),
        };
        Self::with_sink(config, sink, alerts)
    }

    /// Build a logger over a caller-supplied sink, resuming its chain.
    pub fn with_sink(config: AuditConfig, sink: Arc<dyn AuditSink>, alerts: Arc<AlertBus>) -> Result<Self, HsmError> {
        let (next_sequence, prev_hash) = match sink.resume_point()? {
            Some(head) => {
                tracing::info!(sequence = head.sequence, "audit chain resumed");
                (head.sequence + 1, head.hash)
            }
            None => (1, genesis_hash()),
        };

        let mut tag = [0u8; 4];
        rand_core::OsRng.fill_bytes(&mut tag);

        let detector = SuspicionDetector::new(config.failure_threshold, config.window());
        Ok(Self {
            shared: Arc::new(Shared {
                instance: hex::encode(tag),
                buffer: Mutex::new(Buffer {
                    pending: VecDeque::new(),
                    next_sequence,
                    prev_hash,
                }),
                history: Mutex::new(VecDeque::new()),
                detector: Mutex::new(detector),
                sink,
                alerts,
                flush_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                stopping: AtomicBool::new(false),
                assigned: AtomicU64::new(0),
                filtered: AtomicU64::new(0),
                flushed: AtomicU64::new(0),
                flush_failures: AtomicU64::new(0),
                config,
            }),
            flusher: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the background flusher. Idempotent.
    pub fn start(&self) {
        let mut slot = lock(&self.flusher);
        if slot.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.flush_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.wake.notified() => {}
                }
                if shared.pending_len() > 0 {
                    // Failures are logged, alerted and retried on the next round.
                    let _ = shared.flush().await;
                }
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
        }));
    }

    /// Stamp and enqueue one entry. Never fails and never waits on I/O.
    ///
    /// Every call consumes a sequence number, even when the level filter
    /// drops the entry; the returned id is the operation's id either way.
    pub fn log_operation(&self, record: AuditRecord) -> OperationId {
        let shared = &self.shared;
        let keep = retains(shared.config.level, record.operation, record.result);

        let (id, appended, wake) = {
            let mut buffer = lock(&shared.buffer);
            let id = OperationId {
                instance: shared.instance.clone(),
                sequence: buffer.next_sequence,
            };
            buffer.next_sequence += 1;

            if !keep {
                (id, None, false)
            } else {
                match AuditEntry::seal(record, id.clone(), buffer.prev_hash.clone()) {
                    Ok(entry) => {
                        buffer.prev_hash = entry.integrity_hash.clone();
                        let wake = entry.is_high_priority()
                            || buffer.pending.len() + 1 >= shared.config.flush_threshold;
                        buffer.pending.push_back(entry.clone());
                        (id, Some(entry), wake)
                    }
                    Err(e) => {
                        tracing::error!(operation_id = %id, error = %e, "audit entry could not be sealed");
                        (id, None, false)
                    }
                }
            }
        };

        shared.assigned.fetch_add(1, Ordering::Relaxed);
        match appended {
            None => {
                shared.filtered.fetch_add(1, Ordering::Relaxed);
            }
            Some(entry) => {
                let found = lock(&shared.detector).observe(&entry);
                if let Some(activity) = found {
                    tracing::warn!(
                        operation_id = %activity.operation_id,
                        key_id = ?activity.key_id.as_ref().map(|k| k.as_str()),
                        kind = ?activity.kind,
                        actor = %activity.actor,
                        "suspicious activity"
                    );
                    shared.alerts.emit(AlertKind::SuspiciousActivity(activity));
                }
            }
        }

        if wake {
            shared.wake.notify_one();
        }
        id
    }

    /// Flush everything buffered now.
    pub async fn flush(&self) -> Result<usize, HsmError> {
        self.shared.flush().await
    }

    /// Stop the flusher and flush what is left.
    pub async fn shutdown(&self) -> Result<(), HsmError> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = lock(&self.flusher).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.shared.pending_len() > 0 {
            self.shared.flush().await?;
        }
        Ok(())
    }

    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    pub fn level(&self) -> AuditLevel {
        self.shared.config.level
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Retained entries still in memory, flushed history first.
    pub fn recent_entries(&self) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = lock(&self.shared.history).iter().cloned().collect();
        entries.extend(lock(&self.shared.buffer).pending.iter().cloned());
        entries
    }

    pub fn entries_for_key(&self, key: &KeyId) -> Vec<AuditEntry> {
        self.recent_entries()
            .into_iter()
            .filter(|e| e.key_id.as_ref() == Some(key) || e.related_key_id.as_ref() == Some(key))
            .collect()
    }

    pub fn statistics(&self, range: &TimeRange) -> AuditStatistics {
        AuditStatistics::compute(&self.recent_entries(), range)
    }

    pub fn counters(&self) -> AuditCounters {
        let s = &self.shared;
        AuditCounters {
            assigned: s.assigned.load(Ordering::Relaxed),
            filtered: s.filtered.load(Ordering::Relaxed),
            flushed: s.flushed.load(Ordering::Relaxed),
            flush_failures: s.flush_failures.load(Ordering::Relaxed),
            pending: s.pending_len(),
        }
    }
}
