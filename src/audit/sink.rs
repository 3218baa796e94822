//! Where flushed audit batches go.
//!
//! On disk a log directory holds timestamp-named JSONL files; each line is
//! one flushed batch:
//!
//! ```text
//! audit/
//!   audit-20261015T093012.004518Z-00000000000000000001.jsonl
//!   audit-20261015T101544.771020Z-00000000000000000187.jsonl
//! ```
//!
//! A batch line is `{"header": {...}, "entries": [...]}` or, when the log
//! is encrypted, `{"header": {...}, "ciphertext": "<hex>"}` where the
//! ciphertext is the AES-256-GCM sealed JSON array of entries and the
//! header JSON is the associated data.

use super::entry::AuditEntry;
use crate::error::HsmError;
use chrono::{DateTime, Utc};
use citadel_hsm_crypto::aead;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

pub const FILE_PREFIX: &str = "audit-";
pub const FILE_SUFFIX: &str = ".jsonl";

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Last link of an existing chain, used to resume after a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u64,
    pub hash: String,
}

/// Durable destination for flushed batches.
///
/// Synchronous; the logger calls it from the blocking pool. A batch either
/// lands completely or `write_batch` fails and the logger retries it.
pub trait AuditSink: Send + Sync {
    fn write_batch(&self, batch: &[AuditEntry]) -> Result<(), HsmError>;

    /// Chain head of whatever the sink already holds.
    fn resume_point(&self) -> Result<Option<ChainHead>, HsmError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Logs each entry via `tracing` under the `citadel_hsm::audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write_batch(&self, batch: &[AuditEntry]) -> Result<(), HsmError> {
        for entry in batch {
            tracing::info!(
                target: "citadel_hsm::audit",
                operation_id = %entry.operation_id,
                operation = %entry.operation,
                key_id = ?entry.key_id.as_ref().map(|k| k.as_str()),
                result = %entry.result,
                error_code = ?entry.error_code,
                duration_ms = entry.performance.duration_ms,
                actor = %entry.security.actor,
                "audit"
            );
        }
        Ok(())
    }
}

/// Keeps batches in memory (for tests and runs without a log directory).
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<AuditEntry>>>,
    /// Number of upcoming writes to fail.
    fail_next: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail.
    pub fn fail_next(&self, n: usize) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = n;
    }

    pub fn batches(&self) -> Vec<Vec<AuditEntry>> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.batches().into_iter().flatten().collect()
    }
}

impl AuditSink for MemorySink {
    fn write_batch(&self, batch: &[AuditEntry]) -> Result<(), HsmError> {
        {
            let mut fail = self.fail_next.lock().unwrap_or_else(|p| p.into_inner());
            if *fail > 0 {
                *fail -= 1;
                return Err(HsmError::AuditFlush("injected write failure".into()));
            }
        }
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(batch.to_vec());
        Ok(())
    }

    fn resume_point(&self) -> Result<Option<ChainHead>, HsmError> {
        let batches = self.batches.lock().unwrap_or_else(|p| p.into_inner());
        Ok(batches.iter().flatten().last().map(|e| ChainHead {
            sequence: e.operation_id.sequence,
            hash: e.integrity_hash.clone(),
        }))
    }
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn write_batch(&self, batch: &[AuditEntry]) -> Result<(), HsmError> {
        (**self).write_batch(batch)
    }

    fn resume_point(&self) -> Result<Option<ChainHead>, HsmError> {
        (**self).resume_point()
    }
}

// ---------------------------------------------------------------------------
// Batch lines
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub count: usize,
    pub written_at: DateTime<Utc>,
    pub encrypted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchLine {
    pub header: BatchHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<AuditEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
}

fn io_error(what: &str, e: impl std::fmt::Display) -> HsmError {
    HsmError::AuditFlush(format!("{}: {}", what, e))
}

fn integrity(msg: impl Into<String>) -> HsmError {
    HsmError::IntegrityVerification(msg.into())
}

/// Serialize one batch to a single line (no trailing newline).
pub fn encode_batch(batch: &[AuditEntry], key: Option<&[u8; 32]>) -> Result<String, HsmError> {
    let (first, last) = match (batch.first(), batch.last()) {
        (Some(f), Some(l)) => (f.operation_id.sequence, l.operation_id.sequence),
        _ => return Err(io_error("encode", "empty batch")),
    };
    let header = BatchHeader {
        first_sequence: first,
        last_sequence: last,
        count: batch.len(),
        written_at: Utc::now(),
        encrypted: key.is_some(),
    };

    let line = match key {
        None => BatchLine {
            header,
            entries: Some(batch.to_vec()),
            ciphertext: None,
        },
        Some(key) => {
            let aad = serde_json::to_vec(&header).map_err(|e| io_error("encode header", e))?;
            let body = Zeroizing::new(serde_json::to_vec(batch).map_err(|e| io_error("encode", e))?);
            let sealed = aead::seal(key, &body, &aad).map_err(|e| io_error("encrypt", e))?;
            BatchLine {
                header,
                entries: None,
                ciphertext: Some(hex::encode(sealed)),
            }
        }
    };
    serde_json::to_string(&line).map_err(|e| io_error("encode", e))
}

/// Parse one batch line back into entries, decrypting if needed.
///
/// Checks the header against the entries it describes; hash and chain
/// checks are the verifier's job.
pub fn decode_batch(line: &str, key: Option<&[u8; 32]>) -> Result<(BatchHeader, Vec<AuditEntry>), HsmError> {
    let parsed: BatchLine =
        serde_json::from_str(line).map_err(|e| integrity(format!("malformed batch: {}", e)))?;

    let entries = match (parsed.entries, parsed.ciphertext) {
        (Some(entries), None) if !parsed.header.encrypted => entries,
        (None, Some(ct_hex)) if parsed.header.encrypted => {
            let key = key.ok_or_else(|| integrity("encrypted batch but no audit key"))?;
            let sealed = hex::decode(ct_hex).map_err(|_| integrity("ciphertext is not hex"))?;
            let aad = serde_json::to_vec(&parsed.header).map_err(|e| integrity(e.to_string()))?;
            let body = aead::open(key, &sealed, &aad)
                .map_err(|_| integrity("batch fails authentication"))?;
            serde_json::from_slice(&body).map_err(|e| integrity(format!("malformed batch body: {}", e)))?
        }
        _ => return Err(integrity("batch body does not match its header")),
    };

    let header = parsed.header;
    let first = entries.first().map(|e| e.operation_id.sequence);
    let last = entries.last().map(|e| e.operation_id.sequence);
    if entries.len() != header.count
        || first != Some(header.first_sequence)
        || last != Some(header.last_sequence)
    {
        return Err(integrity("batch header does not describe its entries"));
    }
    Ok((header, entries))
}

// ---------------------------------------------------------------------------
// Rotating file sink
// ---------------------------------------------------------------------------

/// Log files in `dir`, oldest first.
pub fn log_files(dir: &Path) -> Result<Vec<PathBuf>, HsmError> {
    let mut files = Vec::new();
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(io_error("read log dir", e)),
    };
    for entry in read {
        let path = entry.map_err(|e| io_error("read log dir", e))?.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
        if is_log {
            files.push(path);
        }
    }
    // Names start with a fixed-width UTC timestamp, so name order is time order.
    files.sort();
    Ok(files)
}

fn file_name(at: DateTime<Utc>, first_sequence: u64) -> String {
    format!(
        "{}{}-{:020}{}",
        FILE_PREFIX,
        at.format("%Y%m%dT%H%M%S%.6fZ"),
        first_sequence,
        FILE_SUFFIX
    )
}

struct CurrentFile {
    path: PathBuf,
    size: u64,
}

/// Newline-terminated lines of a log file, plus whether it ends in an
/// unterminated fragment left by an interrupted write. The fragment is
/// never part of the log.
pub fn read_log_lines(path: &Path) -> std::io::Result<(Vec<String>, bool)> {
    let bytes = std::fs::read(path)?;
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let torn = complete < bytes.len();
    let text = std::str::from_utf8(&bytes[..complete])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((text.lines().map(str::to_string).collect(), torn))
}

/// Cut an unterminated fragment off the end of `path`. Returns the new length.
fn drop_torn_tail(path: &Path) -> Result<u64, HsmError> {
    let bytes = std::fs::read(path).map_err(|e| io_error("read", e))?;
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if complete < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            bytes = bytes.len() - complete,
            "dropping partial audit batch at end of log"
        );
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_len(complete as u64))
            .map_err(|e| io_error("truncate", e))?;
    }
    Ok(complete as u64)
}

/// What `append_line` writes to.
trait LogFile: Write {
    fn len(&self) -> std::io::Result<u64>;
    fn sync(&mut self) -> std::io::Result<()>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for std::fs::File {
    fn len(&self) -> std::io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

enum AppendFailure {
    /// The file is back to its previous length.
    RolledBack(HsmError),
    /// Part of the line may still be in the file.
    Torn(HsmError),
}

/// Append `line` whole or not at all. Returns the new file length.
fn append_line<F: LogFile>(file: &mut F, line: &[u8]) -> Result<u64, AppendFailure> {
    let before = file
        .len()
        .map_err(|e| AppendFailure::RolledBack(io_error("stat", e)))?;
    match file.write_all(line).and_then(|()| file.sync()) {
        Ok(()) => Ok(before + line.len() as u64),
        Err(e) => match file.truncate(before) {
            Ok(()) => Err(AppendFailure::RolledBack(io_error("write", e))),
            Err(t) => Err(AppendFailure::Torn(io_error(
                "write",
                format!("{}; rollback failed: {}", e, t),
            ))),
        },
    }
}

/// Appends batches to timestamp-named files, starting a new file once the
/// current one would exceed `max_file_bytes`.
pub struct RotatingFileSink {
    dir: PathBuf,
    max_file_bytes: u64,
    key: Option<Zeroizing<[u8; 32]>>,
    current: Mutex<Option<CurrentFile>>,
}

impl RotatingFileSink {
    pub fn open(dir: impl Into<PathBuf>, max_file_bytes: u64, key: Option<[u8; 32]>) -> Result<Self, HsmError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error("create log dir", e))?;
        // Continue appending to the newest file if it still has room.
        let current = match log_files(&dir)?.pop() {
            Some(path) => {
                let size = drop_torn_tail(&path)?;
                Some(CurrentFile { path, size })
            }
            None => None,
        };
        Ok(Self {
            dir,
            max_file_bytes,
            key: key.map(Zeroizing::new),
            current: Mutex::new(current),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key(&self) -> Option<&[u8; 32]> {
        self.key.as_deref()
    }
}

impl AuditSink for RotatingFileSink {
    fn write_batch(&self, batch: &[AuditEntry]) -> Result<(), HsmError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let mut line = encode_batch(batch, self.key())?;
        line.push('\n');
        let len = line.len() as u64;

        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        let rotate = match current.as_ref() {
            None => true,
            // A batch bigger than the ceiling still gets a file of its own.
            Some(file) => file.size > 0 && file.size + len > self.max_file_bytes,
        };
        if rotate {
            let path = self.dir.join(file_name(Utc::now(), first.operation_id.sequence));
            tracing::info!(path = %path.display(), "audit log rotated");
            *current = Some(CurrentFile { path, size: 0 });
        }
        let Some(file) = current.as_mut() else {
            return Err(io_error("rotate", "no current file"));
        };

        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)
            .map_err(|e| io_error("open", e))?;
        match append_line(&mut handle, line.as_bytes()) {
            Ok(size) => {
                file.size = size;
                Ok(())
            }
            Err(AppendFailure::RolledBack(e)) => Err(e),
            Err(AppendFailure::Torn(e)) => {
                tracing::error!(
                    path = %file.path.display(),
                    error = %e,
                    "audit log holds a partial batch, continuing in a new file"
                );
                *current = None;
                Err(e)
            }
        }
    }

    fn resume_point(&self) -> Result<Option<ChainHead>, HsmError> {
        let Some(newest) = log_files(&self.dir)?.pop() else {
            return Ok(None);
        };
        let (lines, _) = read_log_lines(&newest).map_err(|e| io_error("read", e))?;
        let Some(line) = lines.into_iter().rev().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let (_, entries) = decode_batch(&line, self.key())?;
        Ok(entries.last().map(|e| ChainHead {
            sequence: e.operation_id.sequence,
            hash: e.integrity_hash.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::record;
    use crate::audit::entry::{genesis_hash, OperationId};
    use crate::types::{OperationResult, OperationType};

    fn batch(from: u64, n: u64) -> Vec<AuditEntry> {
        let mut prev = genesis_hash();
        (from..from + n)
            .map(|seq| {
                let e = AuditEntry::seal(
                    record(OperationType::Encrypt, OperationResult::Success),
                    OperationId { instance: "t".into(), sequence: seq },
                    prev.clone(),
                )
                .unwrap();
                prev = e.integrity_hash.clone();
                e
            })
            .collect()
    }

    #[test]
    fn batch_line_roundtrip_plain_and_encrypted() {
        let b = batch(1, 3);
        let plain = encode_batch(&b, None).unwrap();
        assert_eq!(decode_batch(&plain, None).unwrap().1, b);

        let key = aead::generate_key().unwrap();
        let sealed = encode_batch(&b, Some(&key)).unwrap();
        assert!(!sealed.contains("integrity_hash"));
        assert_eq!(decode_batch(&sealed, Some(&key)).unwrap().1, b);
        assert!(matches!(decode_batch(&sealed, None), Err(HsmError::IntegrityVerification(_))));
        let wrong = aead::generate_key().unwrap();
        assert!(matches!(decode_batch(&sealed, Some(&wrong)), Err(HsmError::IntegrityVerification(_))));
    }

    #[test]
    fn header_mismatch_detected() {
        let line = encode_batch(&batch(1, 2), None).unwrap();
        let forged = line.replace("\"count\":2", "\"count\":3");
        assert!(decode_batch(&forged, None).is_err());
    }

    #[test]
    fn rotates_at_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::open(dir.path(), 1, None).unwrap();
        sink.write_batch(&batch(1, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        sink.write_batch(&batch(2, 1)).unwrap();
        assert_eq!(log_files(dir.path()).unwrap().len(), 2);
        assert_eq!(sink.resume_point().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn appends_below_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        sink.write_batch(&batch(1, 2)).unwrap();
        sink.write_batch(&batch(3, 2)).unwrap();
        assert_eq!(log_files(dir.path()).unwrap().len(), 1);

        let reopened = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        assert_eq!(reopened.resume_point().unwrap().unwrap().sequence, 4);
    }

    /// A log file that fails on demand.
    struct FlakyFile {
        inner: std::fs::File,
        /// Bytes accepted before writes start failing.
        write_limit: Option<usize>,
        fail_sync: bool,
    }

    impl FlakyFile {
        fn open(path: &Path) -> Self {
            let inner = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            Self { inner, write_limit: None, fail_sync: false }
        }
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match self.write_limit {
                Some(0) => Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device")),
                Some(n) => {
                    let written = self.inner.write(&buf[..n.min(buf.len())])?;
                    self.write_limit = Some(n - written);
                    Ok(written)
                }
                None => self.inner.write(buf),
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl LogFile for FlakyFile {
        fn len(&self) -> std::io::Result<u64> {
            self.inner.len()
        }

        fn sync(&mut self) -> std::io::Result<()> {
            if self.fail_sync {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "sync failed"));
            }
            self.inner.sync_data()
        }

        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.inner.set_len(len)
        }
    }

    fn line_for(entries: &[AuditEntry]) -> String {
        let mut line = encode_batch(entries, None).unwrap();
        line.push('\n');
        line
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().len()
    }

    #[test]
    fn failed_sync_rolls_back_so_retry_is_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let all = batch(1, 4);
        let sink = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        sink.write_batch(&all[..2]).unwrap();
        let path = log_files(dir.path()).unwrap().remove(0);
        let before = file_len(&path);

        let mut flaky = FlakyFile::open(&path);
        flaky.fail_sync = true;
        assert!(matches!(
            append_line(&mut flaky, line_for(&all[2..]).as_bytes()),
            Err(AppendFailure::RolledBack(_))
        ));
        assert_eq!(file_len(&path), before);

        sink.write_batch(&all[2..]).unwrap();
        let report = crate::audit::verify::verify_log_directory(dir.path(), None).unwrap();
        assert_eq!(report.entries, 4);
        assert_eq!(report.last_sequence, Some(4));
    }

    #[test]
    fn short_write_rolls_back_so_retry_starts_a_clean_line() {
        let dir = tempfile::tempdir().unwrap();
        let all = batch(1, 4);
        let sink = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        sink.write_batch(&all[..2]).unwrap();
        let path = log_files(dir.path()).unwrap().remove(0);
        let before = file_len(&path);

        let mut flaky = FlakyFile::open(&path);
        flaky.write_limit = Some(40);
        assert!(append_line(&mut flaky, line_for(&all[2..]).as_bytes()).is_err());
        assert_eq!(file_len(&path), before);

        sink.write_batch(&all[2..]).unwrap();
        let reopened = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        assert_eq!(reopened.resume_point().unwrap().unwrap().sequence, 4);
        assert_eq!(crate::audit::verify::verify_log_directory(dir.path(), None).unwrap().entries, 4);
    }

    #[test]
    fn partial_batch_left_by_a_crash_is_skipped_then_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let all = batch(1, 4);
        let sink = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        sink.write_batch(&all[..2]).unwrap();
        let path = log_files(dir.path()).unwrap().remove(0);
        let clean = file_len(&path);
        let fragment = &line_for(&all[2..])[..60];
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(fragment.as_bytes())
            .unwrap();

        assert_eq!(sink.resume_point().unwrap().unwrap().sequence, 2);
        let report = crate::audit::verify::verify_log_directory(dir.path(), None).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.torn_tails, 1);

        let reopened = RotatingFileSink::open(dir.path(), 1 << 20, None).unwrap();
        assert_eq!(file_len(&path), clean);
        reopened.write_batch(&all[2..]).unwrap();
        let report = crate::audit::verify::verify_log_directory(dir.path(), None).unwrap();
        assert_eq!((report.entries, report.torn_tails), (4, 0));
    }

    #[test]
    fn memory_sink_failure_injection() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        assert!(sink.write_batch(&batch(1, 1)).is_err());
        assert!(sink.write_batch(&batch(1, 1)).is_ok());
        assert_eq!(sink.entries().len(), 1);
    }
}
