use citadel_hsm::audit::sink::{decode_batch, encode_batch, log_files};
use citadel_hsm::*;
use proptest::prelude::*;
use std::path::{Path, PathBuf};

fn logging_config(dir: &Path, max_file_bytes: u64) -> HsmConfig {
    let mut config = HsmConfig::simulation(17);
    config.health.interval_ms = 0;
    config.audit.log_dir = Some(dir.to_path_buf());
    config.audit.max_file_bytes = max_file_bytes;
    config
}

/// Run a short workload, flushing every few operations so the log holds
/// several batches. Returns how many operation ids were handed out.
async fn workload(config: HsmConfig, rounds: usize) -> u64 {
    let hsm = Hsm::new(config).unwrap();
    hsm.initialize().await.unwrap();
    let key = hsm
        .generate_key(GenerateKeyParams::new("AES-256-GCM"))
        .await
        .into_result()
        .unwrap();
    for round in 0..rounds {
        let sealed = hsm
            .encrypt(EncryptParams::new(key.id.clone(), format!("record {}", round).into_bytes()))
            .await
            .into_result()
            .unwrap();
        hsm.decrypt(DecryptParams::from(&sealed)).await.into_result().unwrap();
        hsm.generate_key(GenerateKeyParams::new("NOT-AN-ALGORITHM")).await;
        hsm.audit().flush().await.unwrap();
    }
    let assigned = hsm.audit().counters().assigned;
    hsm.shutdown().await.unwrap();
    assigned
}

fn run<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

/// Every non-empty line of every log file, oldest first.
fn lines(dir: &Path) -> Vec<(PathBuf, usize)> {
    let mut out = Vec::new();
    for path in log_files(dir).unwrap() {
        let text = std::fs::read_to_string(&path).unwrap();
        for (n, line) in text.lines().enumerate() {
            if !line.trim().is_empty() {
                out.push((path.clone(), n));
            }
        }
    }
    out
}

fn rewrite_line(path: &Path, n: usize, replacement: Option<String>) {
    let text = std::fs::read_to_string(path).unwrap();
    let mut out: Vec<String> = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if i == n {
            if let Some(r) = &replacement {
                out.push(r.clone());
            }
        } else {
            out.push(line.to_string());
        }
    }
    let mut joined = out.join("\n");
    if !joined.is_empty() {
        joined.push('\n');
    }
    std::fs::write(path, joined).unwrap();
}

#[tokio::test]
async fn rotated_logs_verify_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let assigned = workload(logging_config(dir.path(), 2048), 8).await;

    let files = log_files(dir.path()).unwrap();
    assert!(files.len() > 1, "expected rotation, got {} file(s)", files.len());

    let report = verify_log_directory(dir.path(), None).unwrap();
    assert_eq!(report.entries as u64, assigned);
    assert_eq!(report.files, files.len());
    assert_eq!(report.first_sequence, Some(1));
    assert_eq!(report.last_sequence, Some(assigned));
}

#[tokio::test]
async fn sequence_and_chain_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first = workload(logging_config(dir.path(), 4096), 3).await;
    let head = verify_log_directory(dir.path(), None).unwrap();

    let second = workload(logging_config(dir.path(), 4096), 3).await;
    let report = verify_log_directory(dir.path(), None).unwrap();
    assert_eq!(report.entries as u64, first + second);
    assert_eq!(report.last_sequence, Some(first + second));

    // The second run's first entry links to the first run's head.
    let all: Vec<AuditEntry> = log_files(dir.path())
        .unwrap()
        .iter()
        .flat_map(|p| {
            std::fs::read_to_string(p)
                .unwrap()
                .lines()
                .filter(|l| !l.trim().is_empty())
                .flat_map(|l| decode_batch(l, None).unwrap().1)
                .collect::<Vec<_>>()
        })
        .collect();
    let resumed = &all[first as usize];
    assert_eq!(resumed.operation_id.sequence, first + 1);
    assert_eq!(Some(&resumed.prev_hash), head.head.as_ref());
    assert_ne!(resumed.operation_id.instance, all[0].operation_id.instance);
}

#[tokio::test]
async fn encrypted_logs_need_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let key = [0x5au8; 32];
    let var = "CITADEL_HSM_TEST_AUDIT_KEY_ENCRYPTED";
    std::env::set_var(var, hex::encode(key));

    let mut config = logging_config(dir.path(), 1 << 20);
    config.audit.encrypt = true;
    config.audit.key_env_var = var.into();
    let assigned = workload(config, 2).await;

    let raw: String = log_files(dir.path())
        .unwrap()
        .iter()
        .map(|p| std::fs::read_to_string(p).unwrap())
        .collect();
    assert!(!raw.contains("NOT-AN-ALGORITHM"));
    assert!(!raw.contains("integrity_hash"));

    let report = verify_log_directory(dir.path(), Some(&key)).unwrap();
    assert_eq!(report.entries as u64, assigned);

    let no_key = verify_log_directory(dir.path(), None).unwrap_err();
    assert_eq!(no_key.code(), "INTEGRITY_VERIFICATION_ERROR");
    let wrong = verify_log_directory(dir.path(), Some(&[0u8; 32])).unwrap_err();
    assert_eq!(wrong.code(), "INTEGRITY_VERIFICATION_ERROR");
}

#[test]
fn missing_encryption_key_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = logging_config(dir.path(), 1 << 20);
    config.audit.encrypt = true;
    config.audit.key_env_var = "CITADEL_HSM_TEST_AUDIT_KEY_UNSET".into();
    std::env::remove_var("CITADEL_HSM_TEST_AUDIT_KEY_UNSET");

    let err = Hsm::new(config).unwrap_err();
    assert!(matches!(err, HsmError::Configuration(_)));
}

#[derive(Clone, Debug)]
enum Tamper {
    EditLatency { batch: usize, entry: usize },
    EditResult { batch: usize, entry: usize },
    DropBatch { batch: usize },
    SwapBatches { batch: usize },
}

fn tamper() -> impl Strategy<Value = Tamper> {
    prop_oneof![
        (any::<usize>(), any::<usize>()).prop_map(|(batch, entry)| Tamper::EditLatency { batch, entry }),
        (any::<usize>(), any::<usize>()).prop_map(|(batch, entry)| Tamper::EditResult { batch, entry }),
        any::<usize>().prop_map(|batch| Tamper::DropBatch { batch }),
        any::<usize>().prop_map(|batch| Tamper::SwapBatches { batch }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_tampering_is_detected(t in tamper()) {
        let dir = tempfile::tempdir().unwrap();
        run(workload(logging_config(dir.path(), 1024), 4));
        prop_assert!(verify_log_directory(dir.path(), None).is_ok());

        let batches = lines(dir.path());
        prop_assume!(batches.len() >= 2);
        let read = |i: usize| {
            let (path, n) = &batches[i];
            let text = std::fs::read_to_string(path).unwrap();
            text.lines().nth(*n).unwrap().to_string()
        };

        match t {
            Tamper::EditLatency { batch, entry } | Tamper::EditResult { batch, entry } => {
                let i = batch % batches.len();
                let (_, mut entries) = decode_batch(&read(i), None).unwrap();
                let j = entry % entries.len();
                if matches!(t, Tamper::EditLatency { .. }) {
                    entries[j].performance.duration_ms += 1;
                } else {
                    entries[j].result = if entries[j].result.is_success() {
                        OperationResult::Failure
                    } else {
                        OperationResult::Success
                    };
                }
                let (path, n) = &batches[i];
                rewrite_line(path, *n, Some(encode_batch(&entries, None).unwrap()));
            }
            Tamper::DropBatch { batch } => {
                // Truncating the tail is indistinguishable from a shorter log.
                let i = batch % (batches.len() - 1);
                let (path, n) = &batches[i];
                rewrite_line(path, *n, None);
            }
            Tamper::SwapBatches { batch } => {
                let i = batch % (batches.len() - 1);
                let (a, b) = (read(i), read(i + 1));
                let (pa, na) = &batches[i];
                let (pb, nb) = &batches[i + 1];
                rewrite_line(pa, *na, Some(b));
                rewrite_line(pb, *nb, Some(a));
            }
        }

        let err = verify_log_directory(dir.path(), None).unwrap_err();
        prop_assert_eq!(err.code(), "INTEGRITY_VERIFICATION_ERROR");
    }
}
