mod common;

use citadel_hsm::audit::AuditEntry;
use citadel_hsm::*;
use common::{registry_with, ScriptedToken, SCRIPTED_VENDOR};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn quiet(mut config: HsmConfig) -> HsmConfig {
    config.health.interval_ms = 0;
    config
}

async fn simulated() -> Hsm {
    let hsm = Hsm::new(quiet(HsmConfig::simulation(42))).unwrap();
    hsm.initialize().await.unwrap();
    hsm
}

/// Production mode over the scripted vendor, going through the pool.
async fn scripted(configure: impl FnOnce(&mut HsmConfig)) -> (Hsm, Arc<ScriptedToken>) {
    let token = Arc::new(ScriptedToken::new());
    let mut config = quiet(HsmConfig {
        vendor: SCRIPTED_VENDOR.into(),
        ..HsmConfig::default()
    });
    configure(&mut config);
    let hsm = Hsm::builder(config)
        .registry(registry_with(token.clone()))
        .build()
        .unwrap();
    hsm.initialize().await.unwrap();
    (hsm, token)
}

fn entries_for(hsm: &Hsm, operation_id: &str) -> Vec<AuditEntry> {
    hsm.audit()
        .recent_entries()
        .into_iter()
        .filter(|e| e.operation_id.to_string() == operation_id)
        .collect()
}

fn collect_alerts(hsm: &Hsm) -> Arc<Mutex<Vec<Alert>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    hsm.on_alert(move |a| sink.lock().unwrap().push(a.clone()));
    seen
}

async fn aes_key(hsm: &Hsm) -> KeyMetadata {
    hsm.generate_key(GenerateKeyParams::new("AES-256-GCM"))
        .await
        .into_result()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aes_generate_encrypt_decrypt() {
    let hsm = simulated().await;
    let key = aes_key(&hsm).await;
    assert_eq!(key.key_type, KeyType::Symmetric);
    assert_eq!(key.state, KeyState::Active);
    assert_eq!(key.version, 1);

    let sealed = hsm
        .encrypt(EncryptParams::new(key.id.clone(), b"quarterly numbers".to_vec()).aad(b"board"))
        .await
        .into_result()
        .unwrap();
    assert_ne!(sealed.ciphertext, b"quarterly numbers");

    let opened = hsm.decrypt(DecryptParams::from(&sealed)).await.into_result().unwrap();
    assert_eq!(opened, b"quarterly numbers");

    let wrong_aad = hsm
        .decrypt(DecryptParams::new(key.id.clone(), sealed.ciphertext.clone()).aad(b"press"))
        .await;
    match wrong_aad.error() {
        Some(HsmError::VendorOperation { code, .. }) => assert_eq!(code, "CKR_ENCRYPTED_DATA_INVALID"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn production_and_simulation_audit_alike() {
    let sim = simulated().await;
    let (prod, _) = scripted(|_| {}).await;

    for hsm in [&sim, &prod] {
        let key = aes_key(hsm).await;
        let out = hsm.encrypt(EncryptParams::new(key.id.clone(), b"x".to_vec())).await;
        assert!(out.is_success());
        let ops: Vec<_> = hsm.audit().recent_entries().iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![OperationType::GenerateKey, OperationType::Encrypt]);
    }
    let entry = prod.audit().recent_entries().pop().unwrap();
    assert!(entry.security.connection_id.is_some());
    assert_eq!(entry.security.vendor, SCRIPTED_VENDOR);
    assert!(sim.audit().recent_entries()[1].security.connection_id.is_none());
}

// ---------------------------------------------------------------------------
// Audit coverage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn minimal_level_keeps_only_failures() {
    let hsm = Hsm::new(quiet(HsmConfig {
        audit: config::AuditConfig {
            level: AuditLevel::Minimal,
            ..Default::default()
        },
        ..HsmConfig::simulation(1)
    }))
    .unwrap();
    hsm.initialize().await.unwrap();

    let key = aes_key(&hsm).await;
    assert!(hsm.encrypt(EncryptParams::new(key.id.clone(), b"x".to_vec())).await.is_success());
    let failed = hsm.sign(SignParams::new(KeyId::new("absent"), b"x".to_vec())).await;
    assert!(!failed.is_success());

    let entries = hsm.audit().recent_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, OperationType::Sign);
    assert_eq!(entries[0].result, OperationResult::Failure);
    assert_eq!(entries[0].operation_id.to_string(), failed.operation_id);
    assert_eq!(hsm.audit().counters().filtered, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_call_is_audited_once_even_when_the_adapter_panics() {
    let (hsm, token) = scripted(|_| {}).await;
    let key = aes_key(&hsm).await;
    let signer = hsm
        .generate_key(GenerateKeyParams::new("Ed25519"))
        .await
        .into_result()
        .unwrap();

    let sealed = hsm
        .encrypt(EncryptParams::new(key.id.clone(), b"payload".to_vec()))
        .await
        .into_result()
        .unwrap();
    let mut ids = vec![
        hsm.decrypt(DecryptParams::from(&sealed)).await.operation_id,
        hsm.sign(SignParams::new(signer.id.clone(), b"m".to_vec())).await.operation_id,
        hsm.verify(VerifyParams::new(signer.id.clone(), b"m".to_vec(), vec![0u8; 64])).await.operation_id,
        hsm.encrypt(EncryptParams::new(KeyId::new("missing"), b"x".to_vec())).await.operation_id,
        hsm.generate_key(GenerateKeyParams::new("ROT13")).await.operation_id,
    ];

    token.panic_on_encrypt.store(true, Ordering::SeqCst);
    let panicked = hsm.encrypt(EncryptParams::new(key.id.clone(), b"payload".to_vec())).await;
    match panicked.error() {
        Some(HsmError::VendorOperation { code, connection_lost, .. }) => {
            assert_eq!(code, "ADAPTER_PANIC");
            assert!(connection_lost);
        }
        other => panic!("unexpected {:?}", other),
    }
    ids.push(panicked.operation_id.clone());

    for id in &ids {
        assert_eq!(entries_for(&hsm, id).len(), 1, "operation {}", id);
    }
    let last = entries_for(&hsm, &panicked.operation_id).pop().unwrap();
    assert_eq!(last.result, OperationResult::Failure);
    assert_eq!(last.error_code.as_deref(), Some("VENDOR_OPERATION_ERROR"));

    // Two generates, one encrypt, plus the calls above.
    assert_eq!(hsm.audit().counters().assigned, 3 + ids.len() as u64);
    let stats = hsm.pool_stats().unwrap();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.closed, 1);

    token.panic_on_encrypt.store(false, Ordering::SeqCst);
    assert!(hsm.encrypt(EncryptParams::new(key.id.clone(), b"again".to_vec())).await.is_success());
}

#[tokio::test]
async fn disconnect_mid_operation_reclaims_the_slot() {
    let (hsm, token) = scripted(|c| c.pool.capacity = 1).await;
    let signer = hsm
        .generate_key(GenerateKeyParams::new("ECDSA-P256"))
        .await
        .into_result()
        .unwrap();

    token.drop_on_sign.store(true, Ordering::SeqCst);
    let out = hsm.sign(SignParams::new(signer.id.clone(), b"m".to_vec())).await;
    assert!(matches!(
        out.error(),
        Some(HsmError::VendorOperation { connection_lost: true, .. })
    ));
    let entry = entries_for(&hsm, &out.operation_id).pop().unwrap();
    assert_eq!(entry.result, OperationResult::Failure);

    let stats = hsm.pool_stats().unwrap();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.closed, 1);

    token.drop_on_sign.store(false, Ordering::SeqCst);
    let again = hsm.sign(SignParams::new(signer.id.clone(), b"m".to_vec())).await;
    assert!(again.is_success());
    assert_eq!(hsm.pool_stats().unwrap().opened, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_pool_times_out_and_is_audited() {
    let (hsm, token) = scripted(|c| {
        c.pool.capacity = 1;
        c.pool.acquire_timeout_ms = 50;
    })
    .await;
    let key = aes_key(&hsm).await;
    token.delay_ms.store(300, Ordering::SeqCst);

    let slow = {
        let hsm = hsm.clone();
        let id = key.id.clone();
        tokio::spawn(async move { hsm.encrypt(EncryptParams::new(id, b"slow".to_vec())).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let starved = hsm.encrypt(EncryptParams::new(key.id.clone(), b"fast".to_vec())).await;

    let err = starved.error().cloned().unwrap();
    assert!(matches!(err, HsmError::PoolTimeout { .. }));
    assert!(err.is_recoverable());
    let entry = entries_for(&hsm, &starved.operation_id).pop().unwrap();
    assert_eq!(entry.error_code.as_deref(), Some("POOL_TIMEOUT"));
    assert!(entry.security.connection_id.is_none());

    assert!(slow.await.unwrap().is_success());
}

// ---------------------------------------------------------------------------
// Policy and lifecycle
// ---------------------------------------------------------------------------

fn classification() -> impl Strategy<Value = Classification> {
    prop_oneof![
        Just(Classification::Executive),
        Just(Classification::Strategic),
        Just(Classification::Confidential),
        Just(Classification::Internal),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn executive_keys_without_escrow_are_never_exportable(
        class in classification(),
        exportable in any::<bool>(),
        escrow in any::<bool>(),
        algorithm in prop_oneof![Just("AES-256-GCM"), Just("Ed25519"), Just("ML-KEM-768")],
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let key = rt.block_on(async {
            let hsm = Hsm::new(quiet(HsmConfig::simulation(5))).unwrap();
            hsm.initialize().await.unwrap();
            let params = GenerateKeyParams::new(algorithm)
                .classification(class)
                .exportable(exportable)
                .escrow(escrow);
            hsm.generate_key(params).await.into_result().unwrap()
        });
        if class == Classification::Executive {
            prop_assert!(!key.exportable);
        } else {
            prop_assert_eq!(key.exportable, exportable);
        }
        prop_assert_eq!(key.escrow_status, EscrowStatus::NotEscrowed);
    }
}

#[tokio::test]
async fn rotation_supersedes_and_links() {
    let hsm = simulated().await;
    let old = aes_key(&hsm).await;
    let sealed = hsm
        .encrypt(EncryptParams::new(old.id.clone(), b"before".to_vec()))
        .await
        .into_result()
        .unwrap();

    let rotated = hsm.rotate_key(&old.id).await;
    let op_id = rotated.operation_id.clone();
    let rotation = rotated.into_result().unwrap();
    let new = rotation.new_key;
    assert_eq!(rotation.old_key_id, old.id);
    assert_eq!(new.version, 2);
    assert_eq!(new.supersedes.as_ref(), Some(&old.id));
    assert_eq!(new.algorithm, old.algorithm);

    let old_now = hsm.get_key_metadata(&old.id).unwrap();
    assert_eq!(old_now.state, KeyState::Superseded);
    assert_eq!(old_now.superseded_by.as_ref(), Some(&new.id));

    let entry = entries_for(&hsm, &op_id).pop().unwrap();
    assert_eq!(entry.key_id.as_ref(), Some(&old.id));
    assert_eq!(entry.related_key_id.as_ref(), Some(&new.id));

    // Superseded keys still open old data but take no new work.
    assert!(hsm.decrypt(DecryptParams::from(&sealed)).await.is_success());
    let refused = hsm.encrypt(EncryptParams::new(old.id.clone(), b"after".to_vec())).await;
    assert!(matches!(refused.error(), Some(HsmError::Unauthorized(_))));
    assert!(matches!(hsm.rotate_key(&old.id).await.error(), Some(HsmError::Unauthorized(_))));

    // Both keys' access logs carry the rotation.
    let new_now = hsm.get_key_metadata(&new.id).unwrap();
    assert!(new_now.access_log.iter().any(|a| a.operation_id == op_id));
    assert!(old_now.access_log.iter().any(|a| a.operation_id == op_id));
}

#[tokio::test]
async fn bulk_generation_stops_at_first_failure() {
    let hsm = simulated().await;
    let requests = vec![
        GenerateKeyParams::new("AES-256-GCM"),
        GenerateKeyParams::new("Ed25519"),
        GenerateKeyParams::new("ROT13"),
        GenerateKeyParams::new("ML-KEM-768"),
    ];
    let out = hsm.generate_bulk_keys(requests).await;
    let summary_id = out.operation_id.clone();
    let report = out.into_result().unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.generated.len(), 2);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.index, 2);
    assert!(matches!(failure.error, HsmError::UnsupportedAlgorithm(_)));
    assert_eq!(report.remaining.len(), 1);
    assert_eq!(report.remaining[0].algorithm, "ML-KEM-768");
    assert_eq!(hsm.list_keys().unwrap().len(), 2);

    let summary = entries_for(&hsm, &summary_id).pop().unwrap();
    assert_eq!(summary.operation, OperationType::GenerateBulkKeys);
    assert_eq!(summary.result, OperationResult::Failure);
    assert_eq!(summary.error_code.as_deref(), Some("UNSUPPORTED_ALGORITHM"));
    assert_eq!(entries_for(&hsm, &failure.operation_id).len(), 1);

    let empty = hsm.generate_bulk_keys(Vec::new()).await;
    assert!(matches!(empty.error(), Some(HsmError::InvalidParameters(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_use_of_one_key_appends_every_access() {
    let (hsm, token) = scripted(|c| c.pool.capacity = 4).await;
    let key = aes_key(&hsm).await;
    token.delay_ms.store(5, Ordering::SeqCst);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let hsm = hsm.clone();
            let id = key.id.clone();
            tokio::spawn(async move { hsm.encrypt(EncryptParams::new(id, vec![i as u8; 8])).await })
        })
        .collect();
    let mut issued = HashSet::new();
    for t in tasks {
        let out = t.await.unwrap();
        assert!(out.is_success());
        issued.insert(out.operation_id);
    }

    let log = hsm.get_key_metadata(&key.id).unwrap().access_log;
    assert_eq!(log.len(), 17);
    assert_eq!(log[0].operation, OperationType::GenerateKey);
    // Completion order, not issue order: only membership is guaranteed.
    let logged: HashSet<_> = log[1..].iter().map(|a| a.operation_id.clone()).collect();
    assert_eq!(logged, issued);
}

#[tokio::test]
async fn delete_and_export_are_flushed_immediately() {
    let sink = Arc::new(MemorySink::new());
    let hsm = Hsm::builder(quiet(HsmConfig::simulation(9)))
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    hsm.initialize().await.unwrap();

    let key = hsm
        .generate_key(GenerateKeyParams::new("Ed25519"))
        .await
        .into_result()
        .unwrap();
    assert!(hsm.get_public_key(&key.id).await.is_success());
    assert!(hsm.delete_key(&key.id).await.is_success());

    tokio::time::timeout(Duration::from_secs(2), async {
        while sink.entries().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let ops: Vec<_> = sink.entries().iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![OperationType::GenerateKey, OperationType::ExportPublicKey, OperationType::DeleteKey]
    );
    hsm.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Alerts, health and status
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_operation_succeeds_but_raises_an_alert() {
    let (hsm, token) = scripted(|c| c.performance.encrypt_ms = 10).await;
    let alerts = collect_alerts(&hsm);
    let key = aes_key(&hsm).await;
    token.delay_ms.store(40, Ordering::SeqCst);

    let out = hsm.encrypt(EncryptParams::new(key.id.clone(), b"x".to_vec())).await;
    assert!(out.is_success());
    assert!(!out.within_target);

    let alerts = alerts.lock().unwrap();
    let breach = alerts.iter().find_map(|a| match &a.kind {
        AlertKind::PerformanceTargetExceeded { operation_id, target_ms, .. } if *operation_id == out.operation_id => {
            Some(*target_ms)
        }
        _ => None,
    });
    assert_eq!(breach, Some(10));
    let entry = entries_for(&hsm, &out.operation_id).pop().unwrap();
    assert!(!entry.performance.within_target);
    assert_eq!(entry.result, OperationResult::Success);
}

#[tokio::test]
async fn unauthorized_use_is_reported_as_suspicious() {
    let hsm = simulated().await;
    let mut rx = hsm.subscribe_alerts();
    let key = hsm
        .generate_key(GenerateKeyParams::new("AES-256-GCM").usage([KeyUsage::Decrypt]).by("batch-job"))
        .await
        .into_result()
        .unwrap();

    let out = hsm
        .encrypt(EncryptParams::new(key.id.clone(), b"x".to_vec()).by("intruder"))
        .await;
    assert!(matches!(out.error(), Some(HsmError::Unauthorized(_))));

    let activity = loop {
        let alert = rx.recv().await.unwrap();
        if let AlertKind::SuspiciousActivity(a) = alert.kind {
            break a;
        }
    };
    assert_eq!(activity.kind, SuspicionKind::UnauthorizedAccess);
    assert_eq!(activity.actor, "intruder");
    assert_eq!(activity.key_id.as_ref(), Some(&key.id));
    assert_eq!(activity.operation_id, out.operation_id);
}

#[tokio::test]
async fn vendor_failures_degrade_health() {
    let (hsm, token) = scripted(|c| {
        c.health.window = 10;
        c.health.degraded_failure_rate = 0.2;
        c.health.critical_failure_rate = 0.6;
    })
    .await;
    let signer = hsm
        .generate_key(GenerateKeyParams::new("Ed25519"))
        .await
        .into_result()
        .unwrap();
    assert_eq!(hsm.get_health_status().state, HealthState::Healthy);

    // Caller mistakes say nothing about the HSM.
    for _ in 0..5 {
        hsm.generate_key(GenerateKeyParams::new("ROT13")).await;
    }
    assert_eq!(hsm.get_health_status().state, HealthState::Healthy);

    token.drop_on_sign.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        hsm.sign(SignParams::new(signer.id.clone(), b"m".to_vec())).await;
    }
    let status = hsm.get_health_status();
    assert_eq!(status.state, HealthState::Degraded);
    assert!(!status.reasons.is_empty());
    assert_eq!(status.pool.unwrap().closed, 3);

    hsm.shutdown().await.unwrap();
    assert_eq!(hsm.get_health_status().state, HealthState::Critical);
}

#[tokio::test]
async fn comprehensive_status_aggregates_everything() {
    let hsm = simulated().await;
    let key = aes_key(&hsm).await;
    hsm.encrypt(EncryptParams::new(key.id.clone(), b"x".to_vec())).await;
    hsm.encrypt(EncryptParams::new(KeyId::new("nope"), b"x".to_vec())).await;

    let status = hsm.get_comprehensive_status();
    assert_eq!(status.lifecycle, Lifecycle::Running);
    assert_eq!(status.keys.total, 1);
    assert_eq!(status.keys.by_type["SYMMETRIC"], 1);
    assert_eq!(status.metrics.operations["encrypt"].count, 2);
    assert_eq!(status.metrics.operations["encrypt"].failure, 1);
    assert_eq!(status.audit.total, 3);
    assert_eq!(status.audit_counters.assigned, 3);
    assert_eq!(status.config.vendor, "softhsm");
    assert_eq!(status.config.mode, HsmMode::Simulation);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["lifecycle"], "Running");
}

#[tokio::test]
async fn shutdown_flushes_and_refuses_new_work() {
    let sink = Arc::new(MemorySink::new());
    let hsm = Hsm::builder(quiet(HsmConfig::simulation(3)))
        .audit_sink(sink.clone())
        .build()
        .unwrap();

    let early = hsm.generate_key(GenerateKeyParams::new("AES-256-GCM")).await;
    assert!(matches!(early.error(), Some(HsmError::NotInitialized)));

    hsm.initialize().await.unwrap();
    aes_key(&hsm).await;
    hsm.shutdown().await.unwrap();
    assert_eq!(hsm.lifecycle(), Lifecycle::Stopped);
    assert_eq!(sink.entries().len(), 2);
    assert_eq!(hsm.audit().pending_len(), 0);

    let late = hsm.generate_key(GenerateKeyParams::new("AES-256-GCM")).await;
    assert!(matches!(late.error(), Some(HsmError::ShuttingDown)));
    hsm.shutdown().await.unwrap();
}

#[test]
fn unknown_vendor_fails_before_connecting() {
    let token = Arc::new(ScriptedToken::new());
    let err = Hsm::builder(HsmConfig {
        vendor: "thales-luna".into(),
        ..HsmConfig::default()
    })
    .registry(registry_with(token.clone()))
    .build()
    .unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");
    assert_eq!(token.connects.load(Ordering::SeqCst), 0);
}
