//! The HSM facade.
//!
//! Every public operation runs the same pipeline:
//!
//! ```text
//! validate ─► lease a session (pool or direct) ─► vendor call ─► release
//!          ─► metrics + health sample ─► exactly one audit entry ─► outcome
//! ```
//!
//! Validation failures, pool timeouts and vendor failures all travel the
//! same path, so each call is audited once whatever happens. Vendor calls
//! run on the blocking pool and hold their connection until the call
//! returns, even if the caller stops waiting: there is no mid-flight
//! cancellation.

use crate::alert::{Alert, AlertBus, AlertKind};
use crate::audit::{AuditLogger, AuditRecord, AuditSink, AuditStatistics, PerformanceInfo, SecurityContext, TimeRange};
use crate::config::{HsmConfig, HsmMode};
use crate::error::HsmError;
use crate::health::{HealthMonitor, HealthStatus, Sample};
use crate::metrics::Metrics;
use crate::params::*;
use crate::policy::{self, ProvisioningRequest};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::status::{ComprehensiveStatus, ConfigSummary, KeyInventory, Lifecycle};
use crate::store::{InMemoryStore, MetadataStore};
use crate::types::*;
use crate::vendor::{
    KeySpec, SoftToken, VendorAdapter, VendorCapabilities, VendorEndpoint, VendorError, VendorRegistry,
    VendorSession,
};

use chrono::{DateTime, Utc};
use citadel_hsm_crypto::{Algorithm, AlgorithmCategory};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "adapter panicked".to_string())
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// One long-lived session, no pool. Used in simulation mode.
struct DirectBackend {
    adapter: Arc<dyn VendorAdapter>,
    endpoint: VendorEndpoint,
    session: Mutex<Option<VendorSession>>,
}

impl DirectBackend {
    async fn session(self: &Arc<Self>) -> Result<VendorSession, HsmError> {
        if let Some(s) = lock(&self.session).clone() {
            return Ok(s);
        }
        let this = self.clone();
        let opened = tokio::task::spawn_blocking(move || this.adapter.connect(&this.endpoint))
            .await
            .map_err(|e| VendorError::panicked(e).into_hsm(self.adapter.name()))?
            .map_err(|e| e.into_hsm(self.adapter.name()))?;

        let existing = {
            let mut slot = lock(&self.session);
            match slot.as_ref() {
                Some(s) => Some(s.clone()),
                None => {
                    *slot = Some(opened.clone());
                    None
                }
            }
        };
        match existing {
            // Lost a race with another opener; keep theirs.
            Some(s) => {
                self.adapter.disconnect(&opened);
                Ok(s)
            }
            None => Ok(opened),
        }
    }

    fn invalidate(&self, session: &VendorSession) {
        let dropped = {
            let mut slot = lock(&self.session);
            if slot.as_ref() == Some(session) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(s) = dropped {
            self.adapter.disconnect(&s);
        }
    }

    fn close(&self) {
        let session = lock(&self.session).take();
        if let Some(s) = session {
            self.adapter.disconnect(&s);
        }
    }

    /// Close off the runtime. Returns false if the adapter panicked.
    async fn shutdown(self: Arc<Self>) -> bool {
        match tokio::task::spawn_blocking(move || self.close()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "vendor disconnect panicked");
                false
            }
        }
    }
}

enum Backend {
    Pooled(ConnectionPool),
    Direct(Arc<DirectBackend>),
}

/// A session held for the duration of one vendor call.
enum Lease {
    Pooled(PooledConnection),
    Direct { backend: Arc<DirectBackend>, session: VendorSession },
}

impl Lease {
    fn session(&self) -> &VendorSession {
        match self {
            Self::Pooled(c) => c.session(),
            Self::Direct { session, .. } => session,
        }
    }

    fn connection_id(&self) -> Option<u64> {
        match self {
            Self::Pooled(c) => Some(c.id()),
            Self::Direct { .. } => None,
        }
    }

    fn finish(self, healthy: bool) {
        match self {
            Self::Pooled(mut c) => {
                c.release(healthy);
            }
            Self::Direct { backend, session } => {
                if !healthy {
                    backend.invalidate(&session);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-operation context
// ---------------------------------------------------------------------------

struct OpContext {
    operation: OperationType,
    started: Instant,
    timestamp: DateTime<Utc>,
    actor: String,
    key_id: Option<KeyId>,
    related_key_id: Option<KeyId>,
    algorithm: Option<Algorithm>,
    classification: Option<Classification>,
    connection_id: Option<u64>,
    detail: Option<String>,
    /// Audited result when it differs from what the returned `Result` says.
    audited_as: Option<(OperationResult, String)>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`Hsm`] with non-default collaborators.
pub struct HsmBuilder {
    config: HsmConfig,
    registry: VendorRegistry,
    store: Option<Arc<dyn MetadataStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl HsmBuilder {
    pub fn new(config: HsmConfig) -> Self {
        Self {
            config,
            registry: VendorRegistry::with_builtins(),
            store: None,
            audit_sink: None,
        }
    }

    pub fn registry(mut self, registry: VendorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the sink the audit configuration would build.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Validate everything and build. Nothing connects yet; that is
    /// [`Hsm::initialize`]'s job.
    pub fn build(self) -> Result<Hsm, HsmError> {
        let config = self.config;
        config.validate()?;

        if !self.registry.contains(&config.vendor) {
            return Err(HsmError::Configuration(format!(
                "unknown vendor '{}' (registered: {})",
                config.vendor,
                self.registry.names().join(", ")
            )));
        }

        let endpoint = VendorEndpoint::from_config(&config);
        let (adapter, backend): (Arc<dyn VendorAdapter>, Backend) = match config.mode {
            HsmMode::Production => {
                let adapter = self.registry.create(&config)?;
                let caps = adapter.capabilities();
                if config.security.hardware_rng_only && !caps.hardware_rng {
                    return Err(HsmError::Configuration(format!(
                        "vendor {} has no hardware RNG but hardware_rng_only is set",
                        adapter.name()
                    )));
                }
                if config.security.fips_mode && !caps.fips_validated {
                    return Err(HsmError::Configuration(format!(
                        "vendor {} is not FIPS-validated but fips_mode is set",
                        adapter.name()
                    )));
                }
                let pool = ConnectionPool::new(adapter.clone(), endpoint, config.pool.clone());
                (adapter, Backend::Pooled(pool))
            }
            HsmMode::Simulation => {
                let adapter: Arc<dyn VendorAdapter> = Arc::new(SoftToken::simulated(config.simulation_seed));
                let direct = Arc::new(DirectBackend {
                    adapter: adapter.clone(),
                    endpoint,
                    session: Mutex::new(None),
                });
                (adapter, Backend::Direct(direct))
            }
        };

        let alerts = Arc::new(AlertBus::new());
        let audit = match self.audit_sink {
            Some(sink) => AuditLogger::with_sink(config.audit.clone(), sink, alerts.clone())?,
            None => AuditLogger::new(config.audit.clone(), alerts.clone())?,
        };
        let health = HealthMonitor::new(
            config.health.clone(),
            config.audit.flush_threshold.saturating_mul(10),
            alerts.clone(),
        );
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        tracing::info!(
            vendor = adapter.name(),
            mode = ?config.mode,
            fips_mode = config.security.fips_mode,
            audit_level = ?config.audit.level,
            "HSM configured"
        );

        Ok(Hsm {
            inner: Arc::new(HsmInner {
                vendor: adapter.name().to_string(),
                capabilities: adapter.capabilities(),
                adapter,
                backend,
                store,
                audit,
                alerts,
                metrics: Metrics::new(),
                health,
                lifecycle: Mutex::new(Lifecycle::Created),
                init_lock: tokio::sync::Mutex::new(()),
                meta_lock: Mutex::new(()),
                health_task: Mutex::new(None),
                started: Instant::now(),
                config,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

struct HsmInner {
    config: HsmConfig,
    vendor: String,
    capabilities: VendorCapabilities,
    adapter: Arc<dyn VendorAdapter>,
    backend: Backend,
    store: Arc<dyn MetadataStore>,
    audit: AuditLogger,
    alerts: Arc<AlertBus>,
    metrics: Metrics,
    health: HealthMonitor,
    lifecycle: Mutex<Lifecycle>,
    init_lock: tokio::sync::Mutex<()>,
    /// Serializes read-modify-write of key metadata.
    meta_lock: Mutex<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

/// Vendor-agnostic HSM facade. Cheap to clone.
#[derive(Clone)]
pub struct Hsm {
    inner: Arc<HsmInner>,
}

impl std::fmt::Debug for Hsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hsm").finish_non_exhaustive()
    }
}

impl Hsm {
    /// Build with the built-in vendors and an in-memory metadata store.
    pub fn new(config: HsmConfig) -> Result<Self, HsmError> {
        HsmBuilder::new(config).build()
    }

    pub fn builder(config: HsmConfig) -> HsmBuilder {
        HsmBuilder::new(config)
    }

    pub fn config(&self) -> &HsmConfig {
        &self.inner.config
    }

    pub fn vendor(&self) -> &str {
        &self.inner.vendor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.inner.lifecycle)
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    /// Register a handler invoked synchronously for every alert.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.inner.alerts.on_alert(handler);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.inner.alerts.subscribe()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        match &self.inner.backend {
            Backend::Pooled(pool) => Some(pool.stats()),
            Backend::Direct(_) => None,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the backend, start the audit flusher and the health task.
    /// Idempotent while running.
    pub async fn initialize(&self) -> Result<(), HsmError> {
        let inner = &self.inner;
        let _init = inner.init_lock.lock().await;
        match self.lifecycle() {
            Lifecycle::Running => return Ok(()),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => return Err(HsmError::ShuttingDown),
            Lifecycle::Created => {}
        }

        match &inner.backend {
            Backend::Pooled(pool) => {
                let wanted = inner.config.pool.min_idle;
                let opened = pool.warm_up(wanted).await;
                if opened < wanted {
                    tracing::warn!(wanted, opened, "pool warm-up opened fewer connections than requested");
                }
            }
            Backend::Direct(direct) => {
                direct.session().await?;
            }
        }

        inner.audit.start();
        if inner.config.health.interval_ms > 0 {
            let period = Duration::from_millis(inner.config.health.interval_ms);
            let weak = Arc::downgrade(&self.inner);
            *lock(&inner.health_task) = Some(tokio::spawn(health_loop(weak, period)));
        }

        *lock(&inner.lifecycle) = Lifecycle::Running;
        tracing::info!(vendor = %inner.vendor, mode = ?inner.config.mode, "HSM initialized");
        Ok(())
    }

    /// Stop accepting work, drain the pool, flush the audit log.
    pub async fn shutdown(&self) -> Result<(), HsmError> {
        let inner = &self.inner;
        {
            let mut lifecycle = lock(&inner.lifecycle);
            match *lifecycle {
                Lifecycle::Stopped | Lifecycle::ShuttingDown => return Ok(()),
                Lifecycle::Created | Lifecycle::Running => *lifecycle = Lifecycle::ShuttingDown,
            }
        }
        tracing::info!("HSM shutting down");

        if let Some(task) = lock(&inner.health_task).take() {
            task.abort();
        }
        match &inner.backend {
            Backend::Pooled(pool) => {
                pool.shutdown().await;
            }
            Backend::Direct(direct) => {
                direct.clone().shutdown().await;
            }
        }
        let flushed = inner.audit.shutdown().await;

        *lock(&inner.lifecycle) = Lifecycle::Stopped;
        tracing::info!("HSM stopped");
        flushed
    }

    fn ensure_running(&self) -> Result<(), HsmError> {
        match self.lifecycle() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(HsmError::NotInitialized),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => Err(HsmError::ShuttingDown),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    fn begin(&self, operation: OperationType, actor: Option<&str>, key_id: Option<KeyId>) -> OpContext {
        OpContext {
            operation,
            started: Instant::now(),
            timestamp: Utc::now(),
            actor: actor.unwrap_or(DEFAULT_ACTOR).to_string(),
            key_id,
            related_key_id: None,
            algorithm: None,
            classification: None,
            connection_id: None,
            detail: None,
            audited_as: None,
        }
    }

    async fn lease(&self) -> Result<Lease, HsmError> {
        match &self.inner.backend {
            Backend::Pooled(pool) => {
                let conn = pool.acquire(self.inner.config.pool.acquire_timeout()).await?;
                Ok(Lease::Pooled(conn))
            }
            Backend::Direct(direct) => Ok(Lease::Direct {
                session: direct.session().await?,
                backend: direct.clone(),
            }),
        }
    }

    /// Run one vendor call on a leased session.
    ///
    /// The lease moves into the blocking task and is released there, after
    /// the call returns or panics. A lost connection or a panic releases it
    /// as unhealthy.
    async fn call_vendor<T, F>(&self, ctx: &mut OpContext, call: F) -> Result<T, HsmError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VendorAdapter, &VendorSession) -> Result<T, VendorError> + Send + 'static,
    {
        let lease = self.lease().await?;
        ctx.connection_id = lease.connection_id();

        let adapter = self.inner.adapter.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = match catch_unwind(AssertUnwindSafe(|| call(adapter.as_ref(), lease.session()))) {
                Ok(result) => result,
                Err(payload) => Err(VendorError::panicked(panic_message(payload.as_ref()))),
            };
            let healthy = !matches!(&result, Err(e) if e.connection_lost);
            lease.finish(healthy);
            result
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(VendorError::panicked(e)),
        };
        result.map_err(|e| {
            if e.code == "ADAPTER_PANIC" {
                tracing::error!(vendor = %self.inner.vendor, error = %e, "vendor adapter panicked");
            }
            e.into_hsm(&self.inner.vendor)
        })
    }

    /// Close out an operation: metrics, health, audit, alerts, access log.
    fn finish<T>(&self, ctx: OpContext, result: Result<T, HsmError>) -> OperationOutcome<T> {
        let inner = &self.inner;
        let duration = ctx.started.elapsed();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let target_ms = inner.config.performance.target_ms(ctx.operation);
        let within_target = duration_ms <= target_ms;

        let (audited, error_code) = match (&ctx.audited_as, &result) {
            (Some((r, code)), _) => (*r, Some(code.clone())),
            (None, Ok(_)) => (OperationResult::Success, None),
            (None, Err(e)) => (OperationResult::from_error(e), Some(e.code().to_string())),
        };
        let detail = match (&result, ctx.detail.clone()) {
            (Err(e), Some(d)) => Some(format!("{}; {}", d, e)),
            (Err(e), None) => Some(e.to_string()),
            (Ok(_), d) => d,
        };

        inner.metrics.record(ctx.operation, audited.is_success(), duration_ms, within_target);
        inner
            .health
            .record(Sample::new(ctx.operation, result.as_ref().err(), duration_ms, within_target));

        let operation_id = inner
            .audit
            .log_operation(AuditRecord {
                timestamp: ctx.timestamp,
                operation: ctx.operation,
                key_id: ctx.key_id.clone(),
                related_key_id: ctx.related_key_id.clone(),
                algorithm: ctx.algorithm,
                result: audited,
                error_code,
                performance: PerformanceInfo { duration_ms, target_ms, within_target },
                security: SecurityContext {
                    actor: ctx.actor.clone(),
                    mode: inner.config.mode,
                    vendor: inner.vendor.clone(),
                    classification: ctx.classification,
                    connection_id: ctx.connection_id,
                    fips_mode: inner.config.security.fips_mode,
                },
                detail,
            })
            .to_string();

        if !within_target {
            tracing::warn!(
                operation = %ctx.operation,
                operation_id = %operation_id,
                duration_ms,
                target_ms,
                "performance target exceeded"
            );
            inner.alerts.emit(AlertKind::PerformanceTargetExceeded {
                operation: ctx.operation,
                operation_id: operation_id.clone(),
                key_id: ctx.key_id.clone(),
                duration_ms,
                target_ms,
            });
        }

        match &result {
            Ok(_) => tracing::debug!(operation = %ctx.operation, operation_id = %operation_id, duration_ms, "operation succeeded"),
            Err(e) if e.is_caller_error() => {
                tracing::debug!(operation = %ctx.operation, operation_id = %operation_id, code = e.code(), error = %e, "operation rejected")
            }
            Err(e) => {
                tracing::warn!(operation = %ctx.operation, operation_id = %operation_id, code = e.code(), error = %e, "operation failed")
            }
        }

        let access = AccessRecord {
            at: Utc::now(),
            operation: ctx.operation,
            operation_id: operation_id.clone(),
            result: audited,
            actor: ctx.actor,
        };
        for key in ctx.key_id.iter().chain(ctx.related_key_id.iter()) {
            self.append_access(key, access.clone());
        }

        OperationOutcome {
            operation_id,
            operation: ctx.operation,
            result,
            duration,
            within_target,
        }
    }

    /// Append to a key's access log. Appends happen in completion order.
    fn append_access(&self, key: &KeyId, record: AccessRecord) {
        let _guard = lock(&self.inner.meta_lock);
        match self.inner.store.get(key) {
            Ok(Some(mut meta)) => {
                meta.access_log.push(record);
                if let Err(e) = self.inner.store.put(&meta) {
                    tracing::warn!(key_id = %key, error = %e, "access log append failed");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key_id = %key, error = %e, "access log append failed"),
        }
    }

    fn load_key(&self, ctx: &mut OpContext, key_id: &KeyId) -> Result<KeyMetadata, HsmError> {
        let meta = self
            .inner
            .store
            .get(key_id)?
            .ok_or_else(|| HsmError::KeyNotFound(key_id.clone()))?;
        ctx.algorithm = Some(meta.algorithm);
        ctx.classification = Some(meta.classification);
        Ok(meta)
    }

    /// Load a key and check it may be used for `usage` right now.
    fn authorized_key(
        &self,
        ctx: &mut OpContext,
        key_id: &KeyId,
        usage: KeyUsage,
        category: AlgorithmCategory,
    ) -> Result<KeyMetadata, HsmError> {
        let meta = self.load_key(ctx, key_id)?;
        meta.authorize(usage, Utc::now())?;
        if meta.algorithm.category() != category {
            return Err(HsmError::InvalidParameters(format!(
                "{} is a {} algorithm, {} needs {}",
                meta.algorithm,
                meta.algorithm.category(),
                usage,
                category
            )));
        }
        if !self.inner.config.algorithms.allows(meta.algorithm) {
            return Err(HsmError::UnsupportedAlgorithm(format!(
                "{} is no longer allow-listed",
                meta.algorithm
            )));
        }
        Ok(meta)
    }

    fn resolve_hash(&self, hash: Option<&str>) -> Result<Option<Algorithm>, HsmError> {
        let Some(name) = hash else { return Ok(None) };
        let alg = self.inner.config.algorithms.resolve(name)?;
        if alg.category() != AlgorithmCategory::Hash {
            return Err(HsmError::InvalidParameters(format!("{} is not a hash", alg)));
        }
        Ok(Some(alg))
    }

    /// Best-effort removal of a vendor key the metadata store never saw.
    async fn discard_vendor_key(&self, ctx: &mut OpContext, handle: String) {
        if let Err(e) = self.call_vendor(ctx, move |a, s| a.destroy_key(s, &handle)).await {
            tracing::error!(error = %e, "orphaned vendor key could not be destroyed");
        }
    }

    // -----------------------------------------------------------------------
    // Key generation
    // -----------------------------------------------------------------------

    pub async fn generate_key(&self, params: GenerateKeyParams) -> OperationOutcome<KeyMetadata> {
        let mut ctx = self.begin(OperationType::GenerateKey, params.actor.as_deref(), None);
        let result = self.generate_key_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn generate_key_inner(&self, ctx: &mut OpContext, p: GenerateKeyParams) -> Result<KeyMetadata, HsmError> {
        self.ensure_running()?;
        ctx.classification = Some(p.classification);
        if p.algorithm.trim().is_empty() {
            return Err(HsmError::InvalidParameters("algorithm is required".into()));
        }
        let algorithm = self.inner.config.algorithms.resolve(&p.algorithm)?;
        ctx.algorithm = Some(algorithm);

        let key_type = KeyType::for_algorithm(algorithm)
            .ok_or_else(|| HsmError::InvalidParameters(format!("{} does not produce keys", algorithm)))?;
        if let Some(requested) = p.key_type {
            if requested != key_type {
                return Err(HsmError::InvalidParameters(format!(
                    "{} keys are {}, not {}",
                    algorithm, key_type, requested
                )));
            }
        }
        if key_type == KeyType::PostQuantum && !self.inner.capabilities.post_quantum {
            return Err(HsmError::UnsupportedAlgorithm(format!(
                "vendor {} has no post-quantum support",
                self.inner.vendor
            )));
        }

        let usage = if p.usage.is_empty() {
            key_type.default_usage()
        } else {
            let permitted = key_type.permitted_usage();
            if let Some(bad) = p.usage.iter().find(|u| !permitted.contains(u)) {
                return Err(HsmError::InvalidParameters(format!("{} keys cannot {}", key_type, bad)));
            }
            p.usage.clone()
        };
        if p.validity_days == Some(0) {
            return Err(HsmError::InvalidParameters("validity must be at least one day".into()));
        }

        let now = Utc::now();
        let provisioning = policy::provision(
            &ProvisioningRequest {
                classification: p.classification,
                exportable: p.exportable,
                escrow: p.escrow,
                validity: p.validity_days.map(|d| chrono::Duration::days(i64::from(d))),
            },
            &self.inner.config.security,
            now,
        );
        if !provisioning.notes.is_empty() {
            ctx.detail = Some(provisioning.notes.join("; "));
        }

        let spec = KeySpec {
            algorithm,
            exportable: provisioning.exportable,
            label: p.label.clone(),
        };
        let generated = self.call_vendor(ctx, move |a, s| a.generate_key(s, &spec)).await?;

        let meta = KeyMetadata {
            id: KeyId::generate(),
            label: p.label,
            key_type,
            algorithm,
            classification: p.classification,
            usage,
            state: KeyState::Active,
            hardware_generated: generated.hardware_generated,
            exportable: provisioning.exportable,
            escrow_status: provisioning.escrow_status,
            created_at: now,
            expires_at: Some(provisioning.expires_at),
            superseded_at: None,
            destroyed_at: None,
            supersedes: None,
            superseded_by: None,
            version: 1,
            vendor_handle: generated.handle,
            access_log: Vec::new(),
        };
        if let Err(e) = self.inner.store.put(&meta) {
            self.discard_vendor_key(ctx, meta.vendor_handle.clone()).await;
            return Err(e);
        }
        ctx.key_id = Some(meta.id.clone());
        Ok(meta)
    }

    /// Generate keys one after another. Stops at the first failure and
    /// returns what was generated, the failure, and the untouched rest.
    /// Each key gets its own audit entry plus one summary entry.
    pub async fn generate_bulk_keys(&self, requests: Vec<GenerateKeyParams>) -> OperationOutcome<BulkGenerationReport> {
        let actor = requests.first().and_then(|r| r.actor.clone());
        let mut ctx = self.begin(OperationType::GenerateBulkKeys, actor.as_deref(), None);
        let result = self.generate_bulk_inner(&mut ctx, requests).await;
        self.finish(ctx, result)
    }

    async fn generate_bulk_inner(
        &self,
        ctx: &mut OpContext,
        requests: Vec<GenerateKeyParams>,
    ) -> Result<BulkGenerationReport, HsmError> {
        self.ensure_running()?;
        if requests.is_empty() {
            return Err(HsmError::InvalidParameters("no key requests".into()));
        }
        let total = requests.len();
        let mut report = BulkGenerationReport::default();
        let mut pending = requests.into_iter().enumerate();

        for (index, request) in pending.by_ref() {
            let outcome = self.generate_key(request.clone()).await;
            let operation_id = outcome.operation_id;
            match outcome.result {
                Ok(meta) => report.generated.push(meta),
                Err(error) => {
                    report.failure = Some(BulkFailure { index, request, error, operation_id });
                    break;
                }
            }
        }
        report.remaining = pending.map(|(_, r)| r).collect();

        ctx.detail = Some(format!("generated {} of {}", report.generated.len(), total));
        if let Some(failure) = &report.failure {
            ctx.audited_as = Some((OperationResult::from_error(&failure.error), failure.error.code().to_string()));
            tracing::warn!(
                generated = report.generated.len(),
                failed_index = failure.index,
                remaining = report.remaining.len(),
                "bulk key generation stopped early"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Symmetric
    // -----------------------------------------------------------------------

    pub async fn encrypt(&self, params: EncryptParams) -> OperationOutcome<EncryptedData> {
        let mut ctx = self.begin(OperationType::Encrypt, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.encrypt_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn encrypt_inner(&self, ctx: &mut OpContext, p: EncryptParams) -> Result<EncryptedData, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Encrypt, AlgorithmCategory::Symmetric)?;
        if p.plaintext.is_empty() {
            return Err(HsmError::InvalidParameters("plaintext is required".into()));
        }
        let handle = meta.vendor_handle.clone();
        let aad = p.aad.clone();
        let plaintext = p.plaintext;
        let ciphertext = self
            .call_vendor(ctx, move |a, s| a.encrypt(s, &handle, &plaintext, &aad))
            .await?;
        Ok(EncryptedData {
            key_id: meta.id,
            key_version: meta.version,
            algorithm: meta.algorithm,
            ciphertext,
            aad: p.aad,
        })
    }

    pub async fn decrypt(&self, params: DecryptParams) -> OperationOutcome<Vec<u8>> {
        let mut ctx = self.begin(OperationType::Decrypt, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.decrypt_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn decrypt_inner(&self, ctx: &mut OpContext, p: DecryptParams) -> Result<Vec<u8>, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Decrypt, AlgorithmCategory::Symmetric)?;
        if p.ciphertext.is_empty() {
            return Err(HsmError::InvalidParameters("ciphertext is required".into()));
        }
        let handle = meta.vendor_handle;
        self.call_vendor(ctx, move |a, s| a.decrypt(s, &handle, &p.ciphertext, &p.aad))
            .await
    }

    // -----------------------------------------------------------------------
    // Signatures
    // -----------------------------------------------------------------------

    pub async fn sign(&self, params: SignParams) -> OperationOutcome<Signature> {
        let mut ctx = self.begin(OperationType::Sign, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.sign_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn sign_inner(&self, ctx: &mut OpContext, p: SignParams) -> Result<Signature, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Sign, AlgorithmCategory::Asymmetric)?;
        let hash = self.resolve_hash(p.hash.as_deref())?;
        if p.message.is_empty() {
            return Err(HsmError::InvalidParameters("message is required".into()));
        }
        let handle = meta.vendor_handle.clone();
        let message = p.message;
        let bytes = self
            .call_vendor(ctx, move |a, s| a.sign(s, &handle, &message, hash))
            .await?;
        Ok(Signature {
            key_id: meta.id,
            algorithm: meta.algorithm,
            hash,
            bytes,
        })
    }

    /// `Ok(false)` is a completed verification of a bad signature.
    pub async fn verify(&self, params: VerifyParams) -> OperationOutcome<bool> {
        let mut ctx = self.begin(OperationType::Verify, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.verify_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn verify_inner(&self, ctx: &mut OpContext, p: VerifyParams) -> Result<bool, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Verify, AlgorithmCategory::Asymmetric)?;
        let hash = self.resolve_hash(p.hash.as_deref())?;
        if p.message.is_empty() || p.signature.is_empty() {
            return Err(HsmError::InvalidParameters("message and signature are required".into()));
        }
        let handle = meta.vendor_handle;
        let valid = self
            .call_vendor(ctx, move |a, s| a.verify(s, &handle, &p.message, &p.signature, hash))
            .await?;
        if !valid {
            ctx.detail = Some("signature did not verify".into());
        }
        Ok(valid)
    }

    // -----------------------------------------------------------------------
    // Key encapsulation
    // -----------------------------------------------------------------------

    pub async fn encapsulate(&self, params: EncapsulateParams) -> OperationOutcome<EncapsulatedKey> {
        let mut ctx = self.begin(OperationType::Encapsulate, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.encapsulate_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn encapsulate_inner(&self, ctx: &mut OpContext, p: EncapsulateParams) -> Result<EncapsulatedKey, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Encapsulate, AlgorithmCategory::PostQuantum)?;
        let handle = meta.vendor_handle.clone();
        let (ciphertext, shared_secret) = self.call_vendor(ctx, move |a, s| a.encapsulate(s, &handle)).await?;
        Ok(EncapsulatedKey {
            key_id: meta.id,
            algorithm: meta.algorithm,
            ciphertext,
            shared_secret,
        })
    }

    pub async fn decapsulate(&self, params: DecapsulateParams) -> OperationOutcome<citadel_hsm_crypto::SecretBytes> {
        let mut ctx = self.begin(OperationType::Decapsulate, params.actor.as_deref(), Some(params.key_id.clone()));
        let result = self.decapsulate_inner(&mut ctx, params).await;
        self.finish(ctx, result)
    }

    async fn decapsulate_inner(
        &self,
        ctx: &mut OpContext,
        p: DecapsulateParams,
    ) -> Result<citadel_hsm_crypto::SecretBytes, HsmError> {
        self.ensure_running()?;
        let meta = self.authorized_key(ctx, &p.key_id, KeyUsage::Decapsulate, AlgorithmCategory::PostQuantum)?;
        if p.ciphertext.is_empty() {
            return Err(HsmError::InvalidParameters("ciphertext is required".into()));
        }
        let handle = meta.vendor_handle;
        self.call_vendor(ctx, move |a, s| a.decapsulate(s, &handle, &p.ciphertext))
            .await
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Replace an active key with a fresh one of the same shape. The old key
    /// is superseded, not deleted, and keeps its read-side usages.
    pub async fn rotate_key(&self, key_id: &KeyId) -> OperationOutcome<RotationResult> {
        let mut ctx = self.begin(OperationType::RotateKey, None, Some(key_id.clone()));
        let result = self.rotate_key_inner(&mut ctx, key_id).await;
        self.finish(ctx, result)
    }

    async fn rotate_key_inner(&self, ctx: &mut OpContext, key_id: &KeyId) -> Result<RotationResult, HsmError> {
        self.ensure_running()?;
        let old = self.load_key(ctx, key_id)?;
        if old.state != KeyState::Active {
            return Err(HsmError::Unauthorized(format!("key {} is {} and cannot be rotated", old.id, old.state)));
        }

        let spec = KeySpec {
            algorithm: old.algorithm,
            exportable: old.exportable,
            label: old.label.clone(),
        };
        let generated = self.call_vendor(ctx, move |a, s| a.generate_key(s, &spec)).await?;

        let now = Utc::now();
        let validity = old
            .expires_at
            .map(|exp| exp - old.created_at)
            .unwrap_or_else(|| old.classification.default_validity());
        let new_meta = KeyMetadata {
            id: KeyId::generate(),
            label: old.label.clone(),
            key_type: old.key_type,
            algorithm: old.algorithm,
            classification: old.classification,
            usage: old.usage.clone(),
            state: KeyState::Active,
            hardware_generated: generated.hardware_generated,
            exportable: old.exportable,
            escrow_status: old.escrow_status,
            created_at: now,
            expires_at: Some(now + validity),
            superseded_at: None,
            destroyed_at: None,
            supersedes: Some(old.id.clone()),
            superseded_by: None,
            version: old.version + 1,
            vendor_handle: generated.handle,
            access_log: Vec::new(),
        };

        let committed = {
            let _guard = lock(&self.inner.meta_lock);
            self.commit_rotation(key_id, &new_meta, now)
        };
        if let Err(e) = committed {
            self.discard_vendor_key(ctx, new_meta.vendor_handle.clone()).await;
            return Err(e);
        }

        ctx.related_key_id = Some(new_meta.id.clone());
        tracing::info!(old_key = %key_id, new_key = %new_meta.id, version = new_meta.version, "key rotated");
        Ok(RotationResult {
            old_key_id: key_id.clone(),
            new_key: new_meta,
        })
    }

    /// Caller holds `meta_lock`.
    fn commit_rotation(&self, key_id: &KeyId, new_meta: &KeyMetadata, now: DateTime<Utc>) -> Result<(), HsmError> {
        let mut current = self
            .inner
            .store
            .get(key_id)?
            .ok_or_else(|| HsmError::KeyNotFound(key_id.clone()))?;
        if !current.state.can_transition_to(KeyState::Superseded) {
            return Err(HsmError::Unauthorized(format!(
                "key {} became {} during rotation",
                key_id, current.state
            )));
        }
        current.state = KeyState::Superseded;
        current.superseded_at = Some(now);
        current.superseded_by = Some(new_meta.id.clone());
        self.inner.store.put(new_meta)?;
        self.inner.store.put(&current)
    }

    /// Destroy key material in the HSM. Metadata stays, marked `Destroyed`.
    pub async fn delete_key(&self, key_id: &KeyId) -> OperationOutcome<()> {
        let mut ctx = self.begin(OperationType::DeleteKey, None, Some(key_id.clone()));
        let result = self.delete_key_inner(&mut ctx, key_id).await;
        self.finish(ctx, result)
    }

    async fn delete_key_inner(&self, ctx: &mut OpContext, key_id: &KeyId) -> Result<(), HsmError> {
        self.ensure_running()?;
        let meta = self.load_key(ctx, key_id)?;
        if !meta.state.can_transition_to(KeyState::Destroyed) {
            return Err(HsmError::Unauthorized(format!("key {} is already destroyed", key_id)));
        }
        let handle = meta.vendor_handle;
        self.call_vendor(ctx, move |a, s| a.destroy_key(s, &handle)).await?;

        let _guard = lock(&self.inner.meta_lock);
        let mut current = self
            .inner
            .store
            .get(key_id)?
            .ok_or_else(|| HsmError::KeyNotFound(key_id.clone()))?;
        current.state = KeyState::Destroyed;
        current.destroyed_at = Some(Utc::now());
        self.inner.store.put(&current)?;
        tracing::info!(key_id = %key_id, "key destroyed");
        Ok(())
    }

    /// Export the public half of an asymmetric or KEM key.
    pub async fn get_public_key(&self, key_id: &KeyId) -> OperationOutcome<PublicKeyExport> {
        let mut ctx = self.begin(OperationType::ExportPublicKey, None, Some(key_id.clone()));
        let result = self.public_key_inner(&mut ctx, key_id).await;
        self.finish(ctx, result)
    }

    async fn public_key_inner(&self, ctx: &mut OpContext, key_id: &KeyId) -> Result<PublicKeyExport, HsmError> {
        self.ensure_running()?;
        let meta = self.load_key(ctx, key_id)?;
        if meta.key_type == KeyType::Symmetric {
            return Err(HsmError::InvalidParameters(format!("key {} is symmetric and has no public key", key_id)));
        }
        if meta.state == KeyState::Destroyed {
            return Err(HsmError::Unauthorized(format!("key {} is destroyed", key_id)));
        }
        let handle = meta.vendor_handle;
        let public_key = self.call_vendor(ctx, move |a, s| a.public_key(s, &handle)).await?;
        Ok(PublicKeyExport {
            key_id: meta.id,
            algorithm: meta.algorithm,
            public_key,
        })
    }

    // -----------------------------------------------------------------------
    // Read-only queries (not audited)
    // -----------------------------------------------------------------------

    pub fn get_key_metadata(&self, key_id: &KeyId) -> Result<KeyMetadata, HsmError> {
        self.inner
            .store
            .get(key_id)?
            .ok_or_else(|| HsmError::KeyNotFound(key_id.clone()))
    }

    pub fn list_keys(&self) -> Result<Vec<KeyMetadata>, HsmError> {
        self.inner.store.list()
    }

    pub fn generate_statistics(&self, range: &TimeRange) -> AuditStatistics {
        self.inner.audit.statistics(range)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn get_health_status(&self) -> HealthStatus {
        let pool = self.pool_stats();
        self.inner.health.evaluate(pool, self.inner.audit.pending_len())
    }

    pub fn get_comprehensive_status(&self) -> ComprehensiveStatus {
        let inner = &self.inner;
        let now = Utc::now();
        let keys = match inner.store.list() {
            Ok(keys) => KeyInventory::from_keys(&keys, now),
            Err(e) => {
                tracing::warn!(error = %e, "key inventory unavailable");
                KeyInventory::default()
            }
        };
        ComprehensiveStatus {
            lifecycle: self.lifecycle(),
            health: self.get_health_status(),
            metrics: inner.metrics.snapshot(),
            audit: inner.audit.statistics(&TimeRange::last(chrono::Duration::hours(1))),
            audit_counters: inner.audit.counters(),
            keys,
            config: ConfigSummary {
                vendor: inner.vendor.clone(),
                endpoint: inner.config.endpoint.clone(),
                mode: inner.config.mode,
                fips_mode: inner.config.security.fips_mode,
                audit_level: inner.config.audit.level,
                pool_capacity: inner.config.pool.capacity,
                capabilities: inner.capabilities,
            },
            alerts_emitted: inner.alerts.emitted(),
            uptime_secs: inner.started.elapsed().as_secs(),
            generated_at: now,
        }
    }
}

async fn health_loop(hsm: Weak<HsmInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = hsm.upgrade() else { break };
        let status = Hsm { inner }.get_health_status();
        tracing::debug!(state = %status.state, samples = status.samples, "health recomputed");
    }
}
