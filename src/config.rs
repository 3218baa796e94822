//! HSM configuration: vendor, algorithm allow-lists, pool sizing,
//! performance targets, security policy and audit settings.
//!
//! Assembled once (JSON, environment overlay, or code), validated by
//! [`HsmConfig::validate`], then frozen inside the facade.
//!
//! Environment overrides (all optional):
//!   CITADEL_HSM_VENDOR              - vendor adapter name
//!   CITADEL_HSM_ENDPOINT            - vendor endpoint / slot
//!   CITADEL_HSM_MODE                - "production" or "simulation"
//!   CITADEL_HSM_POOL_CAPACITY       - max live connections
//!   CITADEL_HSM_ACQUIRE_TIMEOUT_MS  - pool acquire timeout
//!   CITADEL_HSM_AUDIT_LEVEL         - "minimal", "standard", "comprehensive"
//!   CITADEL_HSM_AUDIT_DIR           - audit log directory
//!   CITADEL_HSM_FIPS_MODE           - "true" / "false"

use crate::error::HsmError;
use crate::types::{EscrowPolicy, OperationType};
use citadel_hsm_crypto::{Algorithm, AlgorithmCategory};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HsmMode {
    /// Real vendor adapter behind the connection pool.
    Production,
    /// Deterministic in-process stand-in, no pool.
    Simulation,
}

impl std::str::FromStr for HsmMode {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" => Ok(Self::Production),
            "simulation" => Ok(Self::Simulation),
            other => Err(HsmError::Configuration(format!("unknown mode: {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Pin,
    Certificate,
    None,
}

/// Which audit entries survive the level filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Non-success results only.
    Minimal,
    /// Key-lifecycle operations plus non-success results.
    Standard,
    /// Everything.
    Comprehensive,
}

impl std::str::FromStr for AuditLevel {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "comprehensive" => Ok(Self::Comprehensive),
            other => Err(HsmError::Configuration(format!("unknown audit level: {}", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub method: AuthMethod,
    /// Name of the environment variable holding the PIN or credential.
    pub credential_env_var: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { method: AuthMethod::Pin, credential_env_var: None }
    }
}

/// Canonical algorithm names allowed per category.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmPolicy {
    pub symmetric: Vec<String>,
    pub asymmetric: Vec<String>,
    pub post_quantum: Vec<String>,
    pub hash: Vec<String>,
    pub kdf: Vec<String>,
}

impl Default for AlgorithmPolicy {
    fn default() -> Self {
        let names = |cat: AlgorithmCategory| -> Vec<String> {
            Algorithm::ALL
                .iter()
                .filter(|a| a.category() == cat)
                .map(|a| a.name().to_string())
                .collect()
        };
        Self {
            symmetric: names(AlgorithmCategory::Symmetric),
            asymmetric: names(AlgorithmCategory::Asymmetric),
            post_quantum: names(AlgorithmCategory::PostQuantum),
            hash: names(AlgorithmCategory::Hash),
            kdf: names(AlgorithmCategory::Kdf),
        }
    }
}

impl AlgorithmPolicy {
    /// Only FIPS-approved algorithms.
    pub fn fips() -> Self {
        let mut p = Self::default();
        let keep = |v: &mut Vec<String>| {
            v.retain(|n| Algorithm::from_name(n).map(|a| a.is_fips_approved()).unwrap_or(false))
        };
        keep(&mut p.symmetric);
        keep(&mut p.asymmetric);
        keep(&mut p.post_quantum);
        keep(&mut p.hash);
        keep(&mut p.kdf);
        p
    }

    pub fn list(&self, category: AlgorithmCategory) -> &[String] {
        match category {
            AlgorithmCategory::Symmetric => &self.symmetric,
            AlgorithmCategory::Asymmetric => &self.asymmetric,
            AlgorithmCategory::PostQuantum => &self.post_quantum,
            AlgorithmCategory::Hash => &self.hash,
            AlgorithmCategory::Kdf => &self.kdf,
        }
    }

    /// Resolve `name` and check it is allow-listed in its own category.
    pub fn resolve(&self, name: &str) -> Result<Algorithm, HsmError> {
        let alg = Algorithm::from_name(name)
            .map_err(|_| HsmError::UnsupportedAlgorithm(name.to_string()))?;
        if self.allows(alg) {
            Ok(alg)
        } else {
            Err(HsmError::UnsupportedAlgorithm(format!("{} is not allow-listed", alg)))
        }
    }

    pub fn allows(&self, alg: Algorithm) -> bool {
        self.list(alg.category())
            .iter()
            .any(|n| n.eq_ignore_ascii_case(alg.name()))
    }

    fn all_entries(&self) -> impl Iterator<Item = (AlgorithmCategory, &String)> {
        [
            AlgorithmCategory::Symmetric,
            AlgorithmCategory::Asymmetric,
            AlgorithmCategory::PostQuantum,
            AlgorithmCategory::Hash,
            AlgorithmCategory::Kdf,
        ]
        .into_iter()
        .flat_map(move |cat| self.list(cat).iter().map(move |n| (cat, n)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard ceiling on busy + idle connections.
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
    /// Connections opened eagerly at `initialize()`.
    pub min_idle: usize,
    /// How long shutdown waits for busy connections to come back.
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            acquire_timeout_ms: 5_000,
            min_idle: 0,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Soft per-operation latency targets in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceTargets {
    pub generate_key_ms: u64,
    pub encrypt_ms: u64,
    pub decrypt_ms: u64,
    pub sign_ms: u64,
    pub verify_ms: u64,
    pub encapsulate_ms: u64,
    pub decapsulate_ms: u64,
    pub rotate_key_ms: u64,
    pub bulk_generate_ms: u64,
    pub delete_key_ms: u64,
    pub export_public_key_ms: u64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            generate_key_ms: 100,
            encrypt_ms: 10,
            decrypt_ms: 10,
            sign_ms: 20,
            verify_ms: 10,
            encapsulate_ms: 20,
            decapsulate_ms: 20,
            rotate_key_ms: 200,
            bulk_generate_ms: 5_000,
            delete_key_ms: 50,
            export_public_key_ms: 20,
        }
    }
}

impl PerformanceTargets {
    pub fn target_ms(&self, op: OperationType) -> u64 {
        match op {
            OperationType::GenerateKey => self.generate_key_ms,
            OperationType::Encrypt => self.encrypt_ms,
            OperationType::Decrypt => self.decrypt_ms,
            OperationType::Sign => self.sign_ms,
            OperationType::Verify => self.verify_ms,
            OperationType::Encapsulate => self.encapsulate_ms,
            OperationType::Decapsulate => self.decapsulate_ms,
            OperationType::RotateKey => self.rotate_key_ms,
            OperationType::GenerateBulkKeys => self.bulk_generate_ms,
            OperationType::DeleteKey => self.delete_key_ms,
            OperationType::ExportPublicKey => self.export_public_key_ms,
        }
    }

    pub fn target_for(&self, op: OperationType) -> Duration {
        Duration::from_millis(self.target_ms(op))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Refuse vendors without a hardware RNG (production mode).
    pub hardware_rng_only: bool,
    pub escrow_policy: EscrowPolicy,
    /// Restrict to FIPS-approved algorithms and FIPS-validated vendors.
    pub fips_mode: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            hardware_rng_only: false,
            escrow_policy: EscrowPolicy::None,
            fips_mode: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub level: AuditLevel,
    /// `None` keeps flushed entries in memory only.
    pub log_dir: Option<PathBuf>,
    /// Size ceiling per log file before rotation.
    pub max_file_bytes: u64,
    pub flush_interval_ms: u64,
    /// Buffer length that triggers an immediate flush.
    pub flush_threshold: usize,
    /// Encrypt each flushed batch with AES-256-GCM.
    pub encrypt: bool,
    /// Environment variable holding the hex-encoded 32-byte batch key.
    pub key_env_var: String,
    /// Flushed entries retained in memory for statistics and queries.
    pub history_capacity: usize,
    /// Non-success results per key within `window_secs` that count as suspicious.
    pub failure_threshold: usize,
    pub window_secs: u64,
    /// Also mirror every flushed entry to `tracing`.
    pub mirror_to_tracing: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            level: AuditLevel::Comprehensive,
            log_dir: None,
            max_file_bytes: 10 * 1024 * 1024,
            flush_interval_ms: 5_000,
            flush_threshold: 100,
            encrypt: false,
            key_env_var: "CITADEL_HSM_AUDIT_KEY".into(),
            history_capacity: 10_000,
            failure_threshold: 5,
            window_secs: 60,
            mirror_to_tracing: false,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Read and decode the batch-encryption key from the environment.
    pub fn load_key(&self) -> Result<Option<[u8; 32]>, HsmError> {
        if !self.encrypt {
            return Ok(None);
        }
        let hex_key = std::env::var(&self.key_env_var).map_err(|_| {
            HsmError::Configuration(format!("audit encryption enabled but {} is not set", self.key_env_var))
        })?;
        decode_key(&hex_key).map(Some)
    }
}

/// Decode a hex-encoded 32-byte key.
pub fn decode_key(hex_key: &str) -> Result<[u8; 32], HsmError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| HsmError::Configuration("audit key is not valid hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| HsmError::Configuration("audit key must be 32 bytes".into()))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Background recomputation period. 0 disables the background task.
    pub interval_ms: u64,
    /// Recent samples considered.
    pub window: usize,
    pub degraded_failure_rate: f64,
    pub critical_failure_rate: f64,
    pub degraded_breach_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            window: 500,
            degraded_failure_rate: 0.05,
            critical_failure_rate: 0.25,
            degraded_breach_rate: 0.20,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Registered vendor adapter name.
    pub vendor: String,
    pub endpoint: String,
    pub auth: AuthConfig,
    pub mode: HsmMode,
    /// Seed of the simulation provider.
    pub simulation_seed: u64,
    pub algorithms: AlgorithmPolicy,
    pub pool: PoolConfig,
    pub performance: PerformanceTargets,
    pub security: SecurityPolicy,
    pub audit: AuditConfig,
    pub health: HealthConfig,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            vendor: "softhsm".into(),
            endpoint: "slot:0".into(),
            auth: AuthConfig::default(),
            mode: HsmMode::Production,
            simulation_seed: 0,
            algorithms: AlgorithmPolicy::default(),
            pool: PoolConfig::default(),
            performance: PerformanceTargets::default(),
            security: SecurityPolicy::default(),
            audit: AuditConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl HsmConfig {
    /// Simulation-mode configuration, convenient for tests.
    pub fn simulation(seed: u64) -> Self {
        Self {
            mode: HsmMode::Simulation,
            simulation_seed: seed,
            ..Self::default()
        }
    }

    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, HsmError> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| HsmError::Configuration(format!("parse: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `CITADEL_HSM_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay values from an arbitrary lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = lookup("CITADEL_HSM_VENDOR") {
            self.vendor = v;
        }
        if let Some(v) = lookup("CITADEL_HSM_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(mode) = lookup("CITADEL_HSM_MODE").and_then(|v| parse_or_warn("CITADEL_HSM_MODE", &v)) {
            self.mode = mode;
        }
        if let Some(cap) = lookup("CITADEL_HSM_POOL_CAPACITY").and_then(|v| parse_or_warn("CITADEL_HSM_POOL_CAPACITY", &v)) {
            self.pool.capacity = cap;
        }
        if let Some(ms) = lookup("CITADEL_HSM_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| parse_or_warn("CITADEL_HSM_ACQUIRE_TIMEOUT_MS", &v))
        {
            self.pool.acquire_timeout_ms = ms;
        }
        if let Some(level) = lookup("CITADEL_HSM_AUDIT_LEVEL").and_then(|v| parse_or_warn("CITADEL_HSM_AUDIT_LEVEL", &v)) {
            self.audit.level = level;
        }
        if let Some(dir) = lookup("CITADEL_HSM_AUDIT_DIR") {
            self.audit.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(fips) = lookup("CITADEL_HSM_FIPS_MODE").and_then(|v| parse_or_warn("CITADEL_HSM_FIPS_MODE", &v)) {
            self.security.fips_mode = fips;
        }
    }

    /// The single validation gate. Every violation is a `Configuration` error.
    pub fn validate(&self) -> Result<(), HsmError> {
        let fail = |msg: String| Err(HsmError::Configuration(msg));

        if self.vendor.trim().is_empty() {
            return fail("vendor must not be empty".into());
        }
        if self.endpoint.trim().is_empty() {
            return fail("endpoint must not be empty".into());
        }
        if self.pool.capacity == 0 {
            return fail("pool capacity must be at least 1".into());
        }
        if self.pool.acquire_timeout_ms == 0 {
            return fail("pool acquire timeout must be non-zero".into());
        }
        if self.pool.min_idle > self.pool.capacity {
            return fail(format!(
                "pool min_idle {} exceeds capacity {}",
                self.pool.min_idle, self.pool.capacity
            ));
        }
        if self.algorithms.symmetric.is_empty() {
            return fail("symmetric allow-list must not be empty".into());
        }
        if self.algorithms.asymmetric.is_empty() {
            return fail("asymmetric allow-list must not be empty".into());
        }
        for (category, name) in self.algorithms.all_entries() {
            let alg = match Algorithm::from_name(name) {
                Ok(a) => a,
                Err(_) => return fail(format!("unknown algorithm in {} allow-list: {}", category, name)),
            };
            if alg.category() != category {
                return fail(format!("{} is listed as {} but is {}", alg, category, alg.category()));
            }
            if self.security.fips_mode && !alg.is_fips_approved() {
                return fail(format!("{} is not FIPS-approved but fips_mode is enabled", alg));
            }
        }
        for op in OperationType::ALL {
            if self.performance.target_ms(op) == 0 {
                return fail(format!("performance target for {} must be non-zero", op));
            }
        }
        if self.audit.max_file_bytes == 0 {
            return fail("audit max_file_bytes must be non-zero".into());
        }
        if self.audit.flush_threshold == 0 {
            return fail("audit flush_threshold must be non-zero".into());
        }
        if self.audit.flush_interval_ms == 0 {
            return fail("audit flush_interval_ms must be non-zero".into());
        }
        if self.audit.encrypt && self.audit.key_env_var.trim().is_empty() {
            return fail("audit encryption requires key_env_var".into());
        }
        if self.health.critical_failure_rate < self.health.degraded_failure_rate {
            return fail("critical failure rate must not be below degraded failure rate".into());
        }
        Ok(())
    }
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value, "ignoring unparseable override");
            None
        }
    }
}
