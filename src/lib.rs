//! # Citadel HSM
//!
//! A vendor-agnostic facade over hardware security modules.
//!
//! ## Quick Start
//!
//! ```rust
//! use citadel_hsm::{EncryptParams, GenerateKeyParams, Hsm, HsmConfig, DecryptParams};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let hsm = Hsm::new(HsmConfig::simulation(42)).unwrap();
//! hsm.initialize().await.unwrap();
//!
//! let key = hsm.generate_key(GenerateKeyParams::new("AES-256-GCM")).await.into_result().unwrap();
//! let sealed = hsm.encrypt(EncryptParams::new(key.id.clone(), b"secret".to_vec())).await;
//! let sealed = sealed.into_result().unwrap();
//! let opened = hsm.decrypt(DecryptParams::from(&sealed)).await.into_result().unwrap();
//! assert_eq!(opened, b"secret");
//!
//! hsm.shutdown().await.unwrap();
//! # });
//! ```
//!
//! ## Guarantees
//!
//! - **One audit entry per call**: success, refusal and failure alike, with
//!   the same operation id as the returned [`OperationOutcome`].
//! - **Bounded connections**: at most `pool.capacity` vendor sessions, FIFO
//!   waiters, timeouts that never leak a slot.
//! - **Tamper evidence**: audit entries are hash-chained and verifiable
//!   across rotated files.
//! - **Vendor isolation**: vendor errors are normalized and never cross the
//!   facade boundary in native form.
//!
//! ## What's NOT Provided
//!
//! - Network API or CLI
//! - Key import or export of private material
//! - Cluster coordination

#![deny(unsafe_code)]

pub mod alert;
pub mod audit;
pub mod config;
pub mod error;
pub mod health;
pub mod hsm;
pub mod metrics;
pub mod params;
pub mod policy;
pub mod pool;
pub mod status;
pub mod store;
pub mod types;
pub mod vendor;

pub use alert::{Alert, AlertBus, AlertKind, SuspicionKind, SuspiciousActivity};
pub use audit::{
    verify_log_directory, AuditEntry, AuditLogger, AuditSink, AuditStatistics, MemorySink, OperationId,
    RotatingFileSink, TimeRange, VerificationReport,
};
pub use config::{AuditLevel, AuthMethod, HsmConfig, HsmMode};
pub use error::{ErrorInfo, HsmError};
pub use health::{HealthState, HealthStatus};
pub use hsm::{Hsm, HsmBuilder};
pub use params::{
    BulkFailure, BulkGenerationReport, DecapsulateParams, DecryptParams, EncapsulateParams, EncapsulatedKey,
    EncryptParams, EncryptedData, GenerateKeyParams, PublicKeyExport, RotationResult, SignParams, Signature,
    VerifyParams,
};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use status::{ComprehensiveStatus, Lifecycle};
pub use store::{FileStore, InMemoryStore, MetadataStore};
pub use types::{
    AccessRecord, Classification, EscrowPolicy, EscrowStatus, KeyId, KeyMetadata, KeyState, KeyType, KeyUsage,
    OperationOutcome, OperationResult, OperationType,
};
pub use vendor::{SoftToken, VendorAdapter, VendorError, VendorRegistry};

pub use citadel_hsm_crypto::{Algorithm, AlgorithmCategory, SecretBytes};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
