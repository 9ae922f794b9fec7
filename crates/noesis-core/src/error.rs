//! Error kinds surfaced on `Request`s, plus the leaf errors each component
//! raises internally before they are folded into an [`ErrorKind`] at the
//! orchestrator boundary.

use serde::{Deserialize, Serialize};

/// Error kind surfaced on a [`crate::orchestrator::Request`]. Stable,
/// lowercase-serialized per the persisted-state contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PrivacyBudgetExceeded,
    GateBlocked,
    TribunalDenied,
    ModelFilteredEmpty,
    ExecutionFailed,
    Cancelled,
    InternalInvariantViolation,
}

/// The pipeline stage at which a [`StageError`] occurred. Mirrors
/// [`crate::orchestrator::Stage`] but kept separate so error reporting does
/// not require the orchestrator module to expose its internal loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Intake,
    PiiDetection,
    ContextRetrieval,
    GateEvaluation,
    ModelSelection,
    Execution,
    ResponseValidation,
    Monitoring,
    ContextUpdate,
    PerformanceTracking,
    Feedback,
}

/// A stage failure: which stage failed, and why. Converted to an
/// [`ErrorKind`] + message pair when a `Request` is frozen.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage:?} failed: {kind:?} ({detail})")]
pub struct StageError {
    pub stage: StageName,
    pub kind: ErrorKind,
    pub detail: String,
}

impl StageError {
    pub fn new(stage: StageName, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
        }
    }
}

/// Errors raised by the Credential Vault.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VaultError {
    #[error("credential vault is locked (no master key provided)")]
    Locked,
    #[error("vault encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("vault decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("vault blob is corrupt (too short)")]
    CorruptBlob,
    #[error("no credential stored for provider {0}")]
    NotFound(String),
}

/// Errors raised by the Privacy Engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrivacyError {
    #[error("privacy budget exceeded for user {0}")]
    BudgetExceeded(String),
    #[error("request blocked by privacy action on {0:?}")]
    Blocked(crate::types::PiiKind),
    #[error("consent does not permit {permission} for user {user}")]
    ConsentDenied { user: String, permission: String },
}

/// Errors raised by the Context Store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("attempted to prune a critical-priority memory entry {0}")]
    CriticalPruneAttempt(String),
    #[error("memory entry {0} not found")]
    NotFound(String),
}

/// Errors raised by the Gate System + Tribunal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("request targets a protected path: {0}")]
    ProtectedPath(String),
    #[error("gate(s) failed and tribunal denied override: {0:?}")]
    Blocked(Vec<crate::types::GateKind>),
}

/// Errors raised by the Model Router.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    #[error("no model descriptor satisfied the request's hard requirements")]
    FilteredEmpty,
    #[error("execution failed on every candidate, including fallback list")]
    ExecutionFailed,
    #[error("backend {0} is in cooldown due to elevated error rate")]
    Cooldown(String),
}

/// Internal invariant violation. Reserved for programmer-error conditions the
/// spec says must never be reachable through normal operation (e.g. a
/// critical-priority memory slated for pruning). Raised as a typed error, not
/// a panic, so the orchestrator can still emit a high-severity feedback event
/// before surfacing `internal-invariant-violation` to the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("internal invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Persistence-layer errors (sled I/O, (de)serialization).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
