//! noesis-core: privacy-first cognitive-partner runtime (shared types,
//! persistence, credential vault, privacy engine, context store, gate
//! system, model router, agency monitor, self-improvement loop, and the
//! request orchestrator tying them together).

mod bus;
mod config;
mod context;
mod error;
mod feedback;
mod gates;
mod hashing;
mod monitor;
mod orchestrator;
mod persistence;
mod privacy;
mod router;
mod secure_memory;
mod types;
mod vault;

// Configuration
pub use config::{Config, FeedbackConfig, GateConfig, MonitorConfig, PrivacyConfig, RouterConfig};

// Event bus backing the subscription half of the Core→collaborator API (#10)
pub use bus::EventBus;

// Core data model (§3)
pub use types::{
    ActionKind, AgencySnapshot, AriTrend, CapabilityAxes, ConsentLevel, ConsentRecord, ContextWindow, DebtKind,
    DebtSeverity, EpistemicDebt, FactCheckStatus, FeedbackEvent, FeedbackKind, GateKind, GateOutcome,
    ImprovementSuggestion, MemoryEntry, MemoryKind, MemoryPriority, ModelDescriptor, ModelPerformance,
    OptimizationGoal, PiiAction, PiiKind, PiiMatch, PrivacyBudget, Provider, Request, Sensitivity, Stage,
    TaskComplexity,
};

// Errors
pub use error::{
    ContextError, ErrorKind, GateError, InvariantViolation, PrivacyError, RouterError, StageError, StageName,
    StoreError, VaultError,
};

// Persistence (component #9)
pub use persistence::Store;

// Credential Vault (component #1)
pub use vault::CredentialVault;

// Privacy Engine (component #2)
pub use privacy::PrivacyEngine;

// Context Store (component #3)
pub use context::ContextStore;

// Monitor Suite (component #4)
pub use monitor::{ari::AriAlert, ari::AriAlertKind, edm::FactChecker, rdi::ExportedRdi, rdi::RdiInputs, rdi::RdiLevel};
pub use monitor::{AriMonitor, EdmMonitor, RdiMonitor};

// Gate System + Tribunal (component #5)
pub use gates::{ActionContext, GateSystem, TribunalVerdict};

// Model Router (component #6)
pub use router::{
    LlmProvider, LlmRequest, LlmResponse, LocalProvider, MockProvider, ModelRouter, Requirements, Selection,
    CLOUD_FALLBACK_ORDER,
};

// Self-Improvement Loop (component #7)
pub use feedback::FeedbackLoop;

// Request Orchestrator (component #8)
pub use orchestrator::{Orchestrator, ProcessInputs};

// Vault buffer hardening, exposed for callers that need to hold decrypted
// secrets of their own outside the vault (e.g. the gateway relaying a
// freshly-issued token).
pub use secure_memory::LockedVec;
