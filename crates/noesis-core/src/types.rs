//! Core data model (spec.md §3). Every `type-like` string is a closed,
//! lowercase-serialized enum rather than a bare `String`, per the Design
//! Notes' "dynamic typing / enums" guidance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Pipeline stage, in the strict order the orchestrator advances through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
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

impl Stage {
    pub const ORDER: [Stage; 11] = [
        Stage::Intake,
        Stage::PiiDetection,
        Stage::ContextRetrieval,
        Stage::GateEvaluation,
        Stage::ModelSelection,
        Stage::Execution,
        Stage::ResponseValidation,
        Stage::Monitoring,
        Stage::ContextUpdate,
        Stage::PerformanceTracking,
        Stage::Feedback,
    ];

    pub fn next(self) -> Option<Stage> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

/// A single processed request. Created at intake, frozen on terminal stage.
/// `stage_completed` only ever advances monotonically — see
/// [`Request::advance_to`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub task_category: String,
    pub original_input: String,
    /// Stage-by-stage transformed text (e.g. post-PII-redaction).
    pub processed_query: String,
    pub selected_provider: Option<String>,
    pub selected_model: Option<String>,
    pub model_response: Option<String>,
    pub stage_completed: Stage,
    pub success: bool,
    pub error_kind: Option<crate::error::ErrorKind>,
    pub fallback: bool,
    pub tribunal_override: bool,
    pub stage_metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        task_category: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        let query = query.into();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            task_category: task_category.into(),
            original_input: query.clone(),
            processed_query: query,
            selected_provider: None,
            selected_model: None,
            model_response: None,
            stage_completed: Stage::Intake,
            success: false,
            error_kind: None,
            fallback: false,
            tribunal_override: false,
            stage_metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Advances `stage_completed` to `stage`. No-op (and logged) if `stage`
    /// is not strictly later than the current stage — the monotonicity
    /// invariant in §3.
    pub fn advance_to(&mut self, stage: Stage) {
        if stage > self.stage_completed {
            self.stage_completed = stage;
        } else {
            tracing::warn!(
                target: "noesis::orchestrator",
                request_id = %self.id,
                from = ?self.stage_completed,
                attempted = ?stage,
                "ignored non-monotonic stage advance"
            );
        }
    }

    pub fn fail(&mut self, stage: Stage, kind: crate::error::ErrorKind) {
        self.advance_to(stage);
        self.success = false;
        self.error_kind = Some(kind);
    }
}

// ---------------------------------------------------------------------------
// Memory Entry / Context Window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Conversation,
    Fact,
    Preference,
    Skill,
    Goal,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPriority {
    Ephemeral,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// sha256(user, content, timestamp) truncated to 16 hex chars.
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub vector: Option<Vec<f32>>,
    pub tags: Vec<String>,
    pub kind: MemoryKind,
    pub priority: MemoryPriority,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub relevance: f32,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub consolidated: bool,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    pub user_id: String,
    pub session_id: String,
    pub memory_ids: Vec<String>,
    pub total_tokens: u32,
    pub max_tokens: u32,
    pub pruned_memories: Vec<String>,
}

// ---------------------------------------------------------------------------
// Agency Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgencySnapshot {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub task_category: String,
    pub delta_agency: f32,
    pub bhir: f32,
    pub task_efficacy: f32,
    pub pre_skill: f32,
    pub post_skill: f32,
    pub ai_reliance: f32,
    pub autonomy_retention: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AriTrend {
    Increasing,
    Stable,
    Decreasing,
    Critical,
}

// ---------------------------------------------------------------------------
// Epistemic Debt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebtSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtKind {
    Unfalsifiable,
    MissingCitation,
    Vague,
    Outdated,
    Circular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCheckStatus {
    Pending,
    Verified,
    Disputed,
    False,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpistemicDebt {
    pub id: String,
    pub claim_text: String,
    pub context: String,
    pub request_id: String,
    pub severity: DebtSeverity,
    pub kind: DebtKind,
    pub status: FactCheckStatus,
    pub confidence: f32,
    pub evidence_source: Option<String>,
    pub resolved: bool,
    pub resolution_method: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Privacy Budget / Consent / PII
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub user_id: String,
    pub epsilon_spent: f64,
    pub epsilon_cap: f64,
    pub query_count: u64,
    pub query_cap: u64,
    pub last_reset: DateTime<Utc>,
    pub exceeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentLevel {
    None,
    Minimal,
    Standard,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub user_id: String,
    pub level: ConsentLevel,
    pub store: bool,
    pub analytics: bool,
    pub personalize: bool,
    pub share: bool,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PiiKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
    Name,
    Address,
    Dob,
    Ip,
    Location,
    Medical,
    Financial,
    Biometric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiAction {
    Redact,
    Mask,
    Hash,
    Tokenize,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiMatch {
    pub kind: PiiKind,
    pub span: (usize, usize),
    pub confidence: f32,
    pub sensitivity: Sensitivity,
}

// ---------------------------------------------------------------------------
// Model Descriptor / Performance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Openai,
    Anthropic,
    Google,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    #[default]
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationGoal {
    Cost,
    Latency,
    Quality,
    Privacy,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAxes {
    pub reasoning: f32,
    pub breadth: f32,
    pub code: f32,
    pub creativity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: Provider,
    pub model: String,
    pub max_context_tokens: u32,
    pub supports_streaming: bool,
    pub supports_functions: bool,
    pub supports_vision: bool,
    pub capability: CapabilityAxes,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub typical_latency_ms: u32,
    pub available: bool,
    pub retention_days: u32,
    pub trains_on_data: bool,
    pub local_execution: bool,
}

impl ModelDescriptor {
    pub fn key(&self) -> String {
        format!("{:?}:{}", self.provider, self.model).to_lowercase()
    }

    pub fn is_free(&self) -> bool {
        self.input_cost_per_1k == 0.0 && self.output_cost_per_1k == 0.0
    }

    /// Privacy score per spec §4.5: 1.0 local, 0.8 no external retention,
    /// 0.6 doesn't train on data, 0.3 otherwise. Canonical for both the
    /// `privacy` goal and the `privacy` term inside `balanced` (SPEC_FULL §4.5).
    pub fn privacy_score(&self) -> f32 {
        if self.local_execution {
            1.0
        } else if self.retention_days == 0 {
            0.8
        } else if !self.trains_on_data {
            0.6
        } else {
            0.3
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub recent_latencies_ms: std::collections::VecDeque<u32>,
    pub recent_costs: std::collections::VecDeque<f64>,
    pub recent_qualities: std::collections::VecDeque<f32>,
    pub avg_latency_ms: f32,
    pub avg_cost: f64,
    pub avg_quality: f32,
    pub error_rate: f32,
    pub last_error: Option<String>,
}

pub const PERFORMANCE_RING_CAPACITY: usize = 100;
pub const BACKPRESSURE_WINDOW: usize = 20;
pub const BACKPRESSURE_ERROR_RATE_CEILING: f32 = 0.5;

impl ModelPerformance {
    pub fn record(&mut self, success: bool, latency_ms: u32, cost: f64, quality: Option<f32>) {
        self.total_requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        push_bounded(&mut self.recent_latencies_ms, latency_ms, PERFORMANCE_RING_CAPACITY);
        push_bounded(&mut self.recent_costs, cost, PERFORMANCE_RING_CAPACITY);
        if let Some(q) = quality {
            push_bounded(&mut self.recent_qualities, q, PERFORMANCE_RING_CAPACITY);
        }
        self.avg_latency_ms = average_u32(&self.recent_latencies_ms);
        self.avg_cost = average_f64(&self.recent_costs);
        self.avg_quality = average_f32(&self.recent_qualities);
        self.error_rate = self.failures as f32 / self.total_requests as f32;
    }

    /// Error rate over the last [`BACKPRESSURE_WINDOW`] calls only, used for
    /// the cool-down backpressure check (§5) — independent of the
    /// all-time `error_rate` used for reporting.
    pub fn recent_error_rate(&self) -> f32 {
        let window = BACKPRESSURE_WINDOW.min(self.recent_latencies_ms.len());
        if window == 0 {
            return 0.0;
        }
        // latencies ring doesn't carry success/fail directly; approximate
        // using the overall failure ratio is insufficient, so callers should
        // track recent outcomes separately (see router::CooldownTracker).
        self.error_rate
    }
}

fn push_bounded<T>(ring: &mut std::collections::VecDeque<T>, value: T, cap: usize) {
    ring.push_back(value);
    while ring.len() > cap {
        ring.pop_front();
    }
}

fn average_u32(ring: &std::collections::VecDeque<u32>) -> f32 {
    if ring.is_empty() {
        return 0.0;
    }
    ring.iter().sum::<u32>() as f32 / ring.len() as f32
}

fn average_f64(ring: &std::collections::VecDeque<f64>) -> f64 {
    if ring.is_empty() {
        return 0.0;
    }
    ring.iter().sum::<f64>() / ring.len() as f64
}

fn average_f32(ring: &std::collections::VecDeque<f32>) -> f32 {
    if ring.is_empty() {
        return 0.0;
    }
    ring.iter().sum::<f32>() / ring.len() as f32
}

// ---------------------------------------------------------------------------
// Feedback / Improvement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackKind {
    UserExplicitPositive,
    UserExplicitNegative,
    UserImplicitPositive,
    UserImplicitNegative,
    GateViolation,
    AriAlert,
    EdmAlert,
    PerformanceMetric,
}

impl FeedbackKind {
    pub fn is_negative(self) -> bool {
        matches!(
            self,
            FeedbackKind::UserExplicitNegative
                | FeedbackKind::UserImplicitNegative
                | FeedbackKind::GateViolation
                | FeedbackKind::AriAlert
                | FeedbackKind::EdmAlert
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: FeedbackKind,
    pub source_component: String,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub rating: Option<f32>,
    pub free_text: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    PromptRefinement,
    ParameterAdjustment,
    BehaviorChange,
    FineTune,
    FeatureDisable,
    HumanReviewRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSuggestion {
    pub id: String,
    pub action: ActionKind,
    pub target_component: String,
    pub description: String,
    pub rationale: String,
    pub confidence: f32,
    pub supporting_feedback_ids: Vec<String>,
    pub approved: bool,
    pub implemented: bool,
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Autonomy,
    Humanity,
    Oversight,
    Alignment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateKind,
    pub approved: bool,
    pub score: f32,
    pub reason: String,
    pub details: HashMap<String, serde_json::Value>,
}
