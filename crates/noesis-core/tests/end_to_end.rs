//! Integration-style end-to-end scenarios driving the full orchestrator
//! pipeline in-process, against a real (temp-directory) sled store rather
//! than the in-memory `Store::temporary()` fixture used by unit tests.

use noesis_core::{
    ActionContext, AriMonitor, Config, ContextStore, EdmMonitor, FeedbackLoop, GateSystem, LocalProvider, ModelRouter,
    MockProvider, Orchestrator, OptimizationGoal, PiiAction, PrivacyEngine, ProcessInputs, Provider, RdiInputs,
    RdiMonitor, Request, Requirements, Stage, Store,
};
use std::sync::Arc;
use std::time::Duration;

fn build_orchestrator(store: Arc<Store>, config: &Config) -> Orchestrator {
    let privacy = PrivacyEngine::new(config.privacy.clone(), store.clone());
    let context = ContextStore::new(store.clone());
    let gates = GateSystem::new(config.gates.clone(), store.clone());
    let router = ModelRouter::new(config.router.clone(), store.clone());
    router.register_provider(Provider::Local, Arc::new(LocalProvider));
    router.register_provider(Provider::Google, Arc::new(MockProvider { provider: Provider::Google, fail: false }));
    let ari = AriMonitor::new(config.monitor.clone(), store.clone());
    let edm = EdmMonitor::with_default_checkers(config.monitor.clone(), store.clone(), Duration::from_secs(1));
    let rdi = RdiMonitor::new(config.monitor.clone(), store.clone());
    let feedback = FeedbackLoop::new(config.feedback.clone(), store.clone());
    Orchestrator::new(store, privacy, context, gates, router, ari, edm, rdi, feedback)
}

fn approving_action_context() -> ActionContext {
    ActionContext {
        delta_agency: 0.1,
        reversible: true,
        human_review: true,
        appeal_available: true,
        explanation_provided: true,
        audit_trail: true,
        matches_user_values: true,
        matches_system_values: true,
        history_consistent: true,
        transparent_goals: true,
        ..Default::default()
    }
}

fn happy_inputs() -> ProcessInputs {
    ProcessInputs {
        action_context: approving_action_context(),
        requirements: Requirements::default(),
        goal: OptimizationGoal::Balanced,
        epsilon_cost: 0.1,
        pii_action: PiiAction::Redact,
        rdi_inputs: RdiInputs::default(),
        pre_skill: 0.5,
        post_skill: 0.5,
        task_efficacy: 0.9,
        ai_reliance: 0.2,
        autonomy_retention: 0.9,
    }
}

#[tokio::test]
async fn full_pipeline_reaches_feedback_and_persists_a_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let config = Config::default();
    let orch = build_orchestrator(store.clone(), &config);

    let request = Request::new("req-1", "alice", "sess-1", "general", "My email is alice@example.com, please help.");
    let result = orch.process(request, happy_inputs()).await;

    assert_eq!(result.stage_completed, Stage::Feedback);
    assert!(result.success);
    assert!(result.error_kind.is_none());
    // PII was detected and redacted before reaching the model.
    assert!(!result.processed_query.contains("alice@example.com"));

    // The response got stored as a new context memory for the same user.
    let context = ContextStore::new(store.clone());
    let memories = context.search("alice", None, None, &[], 10, 0.0);
    assert!(!memories.is_empty());
}

#[tokio::test]
async fn privacy_budget_exhaustion_halts_the_pipeline_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let mut config = Config::default();
    config.privacy.default_epsilon_cap = 0.05;
    let orch = build_orchestrator(store, &config);

    let request = Request::new("req-2", "bob", "sess-1", "general", "hi there");
    let result = orch.process(request, happy_inputs()).await;

    assert_eq!(result.stage_completed, Stage::PiiDetection);
    assert!(!result.success);
    assert!(result.model_response.is_none());
}

#[tokio::test]
async fn emotionally_manipulative_irreversible_action_is_blocked_by_tribunal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let config = Config::default();
    let orch = build_orchestrator(store, &config);

    let mut inputs = happy_inputs();
    inputs.action_context.emotional_manipulation = true;
    inputs.action_context.time_pressure = true;
    inputs.action_context.dark_patterns = 1.0;
    inputs.action_context.delta_agency = -0.2;
    inputs.action_context.reversible = false;

    let request = Request::new("req-3", "carol", "sess-1", "general", "please do this for me");
    let result = orch.process(request, inputs).await;

    assert_eq!(result.stage_completed, Stage::GateEvaluation);
    assert!(!result.success);
    assert!(!result.tribunal_override);
}

#[tokio::test]
async fn borderline_failed_gates_can_be_overridden_by_tribunal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let config = Config::default();
    let orch = build_orchestrator(store, &config);

    // Oversight is weak (only two of four indicators) but still reviewable
    // and reversible, so the mean failed-gate score should clear the
    // tribunal's override threshold instead of hard-blocking.
    let mut inputs = happy_inputs();
    inputs.action_context.appeal_available = false;
    inputs.action_context.audit_trail = false;

    let request = Request::new("req-4", "dave", "sess-1", "general", "go ahead");
    let result = orch.process(request, inputs).await;

    assert_eq!(result.stage_completed, Stage::Feedback);
    assert!(result.success);
}
