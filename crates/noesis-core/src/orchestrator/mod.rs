//! Request Orchestrator (component #8): drives a [`Request`] through the
//! eleven pipeline stages, wiring every other component together behind the
//! single [`Orchestrator::process`] entry point. Stage order and the
//! terminal/non-terminal edge-case policy per stage are carried from
//! `pipeline.py`.

use crate::error::{ErrorKind, PrivacyError};
use crate::gates::{ActionContext, GateSystem};
use crate::monitor::ari::AriMonitor;
use crate::monitor::edm::EdmMonitor;
use crate::monitor::rdi::{RdiInputs, RdiMonitor};
use crate::context::ContextStore;
use crate::feedback::FeedbackLoop;
use crate::privacy::PrivacyEngine;
use crate::router::{LlmRequest, ModelRouter, Requirements};
use crate::types::{
    AgencySnapshot, FeedbackEvent, FeedbackKind, MemoryKind, MemoryPriority, OptimizationGoal, PiiAction, Request,
    Stage,
};
use std::collections::HashMap;

/// Everything the orchestrator needs beyond the request itself: the
/// decision context for the Gate System, the requirements/goal for the
/// Model Router, and the reliance-monitor inputs the client is expected to
/// supply from its own on-device telemetry.
pub struct ProcessInputs {
    pub action_context: ActionContext,
    pub requirements: Requirements,
    pub goal: OptimizationGoal,
    pub epsilon_cost: f64,
    pub pii_action: PiiAction,
    pub rdi_inputs: RdiInputs,
    pub pre_skill: f32,
    pub post_skill: f32,
    pub task_efficacy: f32,
    pub ai_reliance: f32,
    pub autonomy_retention: f32,
}

pub struct Orchestrator {
    store: std::sync::Arc<crate::persistence::Store>,
    privacy: PrivacyEngine,
    context: ContextStore,
    gates: GateSystem,
    router: ModelRouter,
    ari: AriMonitor,
    edm: EdmMonitor,
    rdi: RdiMonitor,
    feedback: FeedbackLoop,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: std::sync::Arc<crate::persistence::Store>,
        privacy: PrivacyEngine,
        context: ContextStore,
        gates: GateSystem,
        router: ModelRouter,
        ari: AriMonitor,
        edm: EdmMonitor,
        rdi: RdiMonitor,
        feedback: FeedbackLoop,
    ) -> Self {
        Self {
            store,
            privacy,
            context,
            gates,
            router,
            ari,
            edm,
            rdi,
            feedback,
        }
    }

    /// Drives `request` through every stage in order. Returns the request
    /// frozen at whatever stage it terminated on — success or a typed
    /// failure, never a panic.
    pub async fn process(&self, mut request: Request, inputs: ProcessInputs) -> Request {
        request.advance_to(Stage::Intake);

        if !self.run_pii_detection(&mut request, &inputs) {
            return request;
        }
        if !self.run_context_retrieval(&mut request) {
            return request;
        }
        if !self.run_gate_evaluation(&mut request, &inputs) {
            return request;
        }
        self.run_model_selection(&mut request, &inputs);
        if !self.run_execution(&mut request).await {
            return request;
        }
        self.run_response_validation(&mut request).await;
        self.run_monitoring(&mut request, &inputs);
        self.run_context_update(&mut request);
        self.run_performance_tracking(&mut request);
        self.run_feedback(&mut request);

        request.success = true;
        request
    }

    /// §4.1 edge case: a privacy-budget overrun is terminal at this stage.
    fn run_pii_detection(&self, request: &mut Request, inputs: &ProcessInputs) -> bool {
        match self.privacy.check_and_charge(&request.user_id, inputs.epsilon_cost) {
            Ok(true) => {}
            Ok(false) | Err(PrivacyError::BudgetExceeded(_)) => {
                request.fail(Stage::PiiDetection, ErrorKind::PrivacyBudgetExceeded);
                return false;
            }
            Err(_) => {
                request.fail(Stage::PiiDetection, ErrorKind::InternalInvariantViolation);
                return false;
            }
        }
        let (redacted, matches) = self.privacy.apply(&request.processed_query, inputs.pii_action);
        request.processed_query = redacted;
        request
            .stage_metadata
            .insert("pii_matches".to_string(), serde_json::json!(matches.len()));
        request.advance_to(Stage::ContextRetrieval);
        true
    }

    fn run_context_retrieval(&self, request: &mut Request) -> bool {
        match self.context.build_window(&request.user_id, &request.session_id, None, 4096) {
            Ok(window) => {
                request
                    .stage_metadata
                    .insert("context_tokens".to_string(), serde_json::json!(window.total_tokens));
                if !window.pruned_memories.is_empty() {
                    request.stage_metadata.insert(
                        "pruned_memories".to_string(),
                        serde_json::json!(window.pruned_memories.len()),
                    );
                }
            }
            Err(e) => {
                tracing::warn!(target: "noesis::orchestrator", error = %e, "context window build failed, continuing without one");
            }
        }
        request.advance_to(Stage::GateEvaluation);
        true
    }

    /// §4.1 edge case: a gate-blocked verdict (protected path, or tribunal
    /// denial) is terminal at this stage.
    fn run_gate_evaluation(&self, request: &mut Request, inputs: &ProcessInputs) -> bool {
        let outcomes = match self.gates.evaluate(&inputs.action_context) {
            Ok(outcomes) => outcomes,
            Err(_protected_path) => {
                request.fail(Stage::GateEvaluation, ErrorKind::GateBlocked);
                return false;
            }
        };
        let failed: Vec<_> = outcomes.into_iter().filter(|o| !o.approved).collect();
        if failed.is_empty() {
            request.advance_to(Stage::ModelSelection);
            return true;
        }

        let verdict = self.gates.tribunal_review(&inputs.action_context, &failed);
        if verdict.approved {
            request.tribunal_override = true;
            request
                .stage_metadata
                .insert("tribunal_rationale".to_string(), serde_json::json!(verdict.rationale));
            request.advance_to(Stage::ModelSelection);
            true
        } else {
            request.fail(Stage::GateEvaluation, ErrorKind::TribunalDenied);
            false
        }
    }

    /// Model selection never fails outright — an empty filter result falls
    /// back to the local backend inside [`ModelRouter::select`], marking
    /// `fallback = true` on the request.
    fn run_model_selection(&self, request: &mut Request, inputs: &ProcessInputs) {
        let selection = self.router.select(&inputs.requirements, inputs.goal);
        request.selected_provider = Some(format!("{:?}", selection.provider).to_lowercase());
        request.selected_model = Some(selection.model.clone());
        request.fallback = selection.reason.contains("fell back");
        request
            .stage_metadata
            .insert("selection_reason".to_string(), serde_json::json!(selection.reason));
        request.advance_to(Stage::Execution);
    }

    /// §4.1 edge case: execution failure (even after the router's internal
    /// cloud fallback list is exhausted) is terminal at this stage.
    async fn run_execution(&self, request: &mut Request) -> bool {
        let provider = request.selected_provider.clone().unwrap_or_default();
        let model = request.selected_model.clone().unwrap_or_default();
        let selection = crate::router::Selection {
            provider: parse_provider(&provider),
            model,
            score: 0.0,
            reason: String::new(),
        };
        let llm_request = LlmRequest {
            prompt: request.processed_query.clone(),
            system_prompt: None,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 1.0,
            stop: vec![],
            history: vec![],
        };
        match self.router.execute(&selection, &llm_request).await {
            Ok(response) => {
                request.model_response = Some(response.text);
                request.advance_to(Stage::ResponseValidation);
                true
            }
            Err(_) => {
                request.fail(Stage::Execution, ErrorKind::ExecutionFailed);
                false
            }
        }
    }

    /// Never terminal: the Epistemic Debt Monitor only annotates the
    /// request with what it found. High/critical-severity debts also feed
    /// the Self-Improvement Loop as an `EdmAlert` feedback event (§4.7).
    async fn run_response_validation(&self, request: &mut Request) {
        if let Some(response) = &request.model_response {
            let mut debts = self.edm.detect(response, &request.id);
            for debt in &mut debts {
                let high_severity =
                    matches!(debt.severity, crate::types::DebtSeverity::High | crate::types::DebtSeverity::Critical);
                if high_severity {
                    self.edm.resolve(debt).await;
                }
                self.edm.persist(debt);
                if high_severity {
                    self.feedback.record(FeedbackEvent {
                        id: format!("{}-edm-{}", request.id, debt.id),
                        timestamp: chrono::Utc::now(),
                        kind: FeedbackKind::EdmAlert,
                        source_component: "monitor::edm".to_string(),
                        request_id: Some(request.id.clone()),
                        user_id: Some(request.user_id.clone()),
                        rating: None,
                        free_text: Some(format!("{:?} claim detected: {}", debt.kind, debt.claim_text)),
                        metadata: HashMap::new(),
                    });
                }
            }
            request
                .stage_metadata
                .insert("epistemic_debts".to_string(), serde_json::json!(debts.len()));
        }
        request.advance_to(Stage::Monitoring);
    }

    /// Never terminal (§4.1): a failure in any monitor here is logged as
    /// feedback, never as a request failure.
    fn run_monitoring(&self, request: &mut Request, inputs: &ProcessInputs) {
        let snapshot = AgencySnapshot {
            timestamp: chrono::Utc::now(),
            request_id: request.id.clone(),
            task_category: request.task_category.clone(),
            delta_agency: inputs.post_skill - inputs.pre_skill,
            bhir: inputs.task_efficacy,
            task_efficacy: inputs.task_efficacy,
            pre_skill: inputs.pre_skill,
            post_skill: inputs.post_skill,
            ai_reliance: inputs.ai_reliance,
            autonomy_retention: inputs.autonomy_retention,
            metadata: HashMap::new(),
        };
        let alerts = self.ari.record(&request.user_id, snapshot);
        for alert in &alerts {
            self.feedback.record(FeedbackEvent {
                id: format!("{}-ari-{:?}", request.id, alert.kind),
                timestamp: alert.timestamp,
                kind: FeedbackKind::AriAlert,
                source_component: "router".to_string(),
                request_id: Some(request.id.clone()),
                user_id: Some(request.user_id.clone()),
                rating: None,
                free_text: Some(format!("{:?} crossed threshold", alert.kind)),
                metadata: HashMap::new(),
            });
        }

        let level = self.rdi.assess(&request.user_id, inputs.rdi_inputs);
        request
            .stage_metadata
            .insert("rdi_level".to_string(), serde_json::json!(format!("{level:?}")));

        request.advance_to(Stage::ContextUpdate);
    }

    fn run_context_update(&self, request: &mut Request) {
        if let Some(response) = &request.model_response {
            self.context.store_entry(
                &request.user_id,
                &request.session_id,
                response,
                MemoryKind::Conversation,
                MemoryPriority::Medium,
                vec![],
                None,
                None,
            );
        }
        request.advance_to(Stage::PerformanceTracking);
    }

    /// Performance is recorded as a side effect of [`ModelRouter::execute`];
    /// this stage just advances the pipeline marker.
    fn run_performance_tracking(&self, request: &mut Request) {
        request.advance_to(Stage::Feedback);
    }

    fn run_feedback(&self, request: &mut Request) {
        if request.tribunal_override {
            self.feedback.record(FeedbackEvent {
                id: format!("{}-tribunal", request.id),
                timestamp: chrono::Utc::now(),
                kind: FeedbackKind::GateViolation,
                source_component: "gates".to_string(),
                request_id: Some(request.id.clone()),
                user_id: Some(request.user_id.clone()),
                rating: None,
                free_text: Some("tribunal override granted".to_string()),
                metadata: HashMap::new(),
            });
        }
        self.store.flush().ok();
    }
}

fn parse_provider(name: &str) -> crate::types::Provider {
    match name {
        "openai" => crate::types::Provider::Openai,
        "anthropic" => crate::types::Provider::Anthropic,
        "google" => crate::types::Provider::Google,
        _ => crate::types::Provider::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::{LocalProvider, MockProvider};
    use crate::types::{OptimizationGoal as RouterGoal, Provider};
    use std::sync::Arc;

    fn build() -> Orchestrator {
        let cfg = Config::default();
        let store = Arc::new(crate::persistence::Store::temporary());
        let privacy = PrivacyEngine::new(cfg.privacy.clone(), store.clone());
        let context = ContextStore::new(store.clone());
        let gates = GateSystem::new(cfg.gates.clone(), store.clone());
        let router = ModelRouter::new(cfg.router.clone(), store.clone());
        router.register_provider(Provider::Local, Arc::new(LocalProvider));
        router.register_provider(Provider::Google, Arc::new(MockProvider { provider: Provider::Google, fail: false }));
        let ari = AriMonitor::new(cfg.monitor.clone(), store.clone());
        let edm = EdmMonitor::with_default_checkers(cfg.monitor.clone(), store.clone(), std::time::Duration::from_secs(1));
        let rdi = RdiMonitor::new(cfg.monitor.clone(), store.clone());
        let feedback = FeedbackLoop::new(cfg.feedback.clone(), store.clone());
        Orchestrator::new(store, privacy, context, gates, router, ari, edm, rdi, feedback)
    }

    fn happy_inputs() -> ProcessInputs {
        ProcessInputs {
            action_context: ActionContext {
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
            },
            requirements: Requirements::default(),
            goal: RouterGoal::Balanced,
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
    async fn happy_path_reaches_feedback_stage_successfully() {
        let orch = build();
        let request = Request::new("r1", "alice", "s1", "general", "hello there");
        let result = orch.process(request, happy_inputs()).await;
        assert_eq!(result.stage_completed, Stage::Feedback);
        assert!(result.success);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_terminal_at_pii_detection() {
        let cfg = Config {
            privacy: crate::config::PrivacyConfig { default_epsilon_cap: 0.05, ..Default::default() },
            ..Config::default()
        };
        let store = Arc::new(crate::persistence::Store::temporary());
        let privacy = PrivacyEngine::new(cfg.privacy.clone(), store.clone());
        let context = ContextStore::new(store.clone());
        let gates = GateSystem::new(cfg.gates.clone(), store.clone());
        let router = ModelRouter::new(cfg.router.clone(), store.clone());
        router.register_provider(Provider::Local, Arc::new(LocalProvider));
        let ari = AriMonitor::new(cfg.monitor.clone(), store.clone());
        let edm = EdmMonitor::with_default_checkers(cfg.monitor.clone(), store.clone(), std::time::Duration::from_secs(1));
        let rdi = RdiMonitor::new(cfg.monitor.clone(), store.clone());
        let feedback = FeedbackLoop::new(cfg.feedback.clone(), store.clone());
        let orch = Orchestrator::new(store, privacy, context, gates, router, ari, edm, rdi, feedback);

        let request = Request::new("r2", "bob", "s1", "general", "hi");
        let result = orch.process(request, happy_inputs()).await;
        assert_eq!(result.stage_completed, Stage::PiiDetection);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::PrivacyBudgetExceeded));
    }

    #[tokio::test]
    async fn gate_block_is_terminal_at_gate_evaluation() {
        let orch = build();
        let mut inputs = happy_inputs();
        inputs.action_context.emotional_manipulation = true;
        inputs.action_context.time_pressure = true;
        inputs.action_context.dark_patterns = 1.0;
        inputs.action_context.delta_agency = -0.2;
        inputs.action_context.reversible = false;
        let request = Request::new("r3", "carol", "s1", "general", "hi");
        let result = orch.process(request, inputs).await;
        assert_eq!(result.stage_completed, Stage::GateEvaluation);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::TribunalDenied));
    }
}
