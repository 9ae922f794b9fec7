//! Model Router (component #6): filters & scores backends against task
//! requirements, tracks rolling performance, executes calls with fallback.
//! Registry catalog, scoring formulas, complexity→quality blend table, and
//! the fixed cloud fallback order are carried from `original_source`'s
//! `multi_model.py`. Provider adapters are isolated behind [`LlmProvider`],
//! matching `base.py`'s `BaseLLMProvider` and the Design Notes' "isolate
//! providers behind a small interface" guidance.

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::persistence::Store;
use crate::types::{
    CapabilityAxes, ModelDescriptor, ModelPerformance, OptimizationGoal, Provider, TaskComplexity,
    BACKPRESSURE_ERROR_RATE_CEILING, BACKPRESSURE_WINDOW,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Hard requirements a candidate descriptor must satisfy before scoring.
/// `Serialize`/`Deserialize` with an all-defaulting container attribute so
/// the gateway can accept this directly as a JSON request body field.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub needs_streaming: bool,
    pub needs_functions: bool,
    pub needs_vision: bool,
    pub local_only: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub max_cost: Option<f64>,
    pub max_latency_ms: Option<u32>,
    pub preferred_model: Option<String>,
    pub complexity: TaskComplexity,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Provider,
    pub model: String,
    pub score: f32,
    pub reason: String,
}

/// LLM request/response wire shape (§6), provider-agnostic.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
    pub history: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub model: String,
    pub provider: Provider,
    pub latency_ms: u32,
    pub finish_reason: String,
}

/// Small interface isolating provider I/O (Design Notes "coroutine control
/// flow" — provider adapters are async I/O behind this trait).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, String>;
    async fn generate_stream(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, String> {
        self.generate(model, request).await
    }
    async fn is_available(&self) -> bool {
        true
    }
}

/// Always-present, zero-cost, local backend — the "well-known local
/// backend" referenced throughout §4.1/§4.5 as the universal fallback.
pub struct LocalProvider;

#[async_trait]
impl LlmProvider for LocalProvider {
    async fn generate(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, String> {
        Ok(LlmResponse {
            text: format!("[local:{model}] {}", request.prompt),
            input_tokens: request.prompt.split_whitespace().count() as u32,
            output_tokens: 0,
            cost: 0.0,
            model: model.to_string(),
            provider: Provider::Local,
            latency_ms: 5,
            finish_reason: "stop".to_string(),
        })
    }
}

/// Deterministic provider used by tests and by `llm_mode = "mock"` — stands
/// in for the out-of-scope concrete remote transports (spec.md §1).
pub struct MockProvider {
    pub provider: Provider,
    pub fail: bool,
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, String> {
        if self.fail {
            return Err(format!("{:?} connection refused", self.provider));
        }
        Ok(LlmResponse {
            text: format!("[{:?}:{model}] {}", self.provider, request.prompt),
            input_tokens: request.prompt.split_whitespace().count() as u32,
            output_tokens: 32,
            cost: 0.001,
            model: model.to_string(),
            provider: self.provider,
            latency_ms: 200,
            finish_reason: "stop".to_string(),
        })
    }

    async fn is_available(&self) -> bool {
        !self.fail
    }
}

/// Fixed cloud fallback order, carried verbatim from `multi_model.py`.
pub const CLOUD_FALLBACK_ORDER: &[(Provider, &str)] = &[
    (Provider::Google, "gemini-1.5-flash"),
    (Provider::Anthropic, "claude-3-haiku-20240307"),
    (Provider::Openai, "gpt-3.5-turbo"),
    (Provider::Google, "gemini-1.5-pro"),
];

fn seed_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            provider: Provider::Local,
            model: "phi-2".to_string(),
            max_context_tokens: 2048,
            supports_streaming: false,
            supports_functions: false,
            supports_vision: false,
            capability: CapabilityAxes { reasoning: 0.4, breadth: 0.35, code: 0.3, creativity: 0.3 },
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            typical_latency_ms: 1500,
            available: true,
            retention_days: 0,
            trains_on_data: false,
            local_execution: true,
        },
        ModelDescriptor {
            provider: Provider::Openai,
            model: "gpt-4-turbo".to_string(),
            max_context_tokens: 128_000,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: true,
            capability: CapabilityAxes { reasoning: 0.95, breadth: 0.9, code: 0.92, creativity: 0.85 },
            input_cost_per_1k: 0.01,
            output_cost_per_1k: 0.03,
            typical_latency_ms: 3000,
            available: true,
            retention_days: 30,
            trains_on_data: false,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Openai,
            model: "gpt-3.5-turbo".to_string(),
            max_context_tokens: 16_385,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: false,
            capability: CapabilityAxes { reasoning: 0.7, breadth: 0.75, code: 0.65, creativity: 0.7 },
            input_cost_per_1k: 0.0005,
            output_cost_per_1k: 0.0015,
            typical_latency_ms: 1200,
            available: true,
            retention_days: 30,
            trains_on_data: false,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Anthropic,
            model: "claude-3-opus".to_string(),
            max_context_tokens: 200_000,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: true,
            capability: CapabilityAxes { reasoning: 0.97, breadth: 0.92, code: 0.9, creativity: 0.9 },
            input_cost_per_1k: 0.015,
            output_cost_per_1k: 0.075,
            typical_latency_ms: 4000,
            available: true,
            retention_days: 0,
            trains_on_data: false,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Anthropic,
            model: "claude-3-haiku-20240307".to_string(),
            max_context_tokens: 200_000,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: true,
            capability: CapabilityAxes { reasoning: 0.75, breadth: 0.78, code: 0.72, creativity: 0.75 },
            input_cost_per_1k: 0.00025,
            output_cost_per_1k: 0.00125,
            typical_latency_ms: 900,
            available: true,
            retention_days: 0,
            trains_on_data: false,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Google,
            model: "gemini-1.5-pro".to_string(),
            max_context_tokens: 1_000_000,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: true,
            capability: CapabilityAxes { reasoning: 0.9, breadth: 0.93, code: 0.85, creativity: 0.82 },
            input_cost_per_1k: 0.0035,
            output_cost_per_1k: 0.0105,
            typical_latency_ms: 2500,
            available: true,
            retention_days: 30,
            trains_on_data: true,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Google,
            model: "gemini-1.5-flash".to_string(),
            max_context_tokens: 1_000_000,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: true,
            capability: CapabilityAxes { reasoning: 0.78, breadth: 0.8, code: 0.7, creativity: 0.72 },
            input_cost_per_1k: 0.000075,
            output_cost_per_1k: 0.0003,
            typical_latency_ms: 700,
            available: true,
            retention_days: 30,
            trains_on_data: true,
            local_execution: false,
        },
        ModelDescriptor {
            provider: Provider::Google,
            model: "gemini-pro".to_string(),
            max_context_tokens: 32_760,
            supports_streaming: true,
            supports_functions: false,
            supports_vision: false,
            capability: CapabilityAxes { reasoning: 0.8, breadth: 0.82, code: 0.75, creativity: 0.76 },
            input_cost_per_1k: 0.0005,
            output_cost_per_1k: 0.0015,
            typical_latency_ms: 1500,
            available: true,
            retention_days: 30,
            trains_on_data: true,
            local_execution: false,
        },
    ]
}

fn quality_score(c: &CapabilityAxes, complexity: TaskComplexity) -> f32 {
    match complexity {
        TaskComplexity::Trivial => 1.0,
        TaskComplexity::Simple => c.reasoning.max(c.breadth),
        TaskComplexity::Moderate => 0.6 * c.reasoning + 0.4 * c.breadth,
        TaskComplexity::Complex => 0.8 * c.reasoning + 0.2 * c.breadth,
        TaskComplexity::Expert => c.reasoning.min(c.breadth),
    }
}

struct CooldownTracker {
    recent_outcomes: VecDeque<bool>,
    cooldown_until: Option<Instant>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self {
            recent_outcomes: VecDeque::new(),
            cooldown_until: None,
        }
    }
}

impl CooldownTracker {
    fn record(&mut self, success: bool) {
        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > BACKPRESSURE_WINDOW {
            self.recent_outcomes.pop_front();
        }
        let failures = self.recent_outcomes.iter().filter(|s| !**s).count();
        let rate = failures as f32 / self.recent_outcomes.len().max(1) as f32;
        if self.recent_outcomes.len() >= BACKPRESSURE_WINDOW && rate > BACKPRESSURE_ERROR_RATE_CEILING {
            self.cooldown_until = Some(Instant::now() + Duration::from_secs(60));
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

pub struct ModelRouter {
    config: RouterConfig,
    store: std::sync::Arc<Store>,
    registry: Mutex<Vec<ModelDescriptor>>,
    performance: DashMap<String, ModelPerformance>,
    cooldowns: DashMap<String, Mutex<CooldownTracker>>,
    providers: DashMap<Provider, std::sync::Arc<dyn LlmProvider>>,
}

const PERFORMANCE_PREFIX: &str = "orchestrator/model_performance";

impl ModelRouter {
    pub fn new(config: RouterConfig, store: std::sync::Arc<Store>) -> Self {
        let router = Self {
            config,
            store,
            registry: Mutex::new(seed_catalog()),
            performance: DashMap::new(),
            cooldowns: DashMap::new(),
            providers: DashMap::new(),
        };
        router.load_performance();
        router
    }

    fn load_performance(&self) {
        for key in self.store.scan_prefix(&format!("{PERFORMANCE_PREFIX}/")).unwrap_or_default() {
            if let Some(perf) = self.store.get_json::<ModelPerformance>(&key).ok().flatten() {
                if let Some(id) = key.strip_prefix(&format!("{PERFORMANCE_PREFIX}/")) {
                    self.performance.insert(id.to_string(), perf);
                }
            }
        }
    }

    pub fn register_provider(&self, provider: Provider, adapter: std::sync::Arc<dyn LlmProvider>) {
        self.providers.insert(provider, adapter);
    }

    fn descriptor_key(provider: Provider, model: &str) -> String {
        format!("{:?}:{}", provider, model).to_lowercase()
    }

    fn cost_score(&self, d: &ModelDescriptor) -> f32 {
        if d.is_free() {
            1.0
        } else {
            let estimated = d.input_cost_per_1k + d.output_cost_per_1k;
            (1.0 - estimated / self.config.cost_reference_per_1k).max(0.0) as f32
        }
    }

    fn latency_score(&self, d: &ModelDescriptor) -> f32 {
        (1.0 - d.typical_latency_ms as f32 / self.config.latency_reference_ms).max(0.0)
    }

    fn score(&self, d: &ModelDescriptor, goal: OptimizationGoal, complexity: TaskComplexity) -> f32 {
        let cost = self.cost_score(d);
        let latency = self.latency_score(d);
        let quality = quality_score(&d.capability, complexity);
        let privacy = d.privacy_score();
        match goal {
            OptimizationGoal::Cost => cost,
            OptimizationGoal::Latency => latency,
            OptimizationGoal::Quality => quality,
            OptimizationGoal::Privacy => privacy,
            OptimizationGoal::Balanced => 0.3 * cost + 0.2 * latency + 0.4 * quality + 0.1 * privacy,
        }
    }

    fn is_in_cooldown(&self, key: &str) -> bool {
        self.cooldowns
            .get(key)
            .map(|t| t.lock().unwrap().in_cooldown())
            .unwrap_or(false)
    }

    /// `select()` (§4.5): filter → optional preferred-model shortcut → score
    /// → take the top candidate, falling back to the local backend with
    /// confidence 0.5 if nothing survives filtering.
    pub fn select(&self, req: &Requirements, goal: OptimizationGoal) -> Selection {
        let registry = self.registry.lock().unwrap();

        if let Some(preferred) = &req.preferred_model {
            if req.complexity <= TaskComplexity::Moderate {
                if let Some(d) = registry.iter().find(|d| &d.model == preferred) {
                    return Selection {
                        provider: d.provider,
                        model: d.model.clone(),
                        score: 1.0,
                        reason: "user-preferred model for a moderate-or-simpler task".to_string(),
                    };
                }
            }
        }

        let candidates: Vec<&ModelDescriptor> = registry
            .iter()
            .filter(|d| d.available)
            .filter(|d| !self.is_in_cooldown(&d.key()))
            .filter(|d| !req.needs_streaming || d.supports_streaming)
            .filter(|d| !req.needs_functions || d.supports_functions)
            .filter(|d| !req.needs_vision || d.supports_vision)
            .filter(|d| !req.local_only || d.local_execution)
            .filter(|d| req.input_tokens + req.output_tokens <= d.max_context_tokens)
            .filter(|d| req.max_cost.map(|c| d.input_cost_per_1k + d.output_cost_per_1k <= c).unwrap_or(true))
            .filter(|d| req.max_latency_ms.map(|l| d.typical_latency_ms <= l).unwrap_or(true))
            .collect();

        if candidates.is_empty() {
            return Selection {
                provider: Provider::Local,
                model: "phi-2".to_string(),
                score: 0.5,
                reason: "no candidate survived filtering; fell back to local backend".to_string(),
            };
        }

        let mut best: Option<(&ModelDescriptor, f32)> = None;
        for d in candidates {
            let s = self.score(d, goal, req.complexity);
            if best.map(|(_, bs)| s > bs).unwrap_or(true) {
                best = Some((d, s));
            }
        }
        let (d, s) = best.expect("candidates non-empty");
        Selection {
            provider: d.provider,
            model: d.model.clone(),
            score: s,
            reason: format!("top-scored candidate under {:?} goal", goal),
        }
    }

    /// `execute()` (§4.5): dispatch to the provider adapter; on failure,
    /// try the fixed cloud fallback list in order. Every attempt updates
    /// `ModelPerformance`.
    pub async fn execute(
        &self,
        selection: &Selection,
        request: &LlmRequest,
    ) -> Result<LlmResponse, RouterError> {
        if let Some(response) = self.try_once(selection.provider, &selection.model, request).await {
            return Ok(response);
        }

        for (provider, model) in CLOUD_FALLBACK_ORDER {
            if *provider == selection.provider && *model == selection.model {
                continue;
            }
            if let Some(response) = self.try_once(*provider, model, request).await {
                return Ok(response);
            }
        }

        Err(RouterError::ExecutionFailed)
    }

    async fn try_once(&self, provider: Provider, model: &str, request: &LlmRequest) -> Option<LlmResponse> {
        let key = Self::descriptor_key(provider, model);
        let adapter = self.providers.get(&provider)?.clone();
        let started = Instant::now();
        let result = adapter.generate(model, request).await;
        let latency_ms = started.elapsed().as_millis() as u32;

        let success = result.is_ok();
        let cost = result.as_ref().map(|r| r.cost).unwrap_or(0.0);
        self.record_performance(&key, success, latency_ms, cost, result.as_ref().err());

        result.ok()
    }

    fn record_performance(&self, key: &str, success: bool, latency_ms: u32, cost: f64, error: Option<&String>) {
        {
            let mut entry = self.performance.entry(key.to_string()).or_default();
            entry.record(success, latency_ms, cost, None);
            if let Some(e) = error {
                entry.last_error = Some(e.clone());
            }
            if let Err(e) = self.store.put_json(&format!("{PERFORMANCE_PREFIX}/{key}"), &*entry) {
                tracing::error!(target: "noesis::router", error = %e, "failed to persist model performance");
            }
        }
        self.cooldowns
            .entry(key.to_string())
            .or_default()
            .lock()
            .unwrap()
            .record(success);
    }

    pub fn performance_snapshot(&self, provider: Provider, model: &str) -> Option<ModelPerformance> {
        self.performance.get(&Self::descriptor_key(provider, model)).map(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn router() -> ModelRouter {
        let r = ModelRouter::new(RouterConfig::default(), Arc::new(Store::temporary()));
        r.register_provider(Provider::Local, Arc::new(LocalProvider));
        r
    }

    #[test]
    fn select_falls_back_to_local_when_nothing_fits() {
        let r = router();
        let req = Requirements {
            input_tokens: 10_000_000,
            ..Default::default()
        };
        let sel = r.select(&req, OptimizationGoal::Balanced);
        assert_eq!(sel.provider, Provider::Local);
    }

    #[tokio::test]
    async fn execute_falls_back_to_cloud_list_on_local_failure() {
        let r = router();
        r.register_provider(Provider::Local, Arc::new(MockProvider { provider: Provider::Local, fail: true }));
        r.register_provider(Provider::Google, Arc::new(MockProvider { provider: Provider::Google, fail: false }));
        let selection = Selection {
            provider: Provider::Local,
            model: "phi-2".to_string(),
            score: 0.5,
            reason: "test".to_string(),
        };
        let request = LlmRequest {
            prompt: "hi".to_string(),
            system_prompt: None,
            max_tokens: 100,
            temperature: 0.7,
            top_p: 1.0,
            stop: vec![],
            history: vec![],
        };
        let response = r.execute(&selection, &request).await.unwrap();
        assert_eq!(response.provider, Provider::Google);
    }

    #[test]
    fn quality_blend_matches_complexity_table() {
        let c = CapabilityAxes { reasoning: 0.9, breadth: 0.5, code: 0.0, creativity: 0.0 };
        assert_eq!(quality_score(&c, TaskComplexity::Trivial), 1.0);
        assert_eq!(quality_score(&c, TaskComplexity::Expert), 0.5);
    }
}
