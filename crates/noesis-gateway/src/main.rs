//! noesis-gateway: the concrete realization of the Core→collaborator API
//! (component #10) — a read-only query surface plus an SSE event feed for
//! external collaborators (the dashboard renderer, the FFE/personality
//! plug-in, and any other out-of-scope consumer named in spec.md §1). This
//! binary owns process bootstrap (config, tracing, the orchestrator's
//! concrete provider wiring); it holds no business logic of its own beyond
//! translating HTTP requests onto `noesis_core` operations.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use noesis_core::{
    ActionContext, AriMonitor, Config, ContextStore, EdmMonitor, EventBus, FeedbackLoop, GateSystem, LocalProvider,
    ModelRouter, MockProvider, Orchestrator, OptimizationGoal, PiiAction, PrivacyEngine, ProcessInputs, Provider,
    RdiInputs, RdiMonitor, Request, Requirements, Store,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AppState {
    store: Arc<Store>,
    orchestrator: Orchestrator,
    ari: AriMonitor,
    privacy: PrivacyEngine,
    context: ContextStore,
    bus: EventBus,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let file_appender = tracing_appender::rolling::daily("./logs", "noesis-gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(target: "noesis::gateway", error = %e, "failed to load config, using defaults");
        Config::default()
    });

    let state = Arc::new(build_state(&config));

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/memories", get(get_memories))
        .route("/v1/ari/:user", get(get_ari))
        .route("/v1/budget/:user", get(get_budget))
        .route("/v1/requests", post(submit_request))
        .route("/v1/events", get(events_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], 8088));
    tracing::info!(target: "noesis::gateway", %addr, "noesis-gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind gateway listener");
    axum::serve(listener, app).await.expect("gateway server crashed");
}

/// Every stateful component shares the same `Arc<Store>` handle (§2
/// "constructed with a shared `Arc<persistence::Store>` handle"). The
/// gateway keeps its own `AriMonitor`/`PrivacyEngine`/`ContextStore`
/// instances for read-only projections, separate from the ones the
/// orchestrator mutates — both read the same durable state, and only the
/// orchestrator's instances ever write (Design Notes "read-only back-
/// reference handles").
fn build_state(config: &Config) -> AppState {
    let store = Arc::new(Store::open(config.data_dir_path()).unwrap_or_else(|e| {
        tracing::error!(target: "noesis::gateway", error = %e, "failed to open data directory, falling back to in-process store");
        panic!("cannot continue without a durable store: {e}");
    }));
    let bus = EventBus::new();

    let privacy = PrivacyEngine::new(config.privacy.clone(), store.clone());
    let context = ContextStore::new(store.clone());
    let gates = GateSystem::new(config.gates.clone(), store.clone());
    let router = ModelRouter::new(config.router.clone(), store.clone());
    router.register_provider(Provider::Local, Arc::new(LocalProvider));
    if config.llm_mode == "mock" {
        router.register_provider(Provider::Google, Arc::new(MockProvider { provider: Provider::Google, fail: false }));
        router.register_provider(Provider::Anthropic, Arc::new(MockProvider { provider: Provider::Anthropic, fail: false }));
        router.register_provider(Provider::Openai, Arc::new(MockProvider { provider: Provider::Openai, fail: false }));
    }
    let ari = AriMonitor::new(config.monitor.clone(), store.clone());
    let edm = EdmMonitor::with_default_checkers(
        config.monitor.clone(),
        store.clone(),
        Duration::from_secs(config.router.fact_check_timeout_s),
    );
    let rdi = RdiMonitor::new(config.monitor.clone(), store.clone());
    let feedback = FeedbackLoop::with_bus(config.feedback.clone(), store.clone(), bus.clone());

    let orchestrator = Orchestrator::new(
        store.clone(),
        PrivacyEngine::new(config.privacy.clone(), store.clone()),
        ContextStore::new(store.clone()),
        gates,
        router,
        AriMonitor::new(config.monitor.clone(), store.clone()),
        edm,
        rdi,
        feedback,
    );

    AppState { store, orchestrator, ari, privacy, context, bus }
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
struct MemoriesQuery {
    user: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /v1/memories?user=...&limit=... — read-only Context Store snapshot
/// query (§6 "a read-only snapshot query returning plain data").
async fn get_memories(State(state): State<Arc<AppState>>, Query(q): Query<MemoriesQuery>) -> impl IntoResponse {
    let memories = state.context.search(&q.user, None, None, &[], q.limit, 0.0);
    Json(serde_json::json!({ "user": q.user, "memories": memories }))
}

/// GET /v1/ari/:user — ARI report: trend plus recent snapshot history.
async fn get_ari(State(state): State<Arc<AppState>>, Path(user): Path<String>) -> impl IntoResponse {
    let history = state.ari.history(&user);
    let trend = state.ari.trend(&user);
    Json(serde_json::json!({
        "user": user,
        "trend": trend,
        "sample_count": history.len(),
        "snapshots": history,
    }))
}

/// GET /v1/budget/:user — Privacy Budget snapshot.
async fn get_budget(State(state): State<Arc<AppState>>, Path(user): Path<String>) -> impl IntoResponse {
    Json(state.privacy.budget_snapshot(&user))
}

#[derive(Deserialize)]
struct SubmitRequestBody {
    user_id: String,
    session_id: String,
    task_category: String,
    query: String,
    #[serde(default)]
    requirements: Requirements,
    #[serde(default = "default_goal")]
    goal: OptimizationGoal,
    #[serde(default = "default_epsilon_cost")]
    epsilon_cost: f64,
    #[serde(default = "default_pii_action")]
    pii_action: PiiAction,
    #[serde(default)]
    action_context: ActionContext,
    #[serde(default)]
    rdi_inputs: RdiInputs,
    #[serde(default)]
    pre_skill: f32,
    #[serde(default)]
    post_skill: f32,
    #[serde(default = "default_task_efficacy")]
    task_efficacy: f32,
    #[serde(default)]
    ai_reliance: f32,
    #[serde(default = "default_autonomy_retention")]
    autonomy_retention: f32,
}

fn default_goal() -> OptimizationGoal {
    OptimizationGoal::Balanced
}

fn default_epsilon_cost() -> f64 {
    0.1
}

fn default_pii_action() -> PiiAction {
    PiiAction::Redact
}

fn default_task_efficacy() -> f32 {
    0.8
}

fn default_autonomy_retention() -> f32 {
    0.8
}

/// POST /v1/requests — submits a request to the orchestrator's `process`
/// operation and returns the frozen `Request` record (§6 "a mutation
/// operation set from §4").
async fn submit_request(State(state): State<Arc<AppState>>, Json(body): Json<SubmitRequestBody>) -> impl IntoResponse {
    let request = Request::new(uuid::Uuid::new_v4().to_string(), &body.user_id, &body.session_id, &body.task_category, &body.query);
    let inputs = ProcessInputs {
        action_context: body.action_context,
        requirements: body.requirements,
        goal: body.goal,
        epsilon_cost: body.epsilon_cost,
        pii_action: body.pii_action,
        rdi_inputs: body.rdi_inputs,
        pre_skill: body.pre_skill,
        post_skill: body.post_skill,
        task_efficacy: body.task_efficacy,
        ai_reliance: body.ai_reliance,
        autonomy_retention: body.autonomy_retention,
    };
    let result = state.orchestrator.process(request, inputs).await;
    let _ = state.store.flush();
    Json(result)
}

/// GET /v1/events — Server-Sent-Events stream of the subscription feed
/// (feedback, gate-violation, ARI-alert, EDM-detection). RDI-private is
/// never emitted here — the RDI hard invariant (§4.6) keeps that module's
/// score off every channel but its own opt-in export.
async fn events_stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    use async_stream::stream;
    let mut rx = state.bus.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok(Event::default().json_data(&event).unwrap_or_else(|_| Event::default())),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(target: "noesis::gateway", dropped = n, "event stream subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_returns_ok() {
        assert_eq!(health().await, "OK");
    }

    #[test]
    fn build_state_wires_every_component_to_the_same_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let state = build_state(&config);
        assert!(Arc::strong_count(&state.store) >= 1);
    }
}
