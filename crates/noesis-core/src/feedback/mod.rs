//! Self-Improvement Loop (component #7): accumulates feedback per
//! component, and once a rolling window holds enough negative signal,
//! proposes a concrete, confidence-scored corrective action. Thresholds
//! and the confidence formula are carried from `self_improvement.py`.

use crate::bus::EventBus;
use crate::config::FeedbackConfig;
use crate::persistence::Store;
use crate::types::{ActionKind, FeedbackEvent, FeedbackKind, ImprovementSuggestion};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const EVENT_PREFIX: &str = "feedback/events";
const SUGGESTION_PREFIX: &str = "feedback/suggestions";

pub struct FeedbackLoop {
    config: FeedbackConfig,
    store: std::sync::Arc<Store>,
    bus: Option<EventBus>,
    lock: Mutex<()>,
}

impl FeedbackLoop {
    pub fn new(config: FeedbackConfig, store: std::sync::Arc<Store>) -> Self {
        Self {
            config,
            store,
            bus: None,
            lock: Mutex::new(()),
        }
    }

    /// Same as [`FeedbackLoop::new`], but every recorded event is also
    /// published on `bus` — the wiring the gateway uses to expose the
    /// subscription half of the Core→collaborator API (§6).
    pub fn with_bus(config: FeedbackConfig, store: std::sync::Arc<Store>, bus: EventBus) -> Self {
        Self {
            config,
            store,
            bus: Some(bus),
            lock: Mutex::new(()),
        }
    }

    /// Records one feedback event, indexed by its source component, and
    /// publishes it to the event bus if one is attached.
    pub fn record(&self, event: FeedbackEvent) {
        let _guard = self.lock.lock().unwrap();
        let key = format!("{}-{}", event.source_component, event.id);
        if let Err(e) = self.store.append_journal(EVENT_PREFIX, &key, &event) {
            tracing::error!(target: "noesis::feedback", error = %e, "failed to persist feedback event");
        }
        if let Some(bus) = &self.bus {
            bus.publish(&event);
        }
    }

    fn events_for_component(&self, component: &str) -> Vec<FeedbackEvent> {
        let cutoff = Utc::now() - Duration::days(self.config.rolling_window_days);
        self.store
            .read_journal::<FeedbackEvent>(EVENT_PREFIX)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.source_component == component && e.timestamp >= cutoff)
            .collect()
    }

    /// Analyzes `component`'s rolling-window feedback and proposes a
    /// corrective action once the negative ratio crosses the configured
    /// threshold with enough volume to be meaningful. Returns `None` if
    /// there isn't enough signal yet.
    pub fn analyze(&self, component: &str) -> Option<ImprovementSuggestion> {
        let _guard = self.lock.lock().unwrap();
        let events = self.events_for_component(component);
        if (events.len() as u32) < self.config.min_feedback_for_suggestion {
            return None;
        }

        let negative: Vec<&FeedbackEvent> = events.iter().filter(|e| e.kind.is_negative()).collect();
        let ratio = negative.len() as f32 / events.len() as f32;
        if ratio <= self.config.negative_ratio_threshold {
            return None;
        }

        let confidence = 0.7 * ratio + 0.3 * (negative.len() as f32 / 20.0).min(1.0);
        let majority_kind = majority_negative_kind(&negative);
        let action = action_for_kind(majority_kind);
        let approved = confidence >= self.config.auto_implement_threshold;

        let suggestion = ImprovementSuggestion {
            id: format!("{component}-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            action,
            target_component: component.to_string(),
            description: format!(
                "{:.0}% of the last {} feedback events for {component} were negative, dominated by {:?}",
                ratio * 100.0,
                events.len(),
                majority_kind
            ),
            rationale: format!("negative ratio {ratio:.2} exceeds threshold {:.2}", self.config.negative_ratio_threshold),
            confidence,
            supporting_feedback_ids: negative.iter().map(|e| e.id.clone()).collect(),
            approved,
            implemented: approved,
        };
        self.persist_suggestion(&suggestion);
        Some(suggestion)
    }

    fn persist_suggestion(&self, suggestion: &ImprovementSuggestion) {
        if let Err(e) = self.store.append_journal(SUGGESTION_PREFIX, &suggestion.id, suggestion) {
            tracing::error!(target: "noesis::feedback", error = %e, "failed to persist improvement suggestion");
        }
    }

    pub fn suggestions_for(&self, component: &str) -> Vec<ImprovementSuggestion> {
        self.store
            .read_journal::<ImprovementSuggestion>(SUGGESTION_PREFIX)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.target_component == component)
            .collect()
    }
}

fn majority_negative_kind(negative: &[&FeedbackEvent]) -> FeedbackKind {
    let mut counts: HashMap<FeedbackKindKey, u32> = HashMap::new();
    for e in negative {
        *counts.entry(FeedbackKindKey(e.kind)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(k, _)| k.0)
        .unwrap_or(FeedbackKind::UserImplicitNegative)
}

/// `FeedbackKind` isn't `Hash`; wrap it for the majority-vote tally.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FeedbackKindKey(FeedbackKind);

impl std::hash::Hash for FeedbackKindKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.0 as u8).hash(state);
    }
}

/// Action-kind selection by majority evidence (§4.7): a gate violation
/// calls for a behavior change, an ARI alert for a parameter adjustment, an
/// EDM alert for prompt refinement; anything else defaults to a parameter
/// adjustment as the least disruptive corrective action.
fn action_for_kind(kind: FeedbackKind) -> ActionKind {
    match kind {
        FeedbackKind::GateViolation => ActionKind::BehaviorChange,
        FeedbackKind::AriAlert => ActionKind::ParameterAdjustment,
        FeedbackKind::EdmAlert => ActionKind::PromptRefinement,
        _ => ActionKind::ParameterAdjustment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn feedback_event(component: &str, kind: FeedbackKind, id: &str) -> FeedbackEvent {
        FeedbackEvent {
            id: id.to_string(),
            timestamp: Utc::now(),
            kind,
            source_component: component.to_string(),
            request_id: None,
            user_id: None,
            rating: None,
            free_text: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn not_enough_volume_returns_none() {
        let fb = FeedbackLoop::new(FeedbackConfig::default(), Arc::new(Store::temporary()));
        fb.record(feedback_event("router", FeedbackKind::GateViolation, "1"));
        assert!(fb.analyze("router").is_none());
    }

    #[test]
    fn high_negative_ratio_proposes_behavior_change() {
        let fb = FeedbackLoop::new(FeedbackConfig::default(), Arc::new(Store::temporary()));
        for i in 0..6 {
            fb.record(feedback_event("gates", FeedbackKind::GateViolation, &i.to_string()));
        }
        let suggestion = fb.analyze("gates").unwrap();
        assert_eq!(suggestion.action, ActionKind::BehaviorChange);
    }

    #[test]
    fn low_negative_ratio_returns_none() {
        let fb = FeedbackLoop::new(FeedbackConfig::default(), Arc::new(Store::temporary()));
        for i in 0..5 {
            fb.record(feedback_event("router", FeedbackKind::UserExplicitPositive, &i.to_string()));
        }
        fb.record(feedback_event("router", FeedbackKind::UserExplicitNegative, "5"));
        assert!(fb.analyze("router").is_none());
    }
}
