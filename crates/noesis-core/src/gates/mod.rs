//! Gate System + Tribunal (component #5): scores each request on four
//! invariants and routes failures to arbitration. Thresholds and per-gate
//! scoring formulas are carried from `original_source`'s `gate_system.py`
//! `GATE_THRESHOLDS` and per-gate `evaluate_*` functions.

use crate::config::GateConfig;
use crate::error::GateError;
use crate::persistence::Store;
use crate::types::GateKind;
use crate::types::GateOutcome;
use std::collections::HashMap;
use std::sync::Mutex;

/// Inputs the gates need about the action under evaluation. Callers (the
/// orchestrator) populate this from the request and its routing decision.
/// `Serialize`/`Deserialize` with an all-defaulting container attribute so
/// the gateway can accept this directly as a JSON request body field.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ActionContext {
    pub delta_agency: f32,
    pub user_approval_required: bool,
    pub reversible: bool,
    pub addictive_features: f32,
    pub dark_patterns: f32,
    pub emotional_manipulation: bool,
    pub time_pressure: bool,
    pub appeal_available: bool,
    pub human_review: bool,
    pub explanation_provided: bool,
    pub audit_trail: bool,
    pub matches_user_values: bool,
    pub matches_system_values: bool,
    pub history_consistent: bool,
    pub transparent_goals: bool,
    pub target_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TribunalVerdict {
    pub approved: bool,
    pub rationale: String,
}

const AUDIT_PREFIX: &str = "gates/audit";

pub struct GateSystem {
    config: GateConfig,
    store: std::sync::Arc<Store>,
    lock: Mutex<()>,
}

impl GateSystem {
    pub fn new(config: GateConfig, store: std::sync::Arc<Store>) -> Self {
        Self {
            config,
            store,
            lock: Mutex::new(()),
        }
    }

    fn autonomy(&self, ctx: &ActionContext) -> GateOutcome {
        let score = 0.5
            + 0.3 * ctx.delta_agency
            + 0.2 * (ctx.user_approval_required as i32 as f32)
            + 0.1 * (ctx.reversible as i32 as f32);
        let approved = ctx.delta_agency >= self.config.autonomy_threshold;
        details(GateKind::Autonomy, approved, score, "delta_agency vs threshold", ctx.delta_agency)
    }

    fn humanity(&self, ctx: &ActionContext) -> GateOutcome {
        let score = 1.0
            - 0.15 * ctx.addictive_features
            - 0.2 * ctx.dark_patterns
            - 0.25 * (ctx.emotional_manipulation as i32 as f32)
            - 0.15 * (ctx.time_pressure as i32 as f32);
        let approved = score >= self.config.humanity_threshold;
        details(GateKind::Humanity, approved, score, "manipulation/addiction indicators", score)
    }

    fn oversight(&self, ctx: &ActionContext) -> GateOutcome {
        let score = 0.3 * (ctx.appeal_available as i32 as f32)
            + 0.3 * (ctx.human_review as i32 as f32)
            + 0.2 * (ctx.explanation_provided as i32 as f32)
            + 0.2 * (ctx.audit_trail as i32 as f32);
        let approved = score >= self.config.oversight_threshold;
        details(GateKind::Oversight, approved, score, "oversight indicators", score)
    }

    fn alignment(&self, ctx: &ActionContext) -> GateOutcome {
        let score = 0.3 * (ctx.matches_user_values as i32 as f32)
            + 0.3 * (ctx.matches_system_values as i32 as f32)
            + 0.2 * (ctx.history_consistent as i32 as f32)
            + 0.2 * (ctx.transparent_goals as i32 as f32);
        let approved = score >= self.config.alignment_threshold;
        details(GateKind::Alignment, approved, score, "alignment indicators", score)
    }

    /// Evaluates all four gates. Also enforces the protected-path invariant
    /// (§4.4): any action targeting a listed protected path is refused
    /// unconditionally, independent of gate scoring.
    pub fn evaluate(&self, ctx: &ActionContext) -> Result<Vec<GateOutcome>, GateError> {
        if let Some(path) = &ctx.target_path {
            if self.config.protected_paths.iter().any(|p| p == path) {
                self.audit("protected_path_refused", path);
                return Err(GateError::ProtectedPath(path.clone()));
            }
        }
        Ok(vec![
            self.autonomy(ctx),
            self.humanity(ctx),
            self.oversight(ctx),
            self.alignment(ctx),
        ])
    }

    fn audit(&self, event: &str, detail: &str) {
        let _guard = self.lock.lock().unwrap();
        let id = format!("{}-{}", event, chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let record = serde_json::json!({ "event": event, "detail": detail, "timestamp": chrono::Utc::now() });
        if let Err(e) = self.store.append_journal(AUDIT_PREFIX, &id, &record) {
            tracing::error!(target: "noesis::gates", error = %e, "failed to write gate audit entry");
        }
    }

    /// The Tribunal (§4.4, resolving Open Question 4): consulted only when
    /// one or more gates failed. Deterministic rule: weighted mean of the
    /// failed gates' own scores against `tribunal_override_threshold`, with
    /// two hard floors — an Autonomy failure with `reversible=false`, or an
    /// Oversight failure with `human_review=false`, can never be overridden.
    /// Always logged to the audit trail; an override is never silent.
    pub fn tribunal_review(
        &self,
        ctx: &ActionContext,
        failed: &[GateOutcome],
    ) -> TribunalVerdict {
        let hard_block = failed.iter().any(|o| {
            (o.gate == GateKind::Autonomy && !ctx.reversible)
                || (o.gate == GateKind::Oversight && !ctx.human_review)
        });

        let verdict = if hard_block {
            TribunalVerdict {
                approved: false,
                rationale: "irreversible or unreviewable action cannot be overridden".to_string(),
            }
        } else {
            let mean: f32 = failed.iter().map(|o| o.score).sum::<f32>() / failed.len().max(1) as f32;
            if mean >= self.config.tribunal_override_threshold {
                TribunalVerdict {
                    approved: true,
                    rationale: format!(
                        "mean failed-gate score {mean:.2} meets override threshold {:.2}",
                        self.config.tribunal_override_threshold
                    ),
                }
            } else {
                TribunalVerdict {
                    approved: false,
                    rationale: format!(
                        "mean failed-gate score {mean:.2} below override threshold {:.2}",
                        self.config.tribunal_override_threshold
                    ),
                }
            }
        };

        self.audit(
            if verdict.approved { "tribunal_override_approved" } else { "tribunal_override_denied" },
            &verdict.rationale,
        );
        verdict
    }
}

fn details(gate: GateKind, approved: bool, score: f32, reason: &str, _aux: f32) -> GateOutcome {
    let mut map = HashMap::new();
    map.insert("raw_score".to_string(), serde_json::json!(score));
    GateOutcome {
        gate,
        approved,
        score,
        reason: reason.to_string(),
        details: map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn system() -> GateSystem {
        GateSystem::new(GateConfig::default(), Arc::new(Store::temporary()))
    }

    #[test]
    fn humanity_gate_fails_on_emotional_manipulation() {
        let gs = system();
        let ctx = ActionContext {
            emotional_manipulation: true,
            time_pressure: true,
            dark_patterns: 1.0,
            ..Default::default()
        };
        let outcomes = gs.evaluate(&ctx).unwrap();
        let humanity = outcomes.iter().find(|o| o.gate == GateKind::Humanity).unwrap();
        assert!(!humanity.approved);
    }

    #[test]
    fn tribunal_denies_irreversible_override() {
        let gs = system();
        let ctx = ActionContext {
            emotional_manipulation: true,
            reversible: false,
            ..Default::default()
        };
        let outcomes = gs.evaluate(&ctx).unwrap();
        let failed: Vec<_> = outcomes.into_iter().filter(|o| !o.approved).collect();
        let verdict = gs.tribunal_review(&ctx, &failed);
        assert!(!verdict.approved);
    }

    #[test]
    fn protected_path_refused_unconditionally() {
        let gs = GateSystem::new(
            GateConfig {
                protected_paths: vec!["/etc/shadow".to_string()],
                ..GateConfig::default()
            },
            Arc::new(Store::temporary()),
        );
        let ctx = ActionContext {
            target_path: Some("/etc/shadow".to_string()),
            ..Default::default()
        };
        assert!(matches!(gs.evaluate(&ctx), Err(GateError::ProtectedPath(_))));
    }
}
