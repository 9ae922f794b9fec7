//! Reliance/Dependency Index: tracks how dependent a user's queries are
//! becoming on the assistant across three independent dimensions. Hard
//! invariant (SPEC_FULL §4.6, resolving the RDI Open Question): the raw
//! continuous score never crosses the module boundary as `pub` — only a
//! coarse, hashed, opt-in export is reachable from outside this module.
//! Sub-score definitions and bucket thresholds are carried from
//! `dependency_monitor.py`.

use crate::config::MonitorConfig;
use crate::hashing::sha256_hex;
use crate::persistence::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

const RDI_PREFIX: &str = "monitor/rdi";

/// The three independent inputs combined into the reliance score: how much
/// the user leans on the assistant to *formulate* queries, to *verify*
/// answers, and to *decide* between options, rather than doing so itself.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RdiInputs {
    pub query_formulation_dependency: f32,
    pub verification_dependency: f32,
    pub decision_dependency: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RdiLevel {
    Aligned,
    Minor,
    Moderate,
    Significant,
    Critical,
}

fn bucket(score: f32) -> RdiLevel {
    if score < 0.2 {
        RdiLevel::Aligned
    } else if score < 0.4 {
        RdiLevel::Minor
    } else if score < 0.6 {
        RdiLevel::Moderate
    } else if score < 0.8 {
        RdiLevel::Significant
    } else {
        RdiLevel::Critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RdiRecord {
    score: f32,
    timestamp: DateTime<Utc>,
}

/// The hashed, aggregated, user-opt-in export. Carries no per-query detail
/// and no raw continuous score — only a coarse level bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRdi {
    pub user_id_hash: String,
    pub level: RdiLevel,
    pub sample_count: usize,
    pub exported_at: DateTime<Utc>,
}

pub struct RdiMonitor {
    config: MonitorConfig,
    store: std::sync::Arc<Store>,
    lock: Mutex<()>,
}

impl RdiMonitor {
    pub fn new(config: MonitorConfig, store: std::sync::Arc<Store>) -> Self {
        Self {
            config,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Weighted mean of the three sub-scores, normalized against the
    /// configured weights even if they don't sum to 1.0. Never exposed
    /// directly outside this module.
    fn score(&self, inputs: &RdiInputs) -> f32 {
        let (wq, wv, wd) = self.config.rdi_weights;
        let total_weight = (wq + wv + wd).max(f32::EPSILON);
        (wq * inputs.query_formulation_dependency
            + wv * inputs.verification_dependency
            + wd * inputs.decision_dependency)
            / total_weight
    }

    /// Records one assessment and returns only its coarse bucket — the raw
    /// score is persisted to the on-device store for internal trending but
    /// is never returned from this call.
    pub fn assess(&self, user: &str, inputs: RdiInputs) -> RdiLevel {
        let _guard = self.lock.lock().unwrap();
        let score = self.score(&inputs);
        let record = RdiRecord { score, timestamp: Utc::now() };
        let key = format!("{}", record.timestamp.timestamp_nanos_opt().unwrap_or(0));
        if let Err(e) = self.store.append_journal(&format!("{RDI_PREFIX}/{user}"), &key, &record) {
            tracing::error!(target: "noesis::monitor::rdi", error = %e, "failed to persist reliance record");
        }
        bucket(score)
    }

    /// Opt-in export: aggregates all on-device history for `user` into one
    /// hashed, bucketed summary. Returns `None` unless the caller has
    /// affirmatively opted in — this is the *only* path by which anything
    /// derived from the reliance score is allowed to leave the device.
    pub fn export_opt_in(&self, user: &str, opted_in: bool) -> Option<ExportedRdi> {
        if !opted_in {
            return None;
        }
        let records: Vec<RdiRecord> = self
            .store
            .read_journal(&format!("{RDI_PREFIX}/{user}"))
            .unwrap_or_default();
        if records.is_empty() {
            return None;
        }
        let avg = records.iter().map(|r| r.score).sum::<f32>() / records.len() as f32;
        Some(ExportedRdi {
            user_id_hash: sha256_hex(user)[..16].to_string(),
            level: bucket(avg),
            sample_count: records.len(),
            exported_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn monitor() -> RdiMonitor {
        RdiMonitor::new(MonitorConfig::default(), Arc::new(Store::temporary()))
    }

    #[test]
    fn high_dependency_inputs_bucket_high_or_severe() {
        let m = monitor();
        let level = m.assess(
            "alice",
            RdiInputs {
                query_formulation_dependency: 0.95,
                verification_dependency: 0.9,
                decision_dependency: 0.92,
            },
        );
        assert!(matches!(level, RdiLevel::Significant | RdiLevel::Critical));
    }

    #[test]
    fn export_requires_opt_in() {
        let m = monitor();
        m.assess("bob", RdiInputs { query_formulation_dependency: 0.5, verification_dependency: 0.5, decision_dependency: 0.5 });
        assert!(m.export_opt_in("bob", false).is_none());
        let exported = m.export_opt_in("bob", true).unwrap();
        assert_eq!(exported.sample_count, 1);
        assert_ne!(exported.user_id_hash, "bob");
    }

    #[test]
    fn export_without_history_is_none() {
        let m = monitor();
        assert!(m.export_opt_in("nobody", true).is_none());
    }
}
