//! Agency Retention Index: tracks whether assisted task completion is
//! preserving or eroding the user's own capability over time. Alert
//! thresholds and the trend algorithm are carried from `agency_monitor.py`.

use crate::config::MonitorConfig;
use crate::persistence::Store;
use crate::types::{AgencySnapshot, AriTrend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

const ARI_PREFIX: &str = "ari/snapshots";

/// A threshold crossing surfaced by [`AriMonitor::alerts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AriAlertKind {
    AgencyDrop,
    LowBhir,
    SkillErosion,
    OverReliance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AriAlert {
    pub kind: AriAlertKind,
    pub request_id: String,
    pub value: f32,
    pub threshold: f32,
    pub timestamp: DateTime<Utc>,
}

/// Window-average floor below which the trend is reported `Critical`
/// regardless of the recent-vs-older comparison.
const TREND_CRITICAL_FLOOR: f32 = -0.2;

pub struct AriMonitor {
    config: MonitorConfig,
    store: std::sync::Arc<Store>,
    lock: Mutex<()>,
}

impl AriMonitor {
    pub fn new(config: MonitorConfig, store: std::sync::Arc<Store>) -> Self {
        Self {
            config,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Persists a snapshot under `user` and returns any alerts it triggers.
    pub fn record(&self, user: &str, snapshot: AgencySnapshot) -> Vec<AriAlert> {
        let _guard = self.lock.lock().unwrap();
        let alerts = self.alerts(&snapshot);
        let key = format!("{}-{}", snapshot.request_id, snapshot.timestamp.timestamp_nanos_opt().unwrap_or(0));
        if let Err(e) = self.store.append_journal(&format!("{ARI_PREFIX}/{user}"), &key, &snapshot) {
            tracing::error!(target: "noesis::monitor::ari", error = %e, "failed to persist agency snapshot");
        }
        alerts
    }

    fn alerts(&self, snapshot: &AgencySnapshot) -> Vec<AriAlert> {
        let mut out = Vec::new();
        let ts = snapshot.timestamp;
        let rid = snapshot.request_id.clone();

        if snapshot.delta_agency < self.config.delta_agency_alert_threshold {
            out.push(AriAlert {
                kind: AriAlertKind::AgencyDrop,
                request_id: rid.clone(),
                value: snapshot.delta_agency,
                threshold: self.config.delta_agency_alert_threshold,
                timestamp: ts,
            });
        }
        if snapshot.bhir < self.config.bhir_alert_threshold {
            out.push(AriAlert {
                kind: AriAlertKind::LowBhir,
                request_id: rid.clone(),
                value: snapshot.bhir,
                threshold: self.config.bhir_alert_threshold,
                timestamp: ts,
            });
        }
        let skill_delta = snapshot.post_skill - snapshot.pre_skill;
        if skill_delta < self.config.skill_delta_alert_threshold {
            out.push(AriAlert {
                kind: AriAlertKind::SkillErosion,
                request_id: rid.clone(),
                value: skill_delta,
                threshold: self.config.skill_delta_alert_threshold,
                timestamp: ts,
            });
        }
        if snapshot.ai_reliance > self.config.reliance_alert_threshold {
            out.push(AriAlert {
                kind: AriAlertKind::OverReliance,
                request_id: rid,
                value: snapshot.ai_reliance,
                threshold: self.config.reliance_alert_threshold,
                timestamp: ts,
            });
        }
        out
    }

    /// Snapshot history for a user, oldest first.
    pub fn history(&self, user: &str) -> Vec<AgencySnapshot> {
        let mut snapshots: Vec<AgencySnapshot> = self
            .store
            .read_journal(&format!("{ARI_PREFIX}/{user}"))
            .unwrap_or_default();
        snapshots.sort_by_key(|s| s.timestamp);
        snapshots
    }

    /// Trend over a user's snapshot history (§4.6 ARI trend): splits into an
    /// older third and a recent third and compares their mean `delta_agency`.
    /// Overridden to `Critical` if the whole window's mean is below
    /// [`TREND_CRITICAL_FLOOR`], independent of the recent/older comparison.
    pub fn trend(&self, user: &str) -> AriTrend {
        let history = self.history(user);
        compute_trend(&history)
    }
}

fn mean(snapshots: &[AgencySnapshot]) -> f32 {
    if snapshots.is_empty() {
        return 0.0;
    }
    snapshots.iter().map(|s| s.delta_agency).sum::<f32>() / snapshots.len() as f32
}

fn compute_trend(history: &[AgencySnapshot]) -> AriTrend {
    if history.len() < 3 {
        return AriTrend::Stable;
    }
    let window_avg = mean(history);
    if window_avg < TREND_CRITICAL_FLOOR {
        return AriTrend::Critical;
    }
    let n = history.len();
    let third = (n / 3).max(1);
    let older_avg = mean(&history[..third]);
    let recent_avg = mean(&history[n - third..]);
    if recent_avg < older_avg - f32::EPSILON {
        AriTrend::Decreasing
    } else if recent_avg > older_avg + f32::EPSILON {
        AriTrend::Increasing
    } else {
        AriTrend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn snapshot(request_id: &str, delta_agency: f32, ts_offset_secs: i64) -> AgencySnapshot {
        AgencySnapshot {
            timestamp: Utc::now() + chrono::Duration::seconds(ts_offset_secs),
            request_id: request_id.to_string(),
            task_category: "writing".to_string(),
            delta_agency,
            bhir: 0.9,
            task_efficacy: 0.8,
            pre_skill: 0.5,
            post_skill: 0.5,
            ai_reliance: 0.3,
            autonomy_retention: 0.9,
            metadata: HashMap::new(),
        }
    }

    fn monitor() -> AriMonitor {
        AriMonitor::new(MonitorConfig::default(), Arc::new(Store::temporary()))
    }

    #[test]
    fn agency_drop_triggers_alert() {
        let m = monitor();
        let alerts = m.record("alice", snapshot("r1", -0.2, 0));
        assert!(alerts.iter().any(|a| a.kind == AriAlertKind::AgencyDrop));
    }

    #[test]
    fn reliance_over_threshold_triggers_alert() {
        let m = monitor();
        let mut s = snapshot("r2", 0.0, 0);
        s.ai_reliance = 0.95;
        let alerts = m.record("alice", s);
        assert!(alerts.iter().any(|a| a.kind == AriAlertKind::OverReliance));
    }

    #[test]
    fn trend_decreasing_when_recent_lower_than_older() {
        let history = vec![
            snapshot("a", 0.3, -300),
            snapshot("b", 0.3, -200),
            snapshot("c", -0.05, -100),
            snapshot("d", -0.05, -50),
            snapshot("e", -0.05, 0),
        ];
        assert_eq!(compute_trend(&history), AriTrend::Decreasing);
    }

    #[test]
    fn trend_critical_when_window_average_collapses() {
        let history = vec![
            snapshot("a", -0.3, -200),
            snapshot("b", -0.3, -100),
            snapshot("c", -0.3, 0),
        ];
        assert_eq!(compute_trend(&history), AriTrend::Critical);
    }

    #[test]
    fn short_history_is_stable() {
        let history = vec![snapshot("a", -0.9, 0)];
        assert_eq!(compute_trend(&history), AriTrend::Stable);
    }
}
