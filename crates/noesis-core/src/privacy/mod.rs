//! Privacy Engine (component #2): PII detection + action, per-user
//! differential-privacy budget, and a consent ledger. Regex patterns and
//! budget/consent semantics are grounded on `advanced_privacy.py`; only the
//! minimal detected kind set the source actually pattern-matches (email,
//! phone, ssn, credit-card, ip) is auto-detected — see SPEC_FULL §4.2.

use crate::config::PrivacyConfig;
use crate::error::PrivacyError;
use crate::persistence::Store;
use crate::types::{ConsentLevel, ConsentRecord, PiiAction, PiiKind, PiiMatch, PrivacyBudget, Sensitivity};
use crate::hashing::sha256_hex;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Mutex;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap());
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\b").unwrap());

fn sensitivity_of(kind: PiiKind) -> Sensitivity {
    match kind {
        PiiKind::Ssn | PiiKind::CreditCard | PiiKind::Biometric | PiiKind::Medical => Sensitivity::High,
        PiiKind::Email | PiiKind::Phone | PiiKind::Dob | PiiKind::Financial => Sensitivity::Medium,
        PiiKind::Name | PiiKind::Address | PiiKind::Ip | PiiKind::Location => Sensitivity::Low,
    }
}

/// The Privacy Engine. Holds its own budget/consent state behind a mutex
/// (single-writer-per-component, §5) backed by [`Store`].
pub struct PrivacyEngine {
    config: PrivacyConfig,
    store: std::sync::Arc<Store>,
    lock: Mutex<()>,
}

const BUDGET_PREFIX: &str = "privacy/budgets";
const CONSENT_PREFIX: &str = "privacy/consent";
const CONSENT_AUDIT_PREFIX: &str = "privacy/consent_audit";

impl PrivacyEngine {
    pub fn new(config: PrivacyConfig, store: std::sync::Arc<Store>) -> Self {
        Self {
            config,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Detects PII spans in `text`. Only the source's validated regex
    /// families are matched (SPEC_FULL §4.2, resolving Open Question 1).
    pub fn detect(&self, text: &str) -> Vec<PiiMatch> {
        let mut out = Vec::new();
        for m in EMAIL_RE.find_iter(text) {
            out.push(pii(PiiKind::Email, m.range(), 0.95));
        }
        for m in SSN_RE.find_iter(text) {
            out.push(pii(PiiKind::Ssn, m.range(), 0.9));
        }
        for m in CREDIT_CARD_RE.find_iter(text) {
            out.push(pii(PiiKind::CreditCard, m.range(), 0.7));
        }
        for m in PHONE_RE.find_iter(text) {
            out.push(pii(PiiKind::Phone, m.range(), 0.75));
        }
        for m in IP_RE.find_iter(text) {
            out.push(pii(PiiKind::Ip, m.range(), 0.8));
        }
        out.sort_by_key(|p| p.span.0);
        out
    }

    /// Applies `action` to every detected PII span in `text`, returning the
    /// transformed text and the detection list. `action == Block` returns
    /// the original text unchanged; callers must check `detect()` first if
    /// they need to refuse the request outright (see [`PrivacyError::Blocked`]).
    pub fn apply(&self, text: &str, action: PiiAction) -> (String, Vec<PiiMatch>) {
        let matches = self.detect(text);
        if matches.is_empty() || action == PiiAction::Block {
            return (text.to_string(), matches);
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in &matches {
            out.push_str(&text[last..m.span.0]);
            let original = &text[m.span.0..m.span.1];
            out.push_str(&redacted_form(original, m.kind, action));
            last = m.span.1;
        }
        out.push_str(&text[last..]);
        (out, matches)
    }

    fn load_budget(&self, user: &str) -> PrivacyBudget {
        self.store
            .get_json(&format!("{BUDGET_PREFIX}/{user}"))
            .ok()
            .flatten()
            .unwrap_or_else(|| PrivacyBudget {
                user_id: user.to_string(),
                epsilon_spent: 0.0,
                epsilon_cap: self.config.default_epsilon_cap,
                query_count: 0,
                query_cap: self.config.default_query_cap,
                last_reset: Utc::now(),
                exceeded: false,
            })
    }

    /// Checks whether charging `epsilon_cost` would exceed the user's
    /// budget; if not, charges it and persists. Rolls the counters over on a
    /// day boundary before checking (§4.2).
    pub fn check_and_charge(&self, user: &str, epsilon_cost: f64) -> Result<bool, PrivacyError> {
        let _guard = self.lock.lock().unwrap();
        let mut budget = self.load_budget(user);

        if Utc::now() - budget.last_reset >= Duration::days(1) {
            budget.epsilon_spent = 0.0;
            budget.query_count = 0;
            budget.last_reset = Utc::now();
            budget.exceeded = false;
        }

        let would_epsilon = budget.epsilon_spent + epsilon_cost;
        let would_queries = budget.query_count + 1;
        if would_epsilon > budget.epsilon_cap || would_queries > budget.query_cap {
            budget.exceeded = true;
            self.persist_budget(&budget);
            return Ok(false);
        }

        budget.epsilon_spent = would_epsilon;
        budget.query_count = would_queries;
        self.persist_budget(&budget);
        Ok(true)
    }

    fn persist_budget(&self, budget: &PrivacyBudget) {
        if let Err(e) = self
            .store
            .put_json(&format!("{BUDGET_PREFIX}/{}", budget.user_id), budget)
        {
            tracing::error!(target: "noesis::privacy", error = %e, "failed to persist privacy budget");
        }
    }

    pub fn budget_snapshot(&self, user: &str) -> PrivacyBudget {
        self.load_budget(user)
    }

    /// Records a consent decision. Every write appends an audit entry
    /// (§3 "writes produce an appended audit entry").
    pub fn record_consent(&self, record: ConsentRecord) -> Result<(), PrivacyError> {
        let _guard = self.lock.lock().unwrap();
        let audit_id = format!("{}-{}", record.user_id, Utc::now().timestamp_nanos_opt().unwrap_or(0));
        self.store
            .append_journal(CONSENT_AUDIT_PREFIX, &audit_id, &record)
            .map_err(|_| PrivacyError::ConsentDenied {
                user: record.user_id.clone(),
                permission: "persist".to_string(),
            })?;
        self.store
            .put_json(&format!("{CONSENT_PREFIX}/{}", record.user_id), &record)
            .map_err(|_| PrivacyError::ConsentDenied {
                user: record.user_id.clone(),
                permission: "persist".to_string(),
            })
    }

    fn load_consent(&self, user: &str) -> ConsentRecord {
        self.store
            .get_json(&format!("{CONSENT_PREFIX}/{user}"))
            .ok()
            .flatten()
            .unwrap_or_else(|| ConsentRecord {
                user_id: user.to_string(),
                level: ConsentLevel::None,
                store: false,
                analytics: false,
                personalize: false,
                share: false,
                granted_at: Utc::now(),
                expires_at: None,
                version: "0".to_string(),
            })
    }

    /// Returns whether `permission` (one of `store`/`analytics`/`personalize`/`share`)
    /// is currently granted for `user`.
    pub fn consent_allows(&self, user: &str, permission: &str) -> bool {
        let record = self.load_consent(user);
        if let Some(expiry) = record.expires_at {
            if expiry < Utc::now() {
                return false;
            }
        }
        match permission {
            "store" => record.store,
            "analytics" => record.analytics,
            "personalize" => record.personalize,
            "share" => record.share,
            _ => false,
        }
    }

    /// Data minimization: strips any field of `data` not in the necessary
    /// set for the user's consent level — only `store`-permitted data is
    /// retained at all; everything else collapses to `null`.
    pub fn minimize(&self, user: &str, data: serde_json::Value) -> serde_json::Value {
        if !self.consent_allows(user, "store") {
            return serde_json::Value::Null;
        }
        const NECESSARY_FIELDS: &[&str] = &["content", "kind", "priority", "tags", "timestamp"];
        match data {
            serde_json::Value::Object(map) => {
                let minimized: serde_json::Map<String, serde_json::Value> = map
                    .into_iter()
                    .filter(|(k, _)| NECESSARY_FIELDS.contains(&k.as_str()))
                    .collect();
                serde_json::Value::Object(minimized)
            }
            other => other,
        }
    }
}

fn pii(kind: PiiKind, span: std::ops::Range<usize>, confidence: f32) -> PiiMatch {
    PiiMatch {
        kind,
        span: (span.start, span.end),
        confidence,
        sensitivity: sensitivity_of(kind),
    }
}

fn redacted_form(original: &str, kind: PiiKind, action: PiiAction) -> String {
    match action {
        PiiAction::Redact => "[REDACTED]".to_string(),
        PiiAction::Mask => mask_preserving_format(original),
        PiiAction::Hash => format!("[HASH:{}]", &sha256_hex(original)[..16]),
        PiiAction::Tokenize => format!("[TOKEN:{:?}:{}]", kind, &sha256_hex(original)[..8]),
        PiiAction::Block => original.to_string(),
    }
}

fn mask_preserving_format(original: &str) -> String {
    original
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { '*' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn engine() -> PrivacyEngine {
        PrivacyEngine::new(PrivacyConfig::default(), Arc::new(Store::temporary()))
    }

    #[test]
    fn detects_ssn() {
        let e = engine();
        let matches = e.detect("My SSN is 123-45-6789");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, PiiKind::Ssn);
    }

    #[test]
    fn redact_replaces_with_marker() {
        let e = engine();
        let (text, matches) = e.apply("My SSN is 123-45-6789", PiiAction::Redact);
        assert_eq!(matches.len(), 1);
        assert!(text.contains("[REDACTED]"));
        assert!(!text.contains("123-45-6789"));
    }

    #[test]
    fn budget_exhaustion_rejects() {
        let e = PrivacyEngine::new(
            PrivacyConfig {
                default_epsilon_cap: 0.05,
                ..PrivacyConfig::default()
            },
            Arc::new(Store::temporary()),
        );
        let first = e.check_and_charge("alice", 0.1).unwrap();
        assert!(!first);
    }

    #[test]
    fn budget_charges_until_cap() {
        let e = PrivacyEngine::new(
            PrivacyConfig {
                default_epsilon_cap: 0.25,
                query_epsilon_cost: 0.1,
                ..PrivacyConfig::default()
            },
            Arc::new(Store::temporary()),
        );
        assert!(e.check_and_charge("bob", 0.1).unwrap());
        assert!(e.check_and_charge("bob", 0.1).unwrap());
        assert!(!e.check_and_charge("bob", 0.1).unwrap());
    }

    #[test]
    fn consent_denied_by_default() {
        let e = engine();
        assert!(!e.consent_allows("carol", "analytics"));
    }

    #[test]
    fn consent_recorded_and_checked() {
        let e = engine();
        e.record_consent(ConsentRecord {
            user_id: "dave".to_string(),
            level: ConsentLevel::Standard,
            store: true,
            analytics: false,
            personalize: true,
            share: false,
            granted_at: Utc::now(),
            expires_at: None,
            version: "1".to_string(),
        })
        .unwrap();
        assert!(e.consent_allows("dave", "store"));
        assert!(!e.consent_allows("dave", "analytics"));
    }
}
