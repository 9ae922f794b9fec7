//! Context Store (component #3): persistent long-term memory with semantic
//! retrieval and token-bounded windowing. Grounded on
//! `enhanced_context.py` — composite relevance weights, decay formula, and
//! memory-id generation are carried verbatim; storage layering (hot
//! cache + durable store) follows the teacher's `MemoryManager` pattern.

use crate::error::ContextError;
use crate::hashing::sha256_hex;
use crate::persistence::Store;
use crate::types::{ContextWindow, MemoryEntry, MemoryKind, MemoryPriority};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const MEMORY_PREFIX: &str = "context/memories";

/// Relevance-decay horizon (§4.3 "configured horizon"). Entries older than
/// this are eligible for batch decay.
fn decay_horizon() -> Duration {
    Duration::days(30)
}

/// Number of unconsolidated entries per user that triggers consolidation.
const CONSOLIDATION_THRESHOLD: usize = 200;

/// Rough token estimate: word count * 1.3, matching the source's
/// non-tiktoken fallback (concrete tokenizer wiring is a transport-level
/// concern out of scope per spec.md §1).
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count() as f32;
    (words * 1.3).ceil() as u32
}

/// Deterministic memory id: a stable digest of (user, content, timestamp)
/// truncated to 16 hex chars, matching `enhanced_context.py`'s id scheme.
pub fn memory_id(user: &str, content: &str, timestamp: DateTime<Utc>) -> String {
    let seed = format!("{user}:{content}:{}", timestamp.timestamp_nanos_opt().unwrap_or(0));
    sha256_hex(&seed)[..16].to_string()
}

pub struct ContextStore {
    store: std::sync::Arc<Store>,
    lock: Mutex<()>,
}

impl ContextStore {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn key(id: &str) -> String {
        format!("{MEMORY_PREFIX}/{id}")
    }

    fn load(&self, id: &str) -> Option<MemoryEntry> {
        self.store.get_json(&Self::key(id)).ok().flatten()
    }

    fn save(&self, entry: &MemoryEntry) {
        if let Err(e) = self.store.put_json(&Self::key(&entry.id), entry) {
            tracing::error!(target: "noesis::context", error = %e, "failed to persist memory entry");
        }
    }

    fn all_for_user(&self, user: &str) -> Vec<MemoryEntry> {
        let keys = self.store.scan_prefix(&format!("{MEMORY_PREFIX}/")).unwrap_or_default();
        keys.into_iter()
            .filter_map(|k| self.store.get_json::<MemoryEntry>(&k).ok().flatten())
            .filter(|e| e.user_id == user)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store_entry(
        &self,
        user: &str,
        session: &str,
        content: &str,
        kind: MemoryKind,
        priority: MemoryPriority,
        tags: Vec<String>,
        parent_id: Option<String>,
        ttl: Option<Duration>,
    ) -> MemoryEntry {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let id = memory_id(user, content, now);
        let entry = MemoryEntry {
            id,
            user_id: user.to_string(),
            session_id: session.to_string(),
            content: content.to_string(),
            vector: None,
            tags,
            kind,
            priority,
            access_count: 0,
            last_accessed: now,
            relevance: 1.0,
            expires_at: ttl.map(|d| now + d),
            parent_id,
            consolidated: false,
            created_at: now,
        };
        self.save(&entry);
        self.maybe_consolidate(user);
        entry
    }

    /// Cosine similarity between two equal-length vectors, or 0.0 if either
    /// is absent/mismatched (falls back to relevance-only ranking).
    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    /// Searches the user's non-expired entries, optionally filtered by kind
    /// and tags, scored by cosine(query_vector, entry_vector) * relevance,
    /// descending, ties broken by recency (§4.3). Accessing updates
    /// `access_count`/`last_accessed`.
    pub fn search(
        &self,
        user: &str,
        query_vector: Option<&[f32]>,
        kind: Option<MemoryKind>,
        tags: &[String],
        limit: usize,
        min_relevance: f32,
    ) -> Vec<MemoryEntry> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let mut candidates: Vec<MemoryEntry> = self
            .all_for_user(user)
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .filter(|e| kind.map(|k| k == e.kind).unwrap_or(true))
            .filter(|e| tags.is_empty() || tags.iter().any(|t| e.tags.contains(t)))
            .filter(|e| e.relevance >= min_relevance)
            .collect();

        candidates.sort_by(|a, b| {
            let sa = score(a, query_vector);
            let sb = score(b, query_vector);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        candidates.truncate(limit);

        for entry in candidates.iter_mut() {
            entry.access_count += 1;
            entry.last_accessed = now;
            self.save(entry);
        }
        candidates
    }

    fn composite_relevance(entry: &MemoryEntry, now: DateTime<Utc>) -> f32 {
        let priority_score = match entry.priority {
            MemoryPriority::Critical => 1.0,
            MemoryPriority::High => 0.8,
            MemoryPriority::Medium => 0.5,
            MemoryPriority::Low => 0.3,
            MemoryPriority::Ephemeral => 0.1,
        };
        let age_days = (now - entry.created_at).num_seconds().max(0) as f32 / 86400.0;
        let recency_score = (1.0 - age_days / 30.0).clamp(0.0, 1.0);
        let access_score = (entry.access_count as f32 / 20.0).clamp(0.0, 1.0);
        let since_access_days = (now - entry.last_accessed).num_seconds().max(0) as f32 / 86400.0;
        let last_access_decay = (1.0 - since_access_days / 14.0).clamp(0.0, 1.0);

        0.4 * priority_score + 0.3 * recency_score + 0.2 * access_score + 0.1 * last_access_decay
    }

    /// Builds a [`ContextWindow`]. If `ids` is given, includes them in order
    /// (pruning if that would overflow `max_tokens`); otherwise ranks the
    /// session's entries by composite relevance and fills until the next
    /// entry would exceed the cap (§4.3).
    pub fn build_window(
        &self,
        user: &str,
        session: &str,
        ids: Option<Vec<String>>,
        max_tokens: u32,
    ) -> Result<ContextWindow, ContextError> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();

        let mut candidates: Vec<MemoryEntry> = match ids {
            Some(explicit) => explicit
                .iter()
                .filter_map(|id| self.load(id))
                .filter(|e| !e.is_expired(now))
                .collect(),
            None => {
                let mut entries: Vec<MemoryEntry> = self
                    .all_for_user(user)
                    .into_iter()
                    .filter(|e| e.session_id == session && !e.is_expired(now))
                    .collect();
                entries.sort_by(|a, b| {
                    Self::composite_relevance(b, now)
                        .partial_cmp(&Self::composite_relevance(a, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                entries
            }
        };

        let mut window_ids = Vec::new();
        let mut total_tokens = 0u32;
        let mut pruned = Vec::new();

        for entry in candidates.drain(..) {
            let tokens = estimate_tokens(&entry.content);
            if total_tokens + tokens > max_tokens {
                continue;
            }
            total_tokens += tokens;
            window_ids.push(entry.id);
        }

        // If nothing fit (e.g. explicit ids all exceed the cap together),
        // attempt pruning: drop lowest-composite-relevance non-critical
        // entries from the candidate list until enough tokens are freed.
        if window_ids.is_empty() {
            let mut scored: Vec<(MemoryEntry, f32)> = Vec::new();
            if let Some(keys) = self.store.scan_prefix(&format!("{MEMORY_PREFIX}/")).ok() {
                for k in keys {
                    if let Some(e) = self.store.get_json::<MemoryEntry>(&k).ok().flatten() {
                        if e.user_id == user && e.session_id == session && !e.is_expired(now) {
                            let s = Self::composite_relevance(&e, now);
                            scored.push((e, s));
                        }
                    }
                }
            }
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let mut budget = max_tokens;
            for (entry, _) in scored {
                if entry.priority == MemoryPriority::Critical {
                    continue;
                }
                let tokens = estimate_tokens(&entry.content);
                if tokens <= budget {
                    budget -= tokens;
                    total_tokens += tokens;
                    window_ids.push(entry.id.clone());
                } else {
                    pruned.push(entry.id.clone());
                }
            }
        }

        Ok(ContextWindow {
            user_id: user.to_string(),
            session_id: session.to_string(),
            memory_ids: window_ids,
            total_tokens,
            max_tokens,
            pruned_memories: pruned,
        })
    }

    /// Batch relevance decay (§4.3): entries older than the horizon get
    /// `new_relevance = clamp(1 - age/horizon + min(0.3, 0.05*accesses), 0.1, 1)`.
    /// Only entries whose score changed are rewritten.
    pub fn decay(&self) {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let keys = self.store.scan_prefix(&format!("{MEMORY_PREFIX}/")).unwrap_or_default();
        for key in keys {
            let Some(mut entry) = self.store.get_json::<MemoryEntry>(&key).ok().flatten() else {
                continue;
            };
            if entry.priority == MemoryPriority::Critical {
                continue;
            }
            let horizon = decay_horizon();
            let age = now - entry.created_at;
            if age < horizon {
                continue;
            }
            let age_ratio = age.num_seconds() as f32 / horizon.num_seconds() as f32;
            let access_bonus = (0.05 * entry.access_count as f32).min(0.3);
            let new_relevance = (1.0 - age_ratio + access_bonus).clamp(0.1, 1.0);
            if (new_relevance - entry.relevance).abs() > f32::EPSILON {
                entry.relevance = new_relevance;
                self.store.put_json(&key, &entry).ok();
            }
        }
    }

    /// Removes every expired entry (never a critical one is expired away
    /// without having had `expires_at` set explicitly — expiry is opt-in).
    /// Returns the count removed.
    pub fn prune_expired(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now();
        let keys = self.store.scan_prefix(&format!("{MEMORY_PREFIX}/")).unwrap_or_default();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = self.store.get_json::<MemoryEntry>(&key).ok().flatten() {
                if entry.is_expired(now) {
                    self.store.remove_raw(&key).ok();
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn stats(&self, user: &str) -> HashMap<String, serde_json::Value> {
        let entries = self.all_for_user(user);
        let mut out = HashMap::new();
        out.insert("total".to_string(), serde_json::json!(entries.len()));
        out.insert(
            "consolidated".to_string(),
            serde_json::json!(entries.iter().filter(|e| e.consolidated).count()),
        );
        out.insert(
            "critical".to_string(),
            serde_json::json!(entries.iter().filter(|e| e.priority == MemoryPriority::Critical).count()),
        );
        out
    }

    /// Consolidation (§4.3, resolving Open Question 3): when a user's
    /// unconsolidated-entry count exceeds the threshold, flip `consolidated`
    /// on the oldest batch and write one summary entry that inherits the
    /// maximum source priority and lists the sources as `parent_id` lineage
    /// (one summary per source via shared content prefix — sources remain
    /// independently retrievable).
    fn maybe_consolidate(&self, user: &str) {
        let mut unconsolidated: Vec<MemoryEntry> = self
            .all_for_user(user)
            .into_iter()
            .filter(|e| !e.consolidated && e.kind != MemoryKind::Context)
            .collect();
        if unconsolidated.len() <= CONSOLIDATION_THRESHOLD {
            return;
        }
        unconsolidated.sort_by_key(|e| e.created_at);
        let batch: Vec<MemoryEntry> = unconsolidated.into_iter().take(CONSOLIDATION_THRESHOLD).collect();

        let max_priority = batch
            .iter()
            .map(|e| e.priority)
            .max()
            .unwrap_or(MemoryPriority::Low);
        let summary_content = format!("[consolidated summary of {} entries]", batch.len());
        let now = Utc::now();
        let summary = MemoryEntry {
            id: memory_id(user, &summary_content, now),
            user_id: user.to_string(),
            session_id: batch[0].session_id.clone(),
            content: summary_content,
            vector: None,
            tags: vec!["consolidated".to_string()],
            kind: MemoryKind::Fact,
            priority: max_priority,
            access_count: 0,
            last_accessed: now,
            relevance: 1.0,
            expires_at: None,
            parent_id: batch.first().map(|e| e.id.clone()),
            consolidated: false,
            created_at: now,
        };
        self.save(&summary);

        for mut e in batch {
            e.consolidated = true;
            self.save(&e);
        }
    }
}

fn score(entry: &MemoryEntry, query_vector: Option<&[f32]>) -> f32 {
    let similarity = match (query_vector, entry.vector.as_deref()) {
        (Some(q), Some(v)) => ContextStore::cosine(q, v),
        _ => 1.0,
    };
    similarity * entry.relevance
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(Store::temporary()))
    }

    #[test]
    fn expired_entries_never_returned() {
        let cs = store();
        let e = cs.store_entry(
            "alice",
            "s1",
            "ephemeral note",
            MemoryKind::Context,
            MemoryPriority::Low,
            vec![],
            None,
            Some(Duration::seconds(-1)),
        );
        assert!(e.expires_at.unwrap() < Utc::now());
        let found = cs.search("alice", None, None, &[], 10, 0.0);
        assert!(found.iter().all(|m| m.id != e.id));
    }

    #[test]
    fn window_respects_token_cap() {
        let cs = store();
        for i in 0..5 {
            cs.store_entry(
                "bob",
                "s1",
                &format!("memory entry number {i} with some words in it"),
                MemoryKind::Conversation,
                MemoryPriority::Medium,
                vec![],
                None,
                None,
            );
        }
        let window = cs.build_window("bob", "s1", None, 20).unwrap();
        assert!(window.total_tokens <= window.max_tokens);
    }

    #[test]
    fn critical_entries_never_pruned() {
        let cs = store();
        let critical = cs.store_entry(
            "carol",
            "s1",
            "critical fact that must survive pruning no matter what",
            MemoryKind::Fact,
            MemoryPriority::Critical,
            vec![],
            None,
            None,
        );
        let window = cs.build_window("carol", "s1", None, 1).unwrap();
        assert!(!window.pruned_memories.contains(&critical.id));
    }

    #[test]
    fn prune_expired_removes_only_expired() {
        let cs = store();
        cs.store_entry(
            "dave",
            "s1",
            "expired",
            MemoryKind::Context,
            MemoryPriority::Low,
            vec![],
            None,
            Some(Duration::seconds(-10)),
        );
        cs.store_entry(
            "dave",
            "s1",
            "not expired",
            MemoryKind::Context,
            MemoryPriority::Low,
            vec![],
            None,
            None,
        );
        let removed = cs.prune_expired();
        assert_eq!(removed, 1);
    }
}
