//! Model roster: priority-ordered candidate models with outcome-driven
//! reordering
//!
//! A model that succeeds moves to the front; a model that fails permanently
//! is demoted below every model known to be working. Entries are never
//! deleted: provider capacity changes over time, and a model failing now
//! may serve again later.

use crate::config::ModelSpec;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Mutex;

/// One candidate model, cloned out of the roster for an attempt
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Model identifier as sent on the wire
    pub id: String,

    /// Output token cap for this model, when configured
    pub max_tokens: Option<u32>,

    /// Consecutive permanent failures recorded for this model
    pub failures: u32,

    /// Whether this model has served at least one request successfully
    pub proven: bool,
}

struct RosterState {
    order: Vec<ModelEntry>,
    /// Configured order, restored by `reset`
    default_order: Vec<String>,
}

/// Ordered list of candidate models for one provider
pub struct ModelRoster {
    inner: Mutex<RosterState>,
}

impl ModelRoster {
    /// Create a roster from the configured model list
    pub fn new(models: Vec<ModelSpec>) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::Config("model roster must not be empty".into()));
        }
        let order: Vec<ModelEntry> = models
            .into_iter()
            .map(|spec| ModelEntry {
                id: spec.id,
                max_tokens: spec.max_tokens,
                failures: 0,
                proven: false,
            })
            .collect();
        let default_order = order.iter().map(|e| e.id.clone()).collect();
        Ok(ModelRoster {
            inner: Mutex::new(RosterState {
                order,
                default_order,
            }),
        })
    }

    /// The first model in priority order not already visited by this request
    pub fn next(&self, visited: &HashSet<String>) -> Option<ModelEntry> {
        let state = self.inner.lock().unwrap();
        state
            .order
            .iter()
            .find(|entry| !visited.contains(&entry.id))
            .cloned()
    }

    /// Record a success: the model moves to rank 0 and its failure counter
    /// clears. A no-op when the model is already at the front.
    pub fn record_success(&self, id: &str) {
        let mut state = self.inner.lock().unwrap();
        let Some(pos) = state.order.iter().position(|e| e.id == id) else {
            return;
        };
        state.order[pos].failures = 0;
        state.order[pos].proven = true;
        if pos > 0 {
            let entry = state.order.remove(pos);
            tracing::info!(model = %entry.id, "model promoted to front after success");
            state.order.insert(0, entry);
        }
    }

    /// Record a permanent failure: the failure counter increments and the
    /// model is demoted below every currently-working model.
    ///
    /// Untried models keep their configured rank above the failed one; a
    /// model that has never been exercised is not evidence of working, so a
    /// single failure does not leapfrog it.
    pub fn record_failure(&self, id: &str) {
        let mut state = self.inner.lock().unwrap();
        let Some(pos) = state.order.iter().position(|e| e.id == id) else {
            return;
        };
        let mut entry = state.order.remove(pos);
        entry.failures += 1;

        // Land just after the last model known to be working
        let target = state
            .order
            .iter()
            .rposition(|e| e.proven && e.failures == 0)
            .map(|i| i + 1)
            .unwrap_or(pos)
            .max(pos);
        tracing::warn!(model = %entry.id, failures = entry.failures, rank = target, "model demoted");
        state.order.insert(target, entry);
    }

    /// Restore the configured order. Failure counters persist; they are the
    /// roster's memory across independent campaigns.
    pub fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        let default_order = state.default_order.clone();
        state.order.sort_by_key(|entry| {
            default_order
                .iter()
                .position(|id| id == &entry.id)
                .unwrap_or(usize::MAX)
        });
    }

    /// Current order of model identifiers, for diagnostics
    pub fn snapshot(&self) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state.order.iter().map(|e| e.id.clone()).collect()
    }

    /// Number of models in the roster
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    /// Whether the roster holds no models (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> ModelRoster {
        ModelRoster::new(ids.iter().map(|id| ModelSpec::new(*id)).collect()).unwrap()
    }

    #[test]
    fn test_empty_roster_rejected() {
        assert!(matches!(ModelRoster::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_next_walks_priority_order() {
        let roster = roster(&["a", "b", "c"]);
        let mut visited = HashSet::new();
        assert_eq!(roster.next(&visited).unwrap().id, "a");
        visited.insert("a".to_string());
        assert_eq!(roster.next(&visited).unwrap().id, "b");
        visited.insert("b".to_string());
        visited.insert("c".to_string());
        assert!(roster.next(&visited).is_none());
    }

    #[test]
    fn test_success_moves_to_front() {
        let roster = roster(&["a", "b", "c"]);
        roster.record_success("b");
        assert_eq!(roster.snapshot(), ["b", "a", "c"]);
    }

    #[test]
    fn test_success_at_front_is_idempotent() {
        // Promoting the model already at rank 0 must leave the order unchanged
        let roster = roster(&["a", "b", "c"]);
        roster.record_success("a");
        assert_eq!(roster.snapshot(), ["a", "b", "c"]);
    }

    #[test]
    fn test_failure_keeps_rank_when_nothing_is_proven() {
        // No model has succeeded yet, so there is nothing to demote below
        let roster = roster(&["a", "b", "c"]);
        roster.record_failure("a");
        assert_eq!(roster.snapshot(), ["a", "b", "c"]);
    }

    #[test]
    fn test_failure_demotes_below_proven_models() {
        let roster = roster(&["a", "b"]);
        roster.record_success("b");
        roster.record_success("a");
        assert_eq!(roster.snapshot(), ["a", "b"]);
        roster.record_failure("a");
        assert_eq!(roster.snapshot(), ["b", "a"]);
    }

    #[test]
    fn test_failure_never_moves_a_model_forward() {
        let roster = roster(&["a", "b", "c"]);
        roster.record_success("a");
        roster.record_failure("c");
        assert_eq!(roster.snapshot(), ["a", "b", "c"]);
    }

    #[test]
    fn test_failure_counter_increments() {
        let roster = roster(&["a", "b"]);
        roster.record_failure("a");
        roster.record_failure("a");
        let visited: HashSet<String> = ["b".to_string()].into();
        let entry = roster.next(&visited).unwrap();
        assert_eq!(entry.id, "a");
        assert_eq!(entry.failures, 2);
    }

    #[test]
    fn test_reset_restores_configured_order() {
        let roster = roster(&["a", "b", "c"]);
        roster.record_failure("a");
        roster.record_success("c");
        roster.reset();
        assert_eq!(roster.snapshot(), ["a", "b", "c"]);
    }

    #[test]
    fn test_reset_keeps_failure_counters() {
        let roster = roster(&["a", "b"]);
        roster.record_failure("a");
        roster.reset();
        let visited = HashSet::new();
        assert_eq!(roster.next(&visited).unwrap().failures, 1);
    }
}
