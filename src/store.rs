//! In-memory policy store.
//!
//! Policies live in a sharded concurrent map, so writers to different ids
//! never contend on a global lock. Updates to one id run under that entry's
//! shard lock and are never interleaved. Deleted ids are tombstoned and
//! cannot come back, locally or from a remote source.

use crate::error::{PolicyError, Result};
use crate::policy::{Policy, PolicyDraft, PolicyPatch};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: DashMap<String, Policy>,
    deleted: DashSet<String>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy from a draft, assigning its id.
    pub fn create(&self, draft: PolicyDraft) -> Result<Policy> {
        draft.validate()?;
        let rules = draft.parse_rules()?;

        let id = Uuid::new_v4().to_string();
        let policy = Policy::from_draft(id.clone(), draft, rules, Utc::now());
        self.policies.insert(id, policy.clone());

        info!(policy_id = %policy.id, name = %policy.name, backend = %policy.backend, "Policy created");
        Ok(policy)
    }

    /// Returns a copy of the policy.
    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.policies.contains_key(id)
    }

    /// Returns true if `id` was deleted from this store.
    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(id)
    }

    /// Applies a partial update. Nothing changes if the patch is invalid.
    pub fn update(&self, id: &str, patch: PolicyPatch) -> Result<Policy> {
        let rules = patch.parse_rules()?;

        let mut entry = self
            .policies
            .get_mut(id)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        patch.validate_against(&entry)?;
        entry.apply(patch, rules, Utc::now());
        let policy = entry.value().clone();
        drop(entry);

        info!(policy_id = %policy.id, revision = policy.revision, "Policy updated");
        Ok(policy)
    }

    /// Deletes a policy. Returns false if it was not held.
    pub fn delete(&self, id: &str) -> bool {
        if !self.policies.contains_key(id) {
            return false;
        }
        self.deleted.insert(id.to_string());
        let removed = self.policies.remove(id).is_some();
        if removed {
            info!(policy_id = %id, "Policy deleted");
        }
        removed
    }

    /// Caches a policy fetched from elsewhere.
    ///
    /// A locally held copy wins over the fetched one. Returns `None` if the
    /// id has been deleted.
    pub fn insert_fetched(&self, policy: Policy) -> Option<Policy> {
        let id = policy.id.clone();
        if self.deleted.contains(&id) {
            return None;
        }

        let held = self.policies.entry(id.clone()).or_insert(policy).value().clone();

        if self.deleted.contains(&id) {
            self.policies.remove(&id);
            return None;
        }
        Some(held)
    }

    /// All held policies, oldest first.
    pub fn list(&self) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self.policies.iter().map(|entry| entry.value().clone()).collect();
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
