//! Generated artifacts and their cache.

use crate::canonicalization::canonical_hash;
use crate::codegen;
use crate::hash::source_digest;
use crate::policy::Policy;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Rego source generated from one policy revision, optionally compiled.
///
/// Artifacts are never mutated; compiling produces a new artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    pub policy_id: String,

    /// The policy revision this artifact was generated from.
    pub revision: u64,

    /// Rego package of the generated module.
    pub package: String,

    pub source: String,

    /// `sha256:<hex>` digest of `source`.
    pub source_digest: String,

    /// Canonical hash of the rules the source was generated from.
    pub rules_hash: String,

    /// Compiled wasm bundle, once built.
    pub bundle: Option<Arc<Vec<u8>>>,

    pub generated_at: DateTime<Utc>,
}

impl CompiledArtifact {
    /// Generates the source artifact for the policy's current revision.
    pub fn generate(policy: &Policy) -> Self {
        let source = codegen::render_policy(policy);
        let rules = Value::Array(policy.rules.iter().map(|rule| rule.to_json()).collect());

        Self {
            policy_id: policy.id.clone(),
            revision: policy.revision,
            package: policy.package_name(),
            source_digest: source_digest(&source),
            source,
            rules_hash: canonical_hash(&rules),
            bundle: None,
            generated_at: Utc::now(),
        }
    }

    /// Returns a copy of this artifact carrying the compiled bundle.
    pub fn with_bundle(&self, bundle: Arc<Vec<u8>>) -> Self {
        Self {
            bundle: Some(bundle),
            ..self.clone()
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.bundle.is_some()
    }

    /// Returns true if the artifact no longer reflects `policy`.
    pub fn is_stale_for(&self, policy: &Policy) -> bool {
        self.policy_id != policy.id || self.revision != policy.revision
    }
}

/// Shared artifact cache keyed by policy id.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    entries: DashMap<String, Arc<CompiledArtifact>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached artifact if it is current for `policy`.
    pub fn get_fresh(&self, policy: &Policy) -> Option<Arc<CompiledArtifact>> {
        self.entries
            .get(&policy.id)
            .filter(|artifact| !artifact.is_stale_for(policy))
            .map(|artifact| Arc::clone(artifact.value()))
    }

    /// Caches `artifact` unless a newer revision is already cached.
    ///
    /// Returns whichever artifact the cache holds afterwards.
    pub fn insert(&self, artifact: CompiledArtifact) -> Arc<CompiledArtifact> {
        let artifact = Arc::new(artifact);
        match self.entries.entry(artifact.policy_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().revision <= artifact.revision {
                    entry.insert(Arc::clone(&artifact));
                    artifact
                } else {
                    Arc::clone(entry.get())
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&artifact));
                artifact
            }
        }
    }

    /// Drops the cached artifact for `policy_id`.
    pub fn invalidate(&self, policy_id: &str) -> bool {
        self.entries.remove(policy_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
