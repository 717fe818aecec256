//! Evaluation orchestration.
//!
//! [`PolicyEngine`] resolves policies (local store first, then the remote
//! source), picks the backend each policy declares, and lazily regenerates
//! artifacts that are missing or stale. A failing backend only hands over
//! to another one when the policy lists it in `fallback`, and the result
//! records that it happened.

use crate::artifact::{ArtifactCache, CompiledArtifact};
use crate::config::{EngineConfig, ToolchainConfig};
use crate::decision::EvaluationResult;
use crate::error::{EvaluationError, PolicyError, Result};
use crate::evaluator::NativeEvaluator;
use crate::policy::{Policy, PolicyDraft, PolicyPatch};
use crate::remote::{HttpPolicySource, PolicySource};
use crate::store::PolicyStore;
use crate::toolchain::OpaToolchain;
use crate::types::Backend;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type ToolResult<T> = std::result::Result<T, EvaluationError>;

#[derive(Debug)]
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    artifacts: ArtifactCache,
    native: NativeEvaluator,
    toolchain: OpaToolchain,
    remote: Option<Arc<dyn PolicySource>>,
}

impl PolicyEngine {
    /// Builds an engine from configuration, connecting the HTTP source if one is configured.
    pub fn new(store: Arc<PolicyStore>, config: &EngineConfig) -> Result<Self> {
        let mut engine = Self::local(store, config.toolchain.clone());
        if let Some(remote) = &config.remote {
            engine.remote = Some(Arc::new(HttpPolicySource::new(remote)?));
        }
        Ok(engine)
    }

    /// Builds an engine with no remote source.
    pub fn local(store: Arc<PolicyStore>, toolchain: ToolchainConfig) -> Self {
        Self {
            store,
            artifacts: ArtifactCache::new(),
            native: NativeEvaluator::new(),
            toolchain: OpaToolchain::new(toolchain),
            remote: None,
        }
    }

    /// Sets the source consulted on cache misses.
    pub fn with_remote(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.remote = Some(source);
        self
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn create(&self, draft: PolicyDraft) -> Result<Policy> {
        self.store.create(draft)
    }

    /// Resolves a policy: local store first, then the remote source.
    pub async fn get(&self, id: &str) -> Result<Policy> {
        if let Some(policy) = self.store.get(id) {
            debug!(policy_id = %id, "Policy cache hit");
            return Ok(policy);
        }
        if self.store.is_deleted(id) {
            return Err(PolicyError::NotFound(id.to_string()));
        }
        let Some(remote) = &self.remote else {
            return Err(PolicyError::NotFound(id.to_string()));
        };

        debug!(policy_id = %id, "Policy cache miss, fetching from remote source");
        let policy = remote
            .fetch(id)
            .await?
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        if policy.id != id {
            return Err(PolicyError::RemoteError(format!(
                "requested policy '{}' but the remote source returned '{}'",
                id, policy.id
            )));
        }

        self.store
            .insert_fetched(policy)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))
    }

    /// Applies a partial update and drops the policy's artifact.
    pub async fn update(&self, id: &str, patch: PolicyPatch) -> Result<Policy> {
        self.get(id).await?;
        let policy = self.store.update(id, patch)?;
        self.artifacts.invalidate(id);
        Ok(policy)
    }

    /// Deletes a locally held policy. The id can never be resolved again.
    pub fn delete(&self, id: &str) -> bool {
        let deleted = self.store.delete(id);
        self.artifacts.invalidate(id);
        deleted
    }

    /// Lists local policies merged with those of the remote source.
    ///
    /// Local copies win. A failing remote source is logged and skipped.
    pub async fn list(&self) -> Vec<Policy> {
        if let Some(remote) = &self.remote {
            match remote.list().await {
                Ok(policies) => {
                    for policy in policies {
                        self.store.insert_fetched(policy);
                    }
                }
                Err(e) => warn!(error = %e, "Remote policy source failed to list policies"),
            }
        }
        self.store.list()
    }

    /// Returns the Rego source currently generated for a policy.
    pub async fn generated_source(&self, id: &str) -> Result<String> {
        let policy = self.get(id).await?;
        Ok(self.source_artifact(&policy).source.clone())
    }

    /// Evaluates a policy by id.
    ///
    /// Fails only if the policy cannot be resolved. Backend failures come back
    /// as an undecided result.
    pub async fn evaluate(&self, id: &str, input: &Value) -> Result<EvaluationResult> {
        let policy = self.get(id).await?;
        Ok(self.evaluate_policy(&policy, input).await)
    }

    /// Evaluates a policy object with its declared backend and fallbacks.
    pub async fn evaluate_policy(&self, policy: &Policy, input: &Value) -> EvaluationResult {
        let started = Instant::now();
        let mut failures: Vec<(Backend, EvaluationError)> = Vec::new();

        for backend in policy.backend_order() {
            match self.run_backend(backend, policy, input).await {
                Ok(result) => {
                    let elapsed_us = started.elapsed().as_micros() as u64;
                    let mut result = result
                        .with_policy_id(&policy.id)
                        .with_backend(backend)
                        .with_evaluation_time(elapsed_us);

                    if let Some((from, error)) = failures.first() {
                        warn!(
                            policy_id = %policy.id,
                            from = %from,
                            to = %backend,
                            error = %error,
                            "Declared backend failed, used fallback"
                        );
                        result = result.with_fallback(*from, error.to_string());
                    }

                    debug!(
                        policy_id = %policy.id,
                        backend = %backend,
                        allow = result.allow,
                        elapsed_us,
                        "Policy evaluated"
                    );
                    return result;
                }
                Err(error) => {
                    debug!(policy_id = %policy.id, backend = %backend, error = %error, "Backend failed");
                    failures.push((backend, error));
                }
            }
        }

        let errors: Vec<String> = failures
            .iter()
            .map(|(backend, error)| format!("{}: {}", backend, error))
            .collect();
        warn!(policy_id = %policy.id, errors = ?errors, "Policy could not be decided");

        EvaluationResult::undecided(errors)
            .with_policy_id(&policy.id)
            .with_evaluation_time(started.elapsed().as_micros() as u64)
    }

    async fn run_backend(&self, backend: Backend, policy: &Policy, input: &Value) -> ToolResult<EvaluationResult> {
        match backend {
            Backend::Native => Ok(self.native.evaluate(policy, input)),
            Backend::GeneratedSource => {
                let artifact = self.source_artifact(policy);
                self.toolchain
                    .evaluate_source(&artifact.package, &artifact.source, input)
                    .await
            }
            Backend::CompiledArtifact => match self.evaluate_compiled(policy, input).await {
                Err(error) if error.is_transient() => {
                    warn!(policy_id = %policy.id, error = %error, "Transient toolchain failure, regenerating and retrying once");
                    self.artifacts.invalidate(&policy.id);
                    self.evaluate_compiled(policy, input).await
                }
                other => other,
            },
        }
    }

    async fn evaluate_compiled(&self, policy: &Policy, input: &Value) -> ToolResult<EvaluationResult> {
        let artifact = self.source_artifact(policy);
        let bundle = match &artifact.bundle {
            Some(bundle) => Arc::clone(bundle),
            None => {
                let started = Instant::now();
                let bundle = Arc::new(self.toolchain.compile(&artifact.package, &artifact.source).await?);
                debug!(
                    policy_id = %policy.id,
                    revision = artifact.revision,
                    bytes = bundle.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Compiled policy bundle"
                );
                self.artifacts.insert(artifact.with_bundle(Arc::clone(&bundle)));
                bundle
            }
        };

        self.toolchain
            .evaluate_bundle(&artifact.package, &bundle, input)
            .await
    }

    /// Returns the current source artifact, regenerating it if missing or stale.
    fn source_artifact(&self, policy: &Policy) -> Arc<CompiledArtifact> {
        if let Some(artifact) = self.artifacts.get_fresh(policy) {
            return artifact;
        }

        let artifact = CompiledArtifact::generate(policy);
        debug!(
            policy_id = %policy.id,
            revision = policy.revision,
            digest = %artifact.source_digest,
            "Generated policy source"
        );
        self.artifacts.insert(artifact)
    }
}
