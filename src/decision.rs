//! Evaluation result types.

use crate::types::Backend;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason given when a backend reports an allow without explaining it.
pub const DEFAULT_ALLOW_REASON: &str = "succeeded";

/// Reason given when a backend reports a deny without explaining it.
pub const DEFAULT_DENY_REASON: &str = "failed";

/// The outcome class of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    /// No backend could decide; see [`EvaluationResult::errors`].
    Undecided,
}

/// Records that the declared backend failed and a fallback decided instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    /// The backend that failed.
    pub from: Backend,
    /// Why it failed.
    pub error: String,
}

/// A normalized evaluation result, identical in shape for every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// True only when the policy was decided and every rule held.
    pub allow: bool,

    /// One line per contributing condition, in rule order.
    pub reasons: Vec<String>,

    /// The per-rule decision document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Why the policy could not be decided. Empty for decided results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// ID of the evaluated policy.
    pub policy_id: Option<String>,

    /// The backend that produced this result.
    pub backend: Option<Backend>,

    /// Set when the declared backend failed and a fallback was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackRecord>,

    /// Time taken to evaluate (in microseconds).
    pub evaluation_time_us: Option<u64>,
}

impl EvaluationResult {
    /// Creates a decided result.
    pub fn decided(allow: bool, reasons: Vec<String>) -> Self {
        Self {
            allow,
            reasons,
            data: None,
            errors: Vec::new(),
            policy_id: None,
            backend: None,
            fallback: None,
            evaluation_time_us: None,
        }
    }

    /// Creates a new allow result.
    pub fn allow(reasons: Vec<String>) -> Self {
        Self::decided(true, reasons)
    }

    /// Creates a new deny result.
    pub fn deny(reasons: Vec<String>) -> Self {
        Self::decided(false, reasons)
    }

    /// Creates a result for a policy that could not be decided.
    pub fn undecided(errors: Vec<String>) -> Self {
        Self {
            errors,
            ..Self::decided(false, Vec::new())
        }
    }

    /// Sets the decision document.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the policy ID.
    pub fn with_policy_id(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    /// Sets the deciding backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Records the fallback that led to this result.
    pub fn with_fallback(mut self, from: Backend, error: impl Into<String>) -> Self {
        self.fallback = Some(FallbackRecord {
            from,
            error: error.into(),
        });
        self
    }

    /// Sets the evaluation time.
    pub fn with_evaluation_time(mut self, time_us: u64) -> Self {
        self.evaluation_time_us = Some(time_us);
        self
    }

    pub fn decision(&self) -> Decision {
        if !self.errors.is_empty() {
            Decision::Undecided
        } else if self.allow {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// Returns true if the decision is allow.
    pub fn is_allowed(&self) -> bool {
        self.decision() == Decision::Allow
    }

    /// Returns true if the policy was decided and denied.
    pub fn is_denied(&self) -> bool {
        self.decision() == Decision::Deny
    }

    /// Returns true if no backend could decide.
    pub fn is_undecided(&self) -> bool {
        self.decision() == Decision::Undecided
    }
}
