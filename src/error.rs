//! Error types for the policy engine.

use std::fmt;
use thiserror::Error;

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur while managing or evaluating policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// One or more rule expressions are malformed.
    #[error("Failed to parse rules: {0}")]
    ParseError(ParseErrors),

    /// A well-formed policy could not be evaluated.
    #[error("Evaluation error: {0}")]
    EvaluationError(#[from] EvaluationError),

    /// Policy not found.
    #[error("Policy not found: {0}")]
    NotFound(String),

    /// Policy validation failed.
    #[error("Policy validation error: {0}")]
    ValidationError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The remote policy source failed.
    #[error("Remote policy source error: {0}")]
    RemoteError(String),

    /// The remote policy source did not answer in time.
    #[error("Remote policy source timed out after {timeout_ms} ms")]
    RemoteTimeout { timeout_ms: u64 },
}

impl From<ParseErrors> for PolicyError {
    fn from(errors: ParseErrors) -> Self {
        PolicyError::ParseError(errors)
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        PolicyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PolicyError {
    fn from(err: serde_yaml::Error) -> Self {
        PolicyError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for PolicyError {
    fn from(err: toml::de::Error) -> Self {
        PolicyError::ConfigError(err.to_string())
    }
}

/// What is wrong with a single rule expression node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIssueKind {
    #[error("rule expression is null")]
    NullExpression,

    #[error("rule must be an operator object, found {0}")]
    NotAnObject(&'static str),

    #[error("expression object has no operator key")]
    EmptyExpression,

    #[error("expression object has more than one operator key: {}", .0.join(", "))]
    MultipleOperators(Vec<String>),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{0}' expects an array of operands")]
    OperandsNotArray(String),

    #[error("operator '{op}' expects {expected} operands, found {found}")]
    Arity {
        op: String,
        expected: &'static str,
        found: usize,
    },

    #[error("invalid variable reference: {0}")]
    InvalidVar(String),
}

/// A single problem found while parsing, located by its path in the rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    /// Location of the offending node, e.g. `rules[0].and[1]`.
    pub path: String,
    pub kind: ParseIssueKind,
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.kind)
    }
}

/// Every distinct problem found in a rule list. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErrors {
    issues: Vec<ParseIssue>,
}

impl ParseErrors {
    /// Wraps the collected issues, returning `None` if there are none.
    pub fn from_issues(issues: Vec<ParseIssue>) -> Option<Self> {
        if issues.is_empty() {
            None
        } else {
            Some(Self { issues })
        }
    }

    pub fn single(path: impl Into<String>, kind: ParseIssueKind) -> Self {
        Self {
            issues: vec![ParseIssue {
                path: path.into(),
                kind,
            }],
        }
    }

    pub fn issues(&self) -> &[ParseIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_issues(self) -> Vec<ParseIssue> {
        self.issues
    }
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.issues.len() == 1 { "problem" } else { "problems" };
        write!(f, "{} {}", self.issues.len(), noun)?;
        for issue in &self.issues {
            write!(f, "; {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseErrors {}

/// Failure of a backend to decide a well-formed policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// The external toolchain binary is missing or cannot be started.
    #[error("toolchain '{binary}' is unavailable: {message}")]
    ToolchainUnavailable { binary: String, message: String },

    /// An external invocation exceeded its time bound.
    #[error("'{command}' timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The generated source was rejected by the compiler.
    #[error("policy compilation failed: {0}")]
    CompileFailed(String),

    /// The external evaluator exited unsuccessfully.
    #[error("external evaluation failed: {0}")]
    EvalFailed(String),

    /// The external evaluator produced output we cannot interpret.
    #[error("malformed evaluator output: {0}")]
    MalformedOutput(String),

    /// Reading or writing the temporary work area failed.
    #[error("toolchain work area error: {0}")]
    WorkArea(String),
}

impl EvaluationError {
    /// Returns true if re-running the same invocation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EvaluationError::Timeout { .. })
    }
}

impl From<std::io::Error> for EvaluationError {
    fn from(err: std::io::Error) -> Self {
        EvaluationError::WorkArea(err.to_string())
    }
}
