//! Evaluation context and variable resolution.

use crate::expr::VarPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The input document a policy is evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationContext {
    input: Value,
}

impl EvaluationContext {
    /// Creates a new evaluation context.
    pub fn new(input: Value) -> Self {
        Self { input }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Gets a value from the input by dotted path.
    ///
    /// Returns `None` ("undefined") when a segment is missing or the value
    /// reached so far is not a container. This is distinct from a JSON `null`,
    /// which resolves to `Some(&Value::Null)`.
    ///
    /// Numeric segments index arrays; they do not match object keys.
    pub fn resolve(&self, path: &VarPath) -> Option<&Value> {
        resolve(&self.input, path)
    }
}

impl From<Value> for EvaluationContext {
    fn from(input: Value) -> Self {
        Self::new(input)
    }
}

/// Resolves a path against any JSON document. See [`EvaluationContext::resolve`].
pub fn resolve<'a>(document: &'a Value, path: &VarPath) -> Option<&'a Value> {
    let mut current = document;

    for segment in path.segments() {
        current = match current {
            Value::Object(_) if is_index_segment(segment) => return None,
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) if is_index_segment(segment) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Returns true for segments made only of ASCII digits, which index arrays.
pub(crate) fn is_index_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
