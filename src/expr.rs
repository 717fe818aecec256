//! The rule expression model.
//!
//! Expressions arrive as JSON (`{"and": [...]}`, `{">": [a, b]}`, `{"var": "a.b"}`,
//! bare literals) and are parsed once by [`crate::parser`] into [`Expr`]. The
//! native evaluator and the Rego generator both walk this tree, so the two
//! backends always work from the same parse.

use crate::canonicalization::canonicalize;
use crate::error::ParseIssueKind;
use crate::types::{CompareOp, LogicalOp};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// A dotted variable path such as `user.role`, resolved against the input document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarPath {
    raw: String,
    segments: Vec<String>,
}

impl VarPath {
    /// Parses a dotted path. The empty path refers to the whole input document.
    pub fn parse(raw: &str) -> std::result::Result<Self, ParseIssueKind> {
        if raw.is_empty() {
            return Ok(Self {
                raw: String::new(),
                segments: Vec::new(),
            });
        }

        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ParseIssueKind::InvalidVar(format!(
                "path '{}' contains an empty segment",
                raw
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The path exactly as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if the path refers to the whole input document.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("input")
        } else {
            f.write_str(&self.raw)
        }
    }
}

/// A parsed rule expression. Nodes are never mutated after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A JSON scalar, array or object.
    Literal(Value),
    /// A reference into the input document.
    Var(VarPath),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<Expr>,
    },
    /// True iff the needle occurs in the haystack array.
    Membership {
        needle: Box<Expr>,
        haystack: Box<Expr>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn var(path: &str) -> std::result::Result<Self, ParseIssueKind> {
        VarPath::parse(path).map(Expr::Var)
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(operands: Vec<Expr>) -> Self {
        Expr::Logical {
            op: LogicalOp::And,
            operands,
        }
    }

    pub fn or(operands: Vec<Expr>) -> Self {
        Expr::Logical {
            op: LogicalOp::Or,
            operands,
        }
    }

    pub fn membership(needle: Expr, haystack: Expr) -> Self {
        Expr::Membership {
            needle: Box::new(needle),
            haystack: Box::new(haystack),
        }
    }

    /// Returns true if evaluating this node yields a boolean by construction.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            Expr::Compare { .. } | Expr::Logical { .. } | Expr::Membership { .. }
        )
    }

    /// Re-encodes the expression in its JSON wire form.
    pub fn to_json(&self) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Var(path) => json!({ "var": path.as_str() }),
            Expr::Compare { op, left, right } => {
                json!({ op.symbol(): [left.to_json(), right.to_json()] })
            }
            Expr::Logical { op, operands } => {
                let operands: Vec<Value> = operands.iter().map(Expr::to_json).collect();
                json!({ op.keyword(): operands })
            }
            Expr::Membership { needle, haystack } => {
                json!({ "in": [needle.to_json(), haystack.to_json()] })
            }
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => f.write_str(&canonicalize(value)),
            Expr::Var(path) => write!(f, "{}", path),
            Expr::Compare { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expr::Logical { op, operands } => {
                f.write_str("(")?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op)?;
                    }
                    write!(f, "{}", operand)?;
                }
                f.write_str(")")
            }
            Expr::Membership { needle, haystack } => write!(f, "{} in {}", needle, haystack),
        }
    }
}
