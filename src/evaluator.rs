//! Native policy evaluation.
//!
//! A direct tree-walking interpreter over [`Expr`]. Its semantics are the
//! reference the generated Rego is held to:
//!
//! - Equality is strict: numbers compare numerically, containers structurally,
//!   and values of different JSON types are never equal.
//! - Ordering operators compare two numbers or two strings; any other pairing
//!   is false.
//! - Any comparison involving an undefined operand is false, `!=` included.
//! - Membership requires the haystack to be an array.
//! - A variable or literal used as a condition holds only if it is `true`.

use crate::canonicalization::canonicalize;
use crate::context::EvaluationContext;
use crate::decision::EvaluationResult;
use crate::expr::Expr;
use crate::policy::Policy;
use crate::types::{Backend, CompareOp, LogicalOp};
use serde_json::{Map, Number, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Instant;

/// Reason reported when a policy has no rules to satisfy.
pub const EMPTY_POLICY_REASON: &str = "policy has no rules";

/// The result of evaluating one condition, with a readable account of why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub holds: bool,
    pub summary: String,
}

/// The native policy evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEvaluator;

impl NativeEvaluator {
    /// Creates a new evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a stored policy against an input document.
    pub fn evaluate(&self, policy: &Policy, input: &Value) -> EvaluationResult {
        let start = Instant::now();
        let ctx = EvaluationContext::new(input.clone());

        self.evaluate_rules(&policy.rules, &ctx)
            .with_policy_id(&policy.id)
            .with_backend(Backend::Native)
            .with_evaluation_time(start.elapsed().as_micros() as u64)
    }

    /// Evaluates an ordered rule list. The result allows iff every rule holds.
    pub fn evaluate_rules(&self, rules: &[Expr], ctx: &EvaluationContext) -> EvaluationResult {
        if rules.is_empty() {
            return EvaluationResult::deny(vec![EMPTY_POLICY_REASON.to_string()])
                .with_data(Value::Object(Map::new()));
        }

        let mut reasons = Vec::with_capacity(rules.len());
        let mut data = Map::new();
        let mut allow = true;

        for (i, rule) in rules.iter().enumerate() {
            let outcome = self.evaluate_condition(rule, ctx);
            reasons.push(format!("rule_{} {}: {}", i, verdict(outcome.holds), outcome.summary));
            data.insert(format!("rule_{}", i), Value::Bool(outcome.holds));
            allow &= outcome.holds;
        }

        EvaluationResult::decided(allow, reasons).with_data(Value::Object(data))
    }

    /// Evaluates an expression in condition position.
    pub fn evaluate_condition(&self, expr: &Expr, ctx: &EvaluationContext) -> ConditionOutcome {
        match expr {
            Expr::Literal(value) => ConditionOutcome {
                holds: *value == Value::Bool(true),
                summary: expr.to_string(),
            },

            Expr::Var(path) => {
                let value = ctx.resolve(path);
                ConditionOutcome {
                    holds: value == Some(&Value::Bool(true)),
                    summary: format!("{} ({})", path, describe(value)),
                }
            }

            Expr::Compare { op, left, right } => {
                let l = self.operand(left, ctx);
                let r = self.operand(right, ctx);
                ConditionOutcome {
                    holds: compare_values(*op, l.as_deref(), r.as_deref()),
                    summary: format!(
                        "{} ({} {} {})",
                        expr,
                        describe(l.as_deref()),
                        op,
                        describe(r.as_deref())
                    ),
                }
            }

            Expr::Membership { needle, haystack } => {
                let n = self.operand(needle, ctx);
                let h = self.operand(haystack, ctx);
                ConditionOutcome {
                    holds: contains(n.as_deref(), h.as_deref()),
                    summary: format!(
                        "{} ({} in {})",
                        expr,
                        describe(n.as_deref()),
                        describe(h.as_deref())
                    ),
                }
            }

            Expr::Logical { op, operands } => self.evaluate_logical(*op, operands, ctx),
        }
    }

    /// `and` stops after the first failing operand, `or` after the first passing
    /// one. Every evaluated operand is recorded.
    fn evaluate_logical(&self, op: LogicalOp, operands: &[Expr], ctx: &EvaluationContext) -> ConditionOutcome {
        let stop_on = op == LogicalOp::Or;
        let mut holds = op == LogicalOp::And;
        let mut parts = Vec::new();

        for operand in operands {
            let outcome = self.evaluate_condition(operand, ctx);
            parts.push(format!("{}: {}", verdict(outcome.holds), outcome.summary));
            if outcome.holds == stop_on {
                holds = stop_on;
                break;
            }
        }

        let skipped = operands.len() - parts.len();
        if skipped > 0 {
            parts.push(format!("{} not evaluated", skipped));
        }

        let quantifier = match op {
            LogicalOp::And => "all of",
            LogicalOp::Or => "any of",
        };
        ConditionOutcome {
            holds,
            summary: format!("{} [{}]", quantifier, parts.join("; ")),
        }
    }

    /// Evaluates an expression in operand position. `None` means undefined.
    fn operand<'a>(&self, expr: &'a Expr, ctx: &'a EvaluationContext) -> Option<Cow<'a, Value>> {
        match expr {
            Expr::Literal(value) => Some(Cow::Borrowed(value)),
            Expr::Var(path) => ctx.resolve(path).map(Cow::Borrowed),
            condition => Some(Cow::Owned(Value::Bool(
                self.evaluate_condition(condition, ctx).holds,
            ))),
        }
    }
}

/// Applies a comparison operator to two resolved operands.
pub fn compare_values(op: CompareOp, left: Option<&Value>, right: Option<&Value>) -> bool {
    let (Some(left), Some(right)) = (left, right) else {
        return false;
    };

    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => order(left, right) == Some(Ordering::Less),
        CompareOp::Le => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => order(left, right) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Strict structural equality with numeric comparison of numbers.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b) == Some(Ordering::Equal),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Integers compare exactly; anything involving a float compares as `f64`.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (integer(a), integer(b)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from))
}

fn contains(needle: Option<&Value>, haystack: Option<&Value>) -> bool {
    match (needle, haystack) {
        (Some(needle), Some(Value::Array(items))) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        Some(value) => canonicalize(value),
        None => "undefined".to_string(),
    }
}

fn verdict(holds: bool) -> &'static str {
    if holds {
        "passed"
    } else {
        "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rules;
    use serde_json::json;

    fn evaluate(rules: Value, input: Value) -> EvaluationResult {
        let rules = parse_rules(rules.as_array().unwrap()).unwrap();
        NativeEvaluator::new().evaluate_rules(&rules, &EvaluationContext::new(input))
    }

    #[test]
    fn test_greater_than_allows() {
        let result = evaluate(json!([{">": [{"var": "value"}, 0]}]), json!({"value": 50}));
        assert!(result.is_allowed());
        assert_eq!(result.reasons, vec!["rule_0 passed: value > 0 (50 > 0)"]);
        assert_eq!(result.data, Some(json!({"rule_0": true})));
    }

    #[test]
    fn test_and_records_failing_clause() {
        let result = evaluate(
            json!([{"and": [
                {">": [{"var": "value"}, 0]},
                {"<": [{"var": "value"}, 100]}
            ]}]),
            json!({"value": -10}),
        );
        assert!(result.is_denied());
        assert_eq!(result.reasons.len(), 1);
        let reason = &result.reasons[0];
        assert!(reason.starts_with("rule_0 failed: all of ["));
        assert!(reason.contains("failed: value > 0 (-10 > 0)"));
        assert!(reason.contains("1 not evaluated"));
    }

    #[test]
    fn test_and_records_every_passing_operand() {
        let result = evaluate(
            json!([{"and": [
                {">": [{"var": "value"}, 0]},
                {"<": [{"var": "value"}, 100]}
            ]}]),
            json!({"value": 50}),
        );
        assert!(result.is_allowed());
        assert_eq!(
            result.reasons[0],
            "rule_0 passed: all of [passed: value > 0 (50 > 0); passed: value < 100 (50 < 100)]"
        );
    }

    #[test]
    fn test_or_short_circuits_on_success() {
        let result = evaluate(
            json!([{"or": [
                {"==": [{"var": "role"}, "admin"]},
                {"==": [{"var": "role"}, "owner"]}
            ]}]),
            json!({"role": "admin"}),
        );
        assert!(result.is_allowed());
        assert!(result.reasons[0].contains("1 not evaluated"));
    }

    #[test]
    fn test_membership() {
        let rules = json!([{"in": [{"var": "user.role"}, ["admin", "manager"]]}]);
        assert!(evaluate(rules.clone(), json!({"user": {"role": "admin"}})).is_allowed());
        assert!(evaluate(rules.clone(), json!({"user": {"role": "guest"}})).is_denied());
        assert!(evaluate(rules, json!({"user": {}})).is_denied());
    }

    #[test]
    fn test_membership_requires_array_haystack() {
        let rules = json!([{"in": [{"var": "needle"}, {"var": "haystack"}]}]);
        assert!(evaluate(rules.clone(), json!({"needle": "a", "haystack": ["a"]})).is_allowed());
        assert!(evaluate(rules.clone(), json!({"needle": "a", "haystack": "abc"})).is_denied());
        assert!(evaluate(rules, json!({"needle": "a", "haystack": {"a": 1}})).is_denied());
    }

    #[test]
    fn test_undefined_never_raises() {
        let result = evaluate(
            json!([{"==": [{"var": "user.role"}, "admin"]}]),
            json!({"user": {}}),
        );
        assert!(result.is_denied());
        assert_eq!(
            result.reasons[0],
            r#"rule_0 failed: user.role == "admin" (undefined == "admin")"#
        );
    }

    #[test]
    fn test_every_rule_is_reported() {
        let result = evaluate(
            json!([
                {"==": [{"var": "a"}, 1]},
                {"==": [{"var": "b"}, 2]},
                {"==": [{"var": "c"}, 3]}
            ]),
            json!({"a": 1, "b": 0, "c": 3}),
        );
        assert!(result.is_denied());
        assert_eq!(result.reasons.len(), 3);
        assert!(result.reasons[0].starts_with("rule_0 passed"));
        assert!(result.reasons[1].starts_with("rule_1 failed"));
        assert!(result.reasons[2].starts_with("rule_2 passed"));
        assert_eq!(result.data, Some(json!({"rule_0": true, "rule_1": false, "rule_2": true})));
    }

    #[test]
    fn test_empty_policy_denies() {
        let result = evaluate(json!([]), json!({}));
        assert!(result.is_denied());
        assert_eq!(result.reasons, vec![EMPTY_POLICY_REASON]);
    }

    #[test]
    fn test_same_type_comparisons() {
        let n = |v: Value| Some(v);
        assert!(compare_values(CompareOp::Lt, n(json!(1)).as_ref(), n(json!(2.5)).as_ref()));
        assert!(compare_values(CompareOp::Ge, n(json!(3)).as_ref(), n(json!(3.0)).as_ref()));
        assert!(compare_values(CompareOp::Eq, n(json!(1)).as_ref(), n(json!(1.0)).as_ref()));
        assert!(compare_values(CompareOp::Lt, n(json!("apple")).as_ref(), n(json!("banana")).as_ref()));
        assert!(compare_values(CompareOp::Le, n(json!("b")).as_ref(), n(json!("b")).as_ref()));
        assert!(!compare_values(CompareOp::Gt, n(json!("B")).as_ref(), n(json!("a")).as_ref()));
        assert!(compare_values(CompareOp::Ne, n(json!("a")).as_ref(), n(json!("b")).as_ref()));
    }

    #[test]
    fn test_mismatched_types_are_false_for_ordering() {
        let ops = [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge];
        let pairs = [
            (json!(1), json!("1")),
            (json!(true), json!(1)),
            (json!(null), json!(0)),
            (json!([1]), json!([2])),
        ];
        for op in ops {
            for (a, b) in &pairs {
                assert!(!compare_values(op, Some(a), Some(b)), "{:?} {} {:?}", a, op, b);
            }
        }
    }

    #[test]
    fn test_strict_equality() {
        assert!(!compare_values(CompareOp::Eq, Some(&json!(1)), Some(&json!("1"))));
        assert!(compare_values(CompareOp::Ne, Some(&json!(1)), Some(&json!("1"))));
        assert!(!compare_values(CompareOp::Eq, Some(&json!(0)), Some(&json!(false))));
        assert!(compare_values(CompareOp::Eq, Some(&json!({"a": [1, 2]})), Some(&json!({"a": [1.0, 2]}))));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = json!(9007199254740993u64);
        let below = json!(9007199254740992u64);
        assert!(!compare_values(CompareOp::Eq, Some(&below), Some(&big)));
        assert!(compare_values(CompareOp::Lt, Some(&below), Some(&big)));
        assert!(compare_values(CompareOp::Gt, Some(&json!(u64::MAX)), Some(&json!(i64::MAX))));
        assert!(compare_values(CompareOp::Lt, Some(&json!(i64::MIN)), Some(&json!(u64::MAX))));
        assert!(compare_values(CompareOp::Eq, Some(&json!(2)), Some(&json!(2.0))));

        let rules = json!([{"==": [{"var": "n"}, 9007199254740993u64]}]);
        assert!(evaluate(rules.clone(), json!({"n": 9007199254740992u64})).is_denied());
        assert!(evaluate(rules, json!({"n": 9007199254740993u64})).is_allowed());
    }

    #[test]
    fn test_carriage_returns_are_significant() {
        let rules = json!([{"==": [{"var": "s"}, "a\r\nb"]}]);
        assert!(evaluate(rules.clone(), json!({"s": "a\r\nb"})).is_allowed());
        assert!(evaluate(rules, json!({"s": "a\nb"})).is_denied());
    }

    #[test]
    fn test_undefined_operands_are_false_for_every_operator() {
        for op in CompareOp::ALL {
            assert!(!compare_values(op, None, Some(&json!(1))));
            assert!(!compare_values(op, Some(&json!(1)), None));
            assert!(!compare_values(op, None, None));
        }
        // null is a value, undefined is not
        assert!(!compare_values(CompareOp::Eq, Some(&Value::Null), None));
    }

    #[test]
    fn test_bare_variable_condition_requires_true() {
        let rules = json!([{"var": "flag"}]);
        assert!(evaluate(rules.clone(), json!({"flag": true})).is_allowed());
        assert!(evaluate(rules.clone(), json!({"flag": "yes"})).is_denied());
        assert!(evaluate(rules, json!({})).is_denied());
    }

    #[test]
    fn test_nested_condition_as_operand() {
        let rules = json!([{"==": [{">": [{"var": "score"}, 10]}, false]}]);
        assert!(evaluate(rules.clone(), json!({"score": 3})).is_allowed());
        assert!(evaluate(rules.clone(), json!({"score": 30})).is_denied());
        // an undefined comparison is a defined `false` operand
        assert!(evaluate(rules, json!({})).is_allowed());
    }

    #[test]
    fn test_policy_result_metadata() {
        let policy = Policy::for_tests(
            "p-1",
            vec![
                crate::parser::parse_rule(&json!({">": [{"var": "value"}, 0]})).unwrap(),
            ],
        );
        let result = NativeEvaluator::new().evaluate(&policy, &json!({"value": 1}));
        assert_eq!(result.policy_id.as_deref(), Some("p-1"));
        assert_eq!(result.backend, Some(Backend::Native));
        assert!(result.evaluation_time_us.is_some());
    }
}
