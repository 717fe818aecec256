//! Rego source generation.
//!
//! Renders a policy's rules into a Rego v1 module:
//! - `allow` is the conjunction of `rule_0`, `rule_1`, ...
//! - `reasons` reports `rule_i passed` or `rule_i failed` for every rule
//! - `or` branches and boolean operands become auxiliary rules named by
//!   their position in the tree (`rule_0_1`, `rule_0_1_0`, ...)
//!
//! Output is a pure function of the expression tree.

use crate::context::is_index_segment;
use crate::error::ParseErrors;
use crate::evaluator::EMPTY_POLICY_REASON;
use crate::expr::{Expr, VarPath};
use crate::parser::parse_rules;
use crate::policy::Policy;
use crate::types::LogicalOp;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

/// Name of the decision rule.
pub const ALLOW_RULE: &str = "allow";

/// Name of the reasons set.
pub const REASONS_RULE: &str = "reasons";

const KEYWORDS: &[&str] = &[
    "as", "contains", "data", "default", "else", "every", "false", "if", "import", "in", "input",
    "not", "null", "package", "some", "true", "with",
];

const ORDERED_PAIR_HELPER: &str = "ordered_pair(a, b) if {
\tis_number(a)
\tis_number(b)
}

ordered_pair(a, b) if {
\tis_string(a)
\tis_string(b)
}
";

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").expect("invalid regex");
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid regex");
}

/// Derives the Rego package name from a policy name.
pub fn package_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let collapsed = NON_ALNUM.replace_all(&lowered, "_");
    let trimmed = collapsed.trim_matches('_');

    if trimmed.is_empty() {
        return "policy".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) || KEYWORDS.contains(&trimmed) {
        return format!("policy_{}", trimmed);
    }
    trimmed.to_string()
}

/// Renders parsed rules into a Rego module in `package`.
pub fn render(package: &str, rules: &[Expr]) -> String {
    Generator::default().render(package, rules)
}

/// Renders a stored policy.
pub fn render_policy(policy: &Policy) -> String {
    render(&policy.package_name(), &policy.rules)
}

/// Parses and renders raw rules, reporting every parse problem found.
pub fn render_raw(name: &str, rules: &[Value]) -> Result<String, ParseErrors> {
    let rules = parse_rules(rules)?;
    Ok(render(&package_name(name), &rules))
}

/// Renders a JSON value as a Rego term.
pub fn literal(value: &Value) -> String {
    let mut out = String::new();
    write_literal(&mut out, value);
    out
}

/// Renders a variable reference as a Rego reference into `input`.
pub fn var_ref(path: &VarPath) -> String {
    let mut out = String::from("input");

    for segment in path.segments() {
        if is_index_segment(segment) {
            match segment.parse::<usize>() {
                Ok(index) => {
                    out.push('[');
                    out.push_str(&index.to_string());
                    out.push(']');
                }
                Err(_) => push_bracketed(&mut out, segment),
            }
        } else if IDENTIFIER.is_match(segment) && !KEYWORDS.contains(&segment.as_str()) {
            out.push('.');
            out.push_str(segment);
        } else {
            push_bracketed(&mut out, segment);
        }
    }

    out
}

/// Appends `s` as a Rego string literal. Line endings are kept as written.
fn push_string_literal(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn push_bracketed(out: &mut String, segment: &str) {
    out.push('[');
    push_string_literal(out, segment);
    out.push(']');
}

fn write_literal(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_string_literal(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(out, item);
            }
            out.push(']');
        }
        Value::Object(obj) => {
            let mut entries: Vec<(&String, &Value)> = obj.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_string_literal(out, key);
                out.push_str(": ");
                write_literal(out, item);
            }
            out.push('}');
        }
    }
}

/// A rule body: lines that must all hold.
type Body = Vec<String>;

#[derive(Default)]
struct Generator {
    blocks: Vec<String>,
    uses_ordered_pair: bool,
}

impl Generator {
    fn render(mut self, package: &str, rules: &[Expr]) -> String {
        let mut out = format!("package {}\n\nimport rego.v1\n\ndefault {} := false\n", package, ALLOW_RULE);

        if rules.is_empty() {
            out.push_str(&format!("\n{} contains ", REASONS_RULE));
            push_string_literal(&mut out, EMPTY_POLICY_REASON);
            out.push_str(" if true\n");
            return out;
        }

        out.push_str(&format!("\n{} if {{\n", ALLOW_RULE));
        for i in 0..rules.len() {
            out.push_str(&format!("\trule_{}\n", i));
        }
        out.push_str("}\n\n");

        for i in 0..rules.len() {
            out.push_str(&format!(
                "{reasons} contains \"rule_{i} passed\" if rule_{i}\n{reasons} contains \"rule_{i} failed\" if not rule_{i}\n",
                reasons = REASONS_RULE,
                i = i
            ));
        }

        for (i, rule) in rules.iter().enumerate() {
            let name = format!("rule_{}", i);
            let bodies = self.condition_bodies(rule, &name);
            self.push_rule(&name, bodies);
        }

        for block in &self.blocks {
            out.push('\n');
            out.push_str(block);
        }

        if self.uses_ordered_pair {
            out.push('\n');
            out.push_str(ORDERED_PAIR_HELPER);
        }

        out
    }

    /// Emits a boolean rule that holds iff any of `bodies` holds.
    fn push_rule(&mut self, name: &str, bodies: Vec<Body>) {
        let mut block = format!("default {} := false\n", name);
        for body in bodies {
            block.push_str(&format!("\n{} if {{\n", name));
            for line in body {
                block.push('\t');
                block.push_str(&line);
                block.push('\n');
            }
            block.push_str("}\n");
        }
        self.blocks.push(block);
    }

    /// Renders `expr` in condition position as alternative bodies.
    fn condition_bodies(&mut self, expr: &Expr, path: &str) -> Vec<Body> {
        match expr {
            Expr::Literal(_) | Expr::Var(_) => {
                let term = self.term(expr, path);
                vec![vec![format!("{} == true", term)]]
            }
            Expr::Compare { op, left, right } => {
                let l = self.term(left, &child(path, 0));
                let r = self.term(right, &child(path, 1));

                let mut body = Vec::new();
                if op.is_ordering() && !same_orderable_literals(left, right) {
                    self.uses_ordered_pair = true;
                    body.push(format!("ordered_pair({}, {})", l, r));
                }
                body.push(format!("{} {} {}", l, op.symbol(), r));
                vec![body]
            }
            Expr::Membership { needle, haystack } => {
                let n = self.term(needle, &child(path, 0));
                let h = self.term(haystack, &child(path, 1));

                let mut body = Vec::new();
                if !matches!(**haystack, Expr::Literal(Value::Array(_))) {
                    body.push(format!("is_array({})", h));
                }
                body.push(format!("{} in {}", n, h));
                vec![body]
            }
            Expr::Logical {
                op: LogicalOp::And,
                operands,
            } => {
                if operands.is_empty() {
                    return vec![vec!["true".to_string()]];
                }

                let mut body = Vec::new();
                for (j, operand) in operands.iter().enumerate() {
                    let name = child(path, j);
                    let mut bodies = self.condition_bodies(operand, &name);
                    if bodies.len() == 1 {
                        body.append(&mut bodies[0]);
                    } else {
                        self.push_rule(&name, bodies);
                        body.push(name);
                    }
                }
                vec![body]
            }
            Expr::Logical {
                op: LogicalOp::Or,
                operands,
            } => {
                if operands.is_empty() {
                    return vec![vec!["false".to_string()]];
                }

                let mut bodies = Vec::new();
                for (j, operand) in operands.iter().enumerate() {
                    bodies.extend(self.condition_bodies(operand, &child(path, j)));
                }
                bodies
            }
        }
    }

    /// Renders `expr` in operand position. Conditions become auxiliary rules.
    fn term(&mut self, expr: &Expr, path: &str) -> String {
        match expr {
            Expr::Literal(value) => literal(value),
            Expr::Var(var) => var_ref(var),
            condition => {
                let bodies = self.condition_bodies(condition, path);
                self.push_rule(path, bodies);
                path.to_string()
            }
        }
    }
}

fn child(path: &str, index: usize) -> String {
    format!("{}_{}", path, index)
}

fn same_orderable_literals(left: &Expr, right: &Expr) -> bool {
    matches!(
        (left, right),
        (Expr::Literal(Value::Number(_)), Expr::Literal(Value::Number(_)))
            | (Expr::Literal(Value::String(_)), Expr::Literal(Value::String(_)))
    )
}
