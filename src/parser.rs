//! Rule expression and policy document parsing.
//!
//! Rule parsing never stops at the first problem: every malformed node in a
//! rule list is reported, each with its location, so a caller can fix a
//! policy in one round trip.

use crate::error::{ParseErrors, ParseIssue, ParseIssueKind, Result};
use crate::expr::{Expr, VarPath};
use crate::policy::PolicyDraft;
use crate::types::{CompareOp, LogicalOp};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Parses an ordered list of top-level rules.
pub fn parse_rules(rules: &[Value]) -> std::result::Result<Vec<Expr>, ParseErrors> {
    let mut issues = Vec::new();
    let mut parsed = Vec::with_capacity(rules.len());

    for (i, rule) in rules.iter().enumerate() {
        if let Some(expr) = parse_top_level(rule, &format!("rules[{}]", i), &mut issues) {
            parsed.push(expr);
        }
    }

    match ParseErrors::from_issues(issues) {
        Some(errors) => Err(errors),
        None => Ok(parsed),
    }
}

/// Parses a single top-level rule.
pub fn parse_rule(rule: &Value) -> std::result::Result<Expr, ParseErrors> {
    let mut issues = Vec::new();
    let parsed = parse_top_level(rule, "rule", &mut issues);

    if let Some(errors) = ParseErrors::from_issues(issues) {
        return Err(errors);
    }
    parsed.ok_or_else(|| ParseErrors::single("rule", ParseIssueKind::EmptyExpression))
}

/// A top-level rule must be an operator object.
fn parse_top_level(value: &Value, path: &str, issues: &mut Vec<ParseIssue>) -> Option<Expr> {
    match value {
        Value::Null => {
            push_issue(issues, path, ParseIssueKind::NullExpression);
            None
        }
        Value::Object(obj) => parse_operator(obj, path, issues),
        other => {
            push_issue(issues, path, ParseIssueKind::NotAnObject(json_type_name(other)));
            None
        }
    }
}

/// An operand may be a literal as well as an operator object.
fn parse_operand(value: &Value, path: &str, issues: &mut Vec<ParseIssue>) -> Option<Expr> {
    match value {
        Value::Object(obj) => parse_operator(obj, path, issues),
        literal => Some(Expr::Literal(literal.clone())),
    }
}

fn parse_operator(obj: &Map<String, Value>, path: &str, issues: &mut Vec<ParseIssue>) -> Option<Expr> {
    let mut keys = obj.keys();
    let key = match (keys.next(), keys.next()) {
        (None, _) => {
            push_issue(issues, path, ParseIssueKind::EmptyExpression);
            return None;
        }
        (Some(key), None) => key.as_str(),
        (Some(_), Some(_)) => {
            let mut all: Vec<String> = obj.keys().cloned().collect();
            all.sort();
            push_issue(issues, path, ParseIssueKind::MultipleOperators(all));
            return None;
        }
    };
    let body = &obj[key];

    if key == "var" {
        return parse_var(body, path, issues);
    }

    if let Some(op) = LogicalOp::from_keyword(key) {
        let operands = operand_list(key, body, path, issues)?;
        if operands.is_empty() {
            push_issue(
                issues,
                path,
                ParseIssueKind::Arity {
                    op: key.to_string(),
                    expected: "at least 1",
                    found: 0,
                },
            );
            return None;
        }
        let parsed = parse_children(key, operands, path, issues)?;
        return Some(Expr::Logical { op, operands: parsed });
    }

    if let Some(op) = CompareOp::from_symbol(key) {
        let [left, right] = binary_operands(key, body, path, issues)?;
        return Some(Expr::compare(op, left, right));
    }

    if key == "in" {
        let [needle, haystack] = binary_operands(key, body, path, issues)?;
        return Some(Expr::membership(needle, haystack));
    }

    push_issue(issues, path, ParseIssueKind::UnknownOperator(key.to_string()));
    None
}

fn parse_var(body: &Value, path: &str, issues: &mut Vec<ParseIssue>) -> Option<Expr> {
    let Some(raw) = body.as_str() else {
        push_issue(
            issues,
            path,
            ParseIssueKind::InvalidVar(format!("expected a string path, found {}", json_type_name(body))),
        );
        return None;
    };

    match VarPath::parse(raw) {
        Ok(var) => Some(Expr::Var(var)),
        Err(kind) => {
            push_issue(issues, path, kind);
            None
        }
    }
}

fn operand_list<'a>(
    key: &str,
    body: &'a Value,
    path: &str,
    issues: &mut Vec<ParseIssue>,
) -> Option<&'a [Value]> {
    match body.as_array() {
        Some(items) => Some(items.as_slice()),
        None => {
            push_issue(issues, path, ParseIssueKind::OperandsNotArray(key.to_string()));
            None
        }
    }
}

/// Parses every child, even after a failure, so nested problems are reported too.
fn parse_children(
    key: &str,
    operands: &[Value],
    path: &str,
    issues: &mut Vec<ParseIssue>,
) -> Option<Vec<Expr>> {
    let mut parsed = Vec::with_capacity(operands.len());
    let mut failed = false;

    for (i, operand) in operands.iter().enumerate() {
        let child_path = format!("{}.{}[{}]", path, key, i);
        match parse_operand(operand, &child_path, issues) {
            Some(expr) => parsed.push(expr),
            None => failed = true,
        }
    }

    if failed {
        None
    } else {
        Some(parsed)
    }
}

fn binary_operands(key: &str, body: &Value, path: &str, issues: &mut Vec<ParseIssue>) -> Option<[Expr; 2]> {
    let operands = operand_list(key, body, path, issues)?;
    let arity_ok = operands.len() == 2;
    if !arity_ok {
        push_issue(
            issues,
            path,
            ParseIssueKind::Arity {
                op: key.to_string(),
                expected: "exactly 2",
                found: operands.len(),
            },
        );
    }

    let parsed = parse_children(key, operands, path, issues)?;
    if !arity_ok {
        return None;
    }

    let mut parsed = parsed.into_iter();
    match (parsed.next(), parsed.next()) {
        (Some(left), Some(right)) => Some([left, right]),
        _ => None,
    }
}

fn push_issue(issues: &mut Vec<ParseIssue>, path: &str, kind: ParseIssueKind) {
    let issue = ParseIssue {
        path: path.to_string(),
        kind,
    };
    if !issues.contains(&issue) {
        issues.push(issue);
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Supported policy document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Yaml,
    Json,
}

impl PolicyFormat {
    /// Detects format from file extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        if path.ends_with(".yaml") || path.ends_with(".yml") {
            Some(PolicyFormat::Yaml)
        } else if path.ends_with(".json") {
            Some(PolicyFormat::Json)
        } else {
            None
        }
    }

    /// Detects format from content.
    pub fn detect(content: &str) -> Self {
        if content.trim_start().starts_with('{') {
            PolicyFormat::Json
        } else {
            PolicyFormat::Yaml
        }
    }
}

/// Parses a policy document from a string, auto-detecting format.
pub fn parse_draft(content: &str) -> Result<PolicyDraft> {
    parse_draft_with_format(content, PolicyFormat::detect(content))
}

/// Parses a policy document from a string with specified format.
pub fn parse_draft_with_format(content: &str, format: PolicyFormat) -> Result<PolicyDraft> {
    match format {
        PolicyFormat::Yaml => PolicyDraft::from_yaml(content),
        PolicyFormat::Json => PolicyDraft::from_json(content),
    }
}

/// Parses a YAML stream holding several policy documents separated by `---`.
pub fn parse_drafts_yaml(content: &str) -> Result<Vec<PolicyDraft>> {
    let mut drafts = Vec::new();

    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let draft: PolicyDraft = serde_yaml::from_value(value)?;
        draft.validate()?;
        drafts.push(draft);
    }

    Ok(drafts)
}
