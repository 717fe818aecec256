//! Policy definition and management.

use crate::error::{ParseErrors, PolicyError, Result};
use crate::expr::Expr;
use crate::parser::parse_rules;
use crate::types::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A stored policy. The store owns the authoritative copy; readers get clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicyRecord")]
pub struct Policy {
    /// Unique identifier, assigned at creation and never reused.
    pub id: String,

    /// Human-readable name. Also determines the generated package name.
    pub name: String,

    /// Description of what this policy does.
    pub description: String,

    /// Author-supplied semantic version.
    pub version: String,

    /// Top-level rules. The policy allows iff every rule holds.
    pub rules: Vec<Expr>,

    /// Backend used to evaluate this policy.
    #[serde(rename = "type")]
    pub backend: Backend,

    /// Backends to try, in order, if `backend` fails outright.
    pub fallback: Vec<Backend>,

    /// Bumped on every update. Compiled artifacts are keyed to it.
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Policy metadata.
    pub metadata: HashMap<String, Value>,
}

/// The wire form of a policy, with rules still in raw JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(rename = "type", default)]
    pub backend: Backend,
    #[serde(default)]
    pub fallback: Vec<Backend>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TryFrom<PolicyRecord> for Policy {
    type Error = PolicyError;

    fn try_from(record: PolicyRecord) -> Result<Self> {
        if record.id.is_empty() {
            return Err(PolicyError::ValidationError("Policy ID is required".to_string()));
        }
        validate_name(&record.name)?;
        validate_fallback(record.backend, &record.fallback)?;
        let rules = parse_rules(&record.rules)?;

        Ok(Self {
            id: record.id,
            name: record.name,
            description: record.description,
            version: record.version,
            rules,
            backend: record.backend,
            fallback: record.fallback,
            revision: record.revision,
            created_at: record.created_at,
            updated_at: record.updated_at,
            metadata: record.metadata,
        })
    }
}

impl Policy {
    /// Builds a freshly created policy from a validated draft.
    pub(crate) fn from_draft(id: String, draft: PolicyDraft, rules: Vec<Expr>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            description: draft.description,
            version: draft.version,
            rules,
            backend: draft.backend,
            fallback: draft.fallback,
            revision: 1,
            created_at: now,
            updated_at: now,
            metadata: draft.metadata,
        }
    }

    /// Applies a validated patch in place, bumping the revision.
    pub(crate) fn apply(&mut self, patch: PolicyPatch, rules: Option<Vec<Expr>>, now: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(version) = patch.version {
            self.version = version;
        }
        if let Some(rules) = rules {
            self.rules = rules;
        }
        if let Some(backend) = patch.backend {
            self.backend = backend;
        }
        if let Some(fallback) = patch.fallback {
            self.fallback = fallback;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        self.revision += 1;
        self.updated_at = now.max(self.updated_at);
    }

    /// Parses a policy from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parses a policy from a JSON value, keeping rule parse errors intact.
    pub fn from_value(value: Value) -> Result<Self> {
        let record: PolicyRecord = serde_json::from_value(value)?;
        Self::try_from(record)
    }

    /// Serializes the policy to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyError::SerializationError(e.to_string()))
    }

    /// Serializes the policy to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PolicyError::SerializationError(e.to_string()))
    }

    /// The generated package name for this policy.
    pub fn package_name(&self) -> String {
        crate::codegen::package_name(&self.name)
    }

    /// Backends to try in order: the declared one, then the explicit fallbacks.
    pub fn backend_order(&self) -> impl Iterator<Item = Backend> + '_ {
        std::iter::once(self.backend).chain(self.fallback.iter().copied())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: &str, rules: Vec<Expr>) -> Self {
        let draft = PolicyDraft::new("Test Policy");
        Self::from_draft(id.to_string(), draft, rules, Utc::now())
    }
}

/// Input for creating a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Rules in their JSON form; parsed when the policy is created.
    #[serde(default)]
    pub rules: Vec<Value>,

    #[serde(rename = "type", default)]
    pub backend: Backend,

    #[serde(default)]
    pub fallback: Vec<Backend>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PolicyDraft {
    /// Creates a new draft with no rules, evaluated natively.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            rules: Vec::new(),
            backend: Backend::default(),
            fallback: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a rule.
    pub fn with_rule(mut self, rule: Value) -> Self {
        self.rules.push(rule);
        self
    }

    /// Replaces the rules.
    pub fn with_rules(mut self, rules: Vec<Value>) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the explicit fallback order.
    pub fn with_fallback(mut self, fallback: Vec<Backend>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Adds metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parses a draft from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let draft: PolicyDraft = serde_yaml::from_str(yaml)?;
        draft.validate()?;
        Ok(draft)
    }

    /// Parses a draft from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let draft: PolicyDraft = serde_json::from_str(json)?;
        draft.validate()?;
        Ok(draft)
    }

    /// Validates everything except the rules.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_fallback(self.backend, &self.fallback)
    }

    /// Parses the rules, reporting every problem found.
    pub fn parse_rules(&self) -> std::result::Result<Vec<Expr>, ParseErrors> {
        parse_rules(&self.rules)
    }
}

/// A partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub rules: Option<Vec<Value>>,
    #[serde(rename = "type")]
    pub backend: Option<Backend>,
    pub fallback: Option<Vec<Backend>>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl PolicyPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_rules(mut self, rules: Vec<Value>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_fallback(mut self, fallback: Vec<Backend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Parses the replacement rules, if any.
    pub fn parse_rules(&self) -> std::result::Result<Option<Vec<Expr>>, ParseErrors> {
        self.rules.as_deref().map(parse_rules).transpose()
    }

    /// Validates the patch as it would apply to `current`.
    pub fn validate_against(&self, current: &Policy) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        let backend = self.backend.unwrap_or(current.backend);
        let fallback = self.fallback.as_deref().unwrap_or(&current.fallback);
        validate_fallback(backend, fallback)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(PolicyError::ValidationError("Policy name is required".to_string()));
    }
    Ok(())
}

fn validate_fallback(primary: Backend, fallback: &[Backend]) -> Result<()> {
    for (i, backend) in fallback.iter().enumerate() {
        if *backend == primary {
            return Err(PolicyError::ValidationError(format!(
                "fallback lists the declared backend '{}'",
                backend
            )));
        }
        if fallback[..i].contains(backend) {
            return Err(PolicyError::ValidationError(format!(
                "fallback lists '{}' more than once",
                backend
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_draft() -> PolicyDraft {
        PolicyDraft::new("Credential Access")
            .with_description("Only subjects may read their credentials")
            .with_rule(json!({"==": [{"var": "user.did"}, {"var": "credential.subject"}]}))
            .with_backend(Backend::CompiledArtifact)
            .with_fallback(vec![Backend::Native])
            .with_metadata("owner", json!("security"))
    }

    #[test]
    fn test_draft_builder() {
        let draft = sample_draft();
        assert_eq!(draft.rules.len(), 1);
        assert_eq!(draft.version, "1.0.0");
        assert!(draft.validate().is_ok());
        assert_eq!(draft.parse_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_draft_from_yaml() {
        let yaml = r#"
name: GDPR Consent
description: Processing requires consent
rules:
  - "==": [{var: user.consent}, true]
  - in: [{var: purpose}, {var: user.allowed_purposes}]
"#;
        let draft = PolicyDraft::from_yaml(yaml).unwrap();
        assert_eq!(draft.name, "GDPR Consent");
        assert_eq!(draft.backend, Backend::Native);
        assert_eq!(draft.rules.len(), 2);
    }

    #[test]
    fn test_fallback_validation() {
        let draft = PolicyDraft::new("p")
            .with_backend(Backend::Native)
            .with_fallback(vec![Backend::Native]);
        assert!(matches!(draft.validate(), Err(PolicyError::ValidationError(_))));

        let draft = PolicyDraft::new("p")
            .with_backend(Backend::CompiledArtifact)
            .with_fallback(vec![Backend::GeneratedSource, Backend::GeneratedSource]);
        assert!(matches!(draft.validate(), Err(PolicyError::ValidationError(_))));
    }

    #[test]
    fn test_blank_name_is_rejected() {
        assert!(PolicyDraft::from_json(r#"{"name": "  ", "rules": []}"#).is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_typed_rules() {
        let draft = sample_draft();
        let rules = draft.parse_rules().unwrap();
        let policy = Policy::from_draft("p-1".to_string(), draft, rules, Utc::now());

        let parsed = Policy::from_json(&policy.to_json().unwrap()).unwrap();
        assert_eq!(parsed, policy);

        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(value["type"], json!("compiled-artifact"));
        assert_eq!(value["rules"][0]["=="][0], json!({"var": "user.did"}));
    }

    #[test]
    fn test_malformed_rules_in_wire_form_are_parse_errors() {
        let value = json!({
            "id": "p-2",
            "name": "Broken",
            "rules": [null, {"nope": []}],
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        match Policy::from_value(value) {
            Err(PolicyError::ParseError(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected parse errors, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_patch_bumps_revision() {
        let mut policy = Policy::for_tests("p-3", Vec::new());
        let created = policy.updated_at;
        let patch = PolicyPatch::new()
            .with_description("updated")
            .with_rules(vec![json!({"var": "flag"})]);
        let rules = patch.parse_rules().unwrap();
        assert!(patch.validate_against(&policy).is_ok());
        policy.apply(patch, rules, Utc::now());

        assert_eq!(policy.id, "p-3");
        assert_eq!(policy.revision, 2);
        assert_eq!(policy.description, "updated");
        assert_eq!(policy.rules.len(), 1);
        assert!(policy.updated_at >= created);
    }

    #[test]
    fn test_backend_order() {
        let draft = sample_draft();
        let rules = draft.parse_rules().unwrap();
        let policy = Policy::from_draft("p-4".to_string(), draft, rules, Utc::now());
        let order: Vec<Backend> = policy.backend_order().collect();
        assert_eq!(order, vec![Backend::CompiledArtifact, Backend::Native]);
    }
}
