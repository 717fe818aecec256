//! Out-of-process OPA toolchain.
//!
//! Every invocation runs inside a fresh [`WorkArea`], a temporary directory
//! removed when the area is dropped. Child processes are killed if their
//! future is dropped, so a timeout never leaves a process behind.

use crate::canonicalization::canonicalize;
use crate::codegen::{ALLOW_RULE, REASONS_RULE};
use crate::config::ToolchainConfig;
use crate::decision::{EvaluationResult, DEFAULT_ALLOW_REASON, DEFAULT_DENY_REASON};
use crate::error::EvaluationError;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

pub const SOURCE_FILE: &str = "policy.rego";
pub const INPUT_FILE: &str = "input.json";
pub const BUNDLE_FILE: &str = "bundle.tar.gz";

/// Runtime target for compiled bundles.
pub const WASM_TARGET: &str = "wasm";

const WORK_AREA_PREFIX: &str = "fuse-policy-";

lazy_static! {
    static ref RULE_KEY: Regex = Regex::new(r"^rule_(\d+)$").expect("invalid regex");
    static ref REASON_INDEX: Regex = Regex::new(r"^rule_(\d+)\b").expect("invalid regex");
}

type ToolResult<T> = std::result::Result<T, EvaluationError>;

/// A temporary directory for one toolchain invocation.
#[derive(Debug)]
pub struct WorkArea {
    dir: TempDir,
}

impl WorkArea {
    /// Creates a work area under `base`, or the system temp dir.
    pub fn create(base: Option<&Path>) -> ToolResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORK_AREA_PREFIX);
        let dir = match base {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `contents` to `name` inside the area and returns its path.
    pub async fn write(&self, name: &str, contents: &[u8]) -> ToolResult<PathBuf> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Serializes `value` to `name` inside the area.
    pub async fn write_json(&self, name: &str, value: &Value) -> ToolResult<PathBuf> {
        let bytes = serde_json::to_vec(value).map_err(|e| EvaluationError::WorkArea(e.to_string()))?;
        self.write(name, &bytes).await
    }
}

/// Drives `opa build` and `opa eval`.
#[derive(Debug, Clone)]
pub struct OpaToolchain {
    config: ToolchainConfig,
}

impl OpaToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// Compiles `source` into a wasm bundle and returns the bundle bytes.
    pub async fn compile(&self, package: &str, source: &str) -> ToolResult<Vec<u8>> {
        let area = self.work_area()?;
        let source_path = area.write(SOURCE_FILE, source.as_bytes()).await?;
        let bundle_path = area.path().join(BUNDLE_FILE);

        let args: Vec<OsString> = vec![
            "build".into(),
            "-t".into(),
            WASM_TARGET.into(),
            "-e".into(),
            format!("{}/{}", package, ALLOW_RULE).into(),
            "-e".into(),
            format!("{}/{}", package, REASONS_RULE).into(),
            "-o".into(),
            bundle_path.clone().into(),
            source_path.into(),
        ];

        let output = self.run(args, self.config.compile_timeout()).await?;
        if !output.status.success() {
            return Err(EvaluationError::CompileFailed(failure_message(&output)));
        }

        Ok(tokio::fs::read(&bundle_path).await?)
    }

    /// Evaluates generated source directly.
    pub async fn evaluate_source(&self, package: &str, source: &str, input: &Value) -> ToolResult<EvaluationResult> {
        let area = self.work_area()?;
        let source_path = area.write(SOURCE_FILE, source.as_bytes()).await?;
        let input_path = area.write_json(INPUT_FILE, input).await?;

        self.eval(package, vec!["--data".into(), source_path.into()], input_path)
            .await
    }

    /// Evaluates a compiled bundle on the wasm runtime.
    pub async fn evaluate_bundle(&self, package: &str, bundle: &[u8], input: &Value) -> ToolResult<EvaluationResult> {
        let area = self.work_area()?;
        let bundle_path = area.write(BUNDLE_FILE, bundle).await?;
        let input_path = area.write_json(INPUT_FILE, input).await?;

        let module_args: Vec<OsString> = vec![
            "--target".into(),
            WASM_TARGET.into(),
            "--bundle".into(),
            bundle_path.into(),
        ];
        self.eval(package, module_args, input_path).await
    }

    fn work_area(&self) -> ToolResult<WorkArea> {
        WorkArea::create(self.config.work_dir.as_deref())
    }

    async fn eval(&self, package: &str, module_args: Vec<OsString>, input_path: PathBuf) -> ToolResult<EvaluationResult> {
        let mut args: Vec<OsString> = vec!["eval".into()];
        args.extend(module_args);
        args.extend([
            "--input".into(),
            input_path.into(),
            "--format".into(),
            "json".into(),
            format!("data.{}", package).into(),
        ]);

        let output = self.run(args, self.config.eval_timeout()).await?;
        if !output.status.success() {
            return Err(EvaluationError::EvalFailed(failure_message(&output)));
        }

        parse_eval_output(&output.stdout)
    }

    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> ToolResult<Output> {
        let command = describe_command(&self.config.binary, &args);
        debug!(command = %command, timeout_ms = timeout.as_millis() as u64, "Running toolchain command");

        let started = Instant::now();
        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvaluationError::ToolchainUnavailable {
                binary: self.config.binary.clone(),
                message: e.to_string(),
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                debug!(
                    command = %command,
                    status = %output.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Toolchain command finished"
                );
                Ok(output)
            }
            Ok(Err(e)) => Err(EvaluationError::EvalFailed(format!("'{}' failed to run: {}", command, e))),
            Err(_) => Err(EvaluationError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn describe_command(binary: &str, args: &[OsString]) -> String {
    let mut command = binary.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(&arg.to_string_lossy());
    }
    command
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        format!("{}: {}", output.status, stdout.trim())
    } else {
        format!("{}: {}", output.status, stderr)
    }
}

/// Parses `opa eval --format json` output for a `data.<package>` query.
pub fn parse_eval_output(stdout: &[u8]) -> ToolResult<EvaluationResult> {
    let document: Value = serde_json::from_slice(stdout)
        .map_err(|e| EvaluationError::MalformedOutput(format!("invalid JSON: {}", e)))?;

    let value = document
        .get("result")
        .and_then(|results| results.get(0))
        .and_then(|result| result.get("expressions"))
        .and_then(|expressions| expressions.get(0))
        .and_then(|expression| expression.get("value"))
        .ok_or_else(|| EvaluationError::MalformedOutput("query result is undefined".to_string()))?;

    decision_from_document(value)
}

/// Extracts the decision from the evaluated package document.
pub fn decision_from_document(document: &Value) -> ToolResult<EvaluationResult> {
    let package = document
        .as_object()
        .ok_or_else(|| EvaluationError::MalformedOutput("package document is not an object".to_string()))?;

    let allow = match package.get(ALLOW_RULE) {
        Some(Value::Bool(allow)) => *allow,
        Some(other) => {
            return Err(EvaluationError::MalformedOutput(format!(
                "'{}' is not a boolean: {}",
                ALLOW_RULE,
                canonicalize(other)
            )))
        }
        None => return Err(EvaluationError::MalformedOutput(format!("'{}' is missing", ALLOW_RULE))),
    };

    let mut reasons: Vec<String> = match package.get(REASONS_RULE) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(reason)) => vec![reason.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(reason) => reason.clone(),
                other => canonicalize(other),
            })
            .collect(),
        Some(other) => {
            return Err(EvaluationError::MalformedOutput(format!(
                "'{}' is not a list: {}",
                REASONS_RULE,
                canonicalize(other)
            )))
        }
    };

    reasons.sort_by(|a, b| (reason_index(a), a).cmp(&(reason_index(b), b)));
    if reasons.is_empty() {
        let default = if allow { DEFAULT_ALLOW_REASON } else { DEFAULT_DENY_REASON };
        reasons.push(default.to_string());
    }

    let data: Map<String, Value> = package
        .iter()
        .filter(|(key, _)| RULE_KEY.is_match(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(EvaluationResult::decided(allow, reasons).with_data(Value::Object(data)))
}

fn reason_index(reason: &str) -> usize {
    REASON_INDEX
        .captures(reason)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_eval_output() {
        let stdout = json!({
            "result": [{
                "expressions": [{
                    "value": {
                        "allow": false,
                        "reasons": ["rule_0 passed", "rule_1 failed", "rule_10 passed", "rule_2 passed"],
                        "rule_0": true,
                        "rule_1": false,
                        "rule_1_0": true,
                        "rule_2": true,
                        "rule_10": true
                    },
                    "text": "data.test_policy"
                }]
            }]
        });

        let result = parse_eval_output(stdout.to_string().as_bytes()).unwrap();
        assert!(!result.allow);
        assert_eq!(
            result.reasons,
            vec!["rule_0 passed", "rule_1 failed", "rule_2 passed", "rule_10 passed"]
        );
        assert_eq!(
            result.data,
            Some(json!({"rule_0": true, "rule_1": false, "rule_2": true, "rule_10": true}))
        );
    }

    #[test]
    fn test_missing_reasons_get_defaults() {
        let allowed = decision_from_document(&json!({"allow": true})).unwrap();
        assert_eq!(allowed.reasons, vec![DEFAULT_ALLOW_REASON]);

        let denied = decision_from_document(&json!({"allow": false, "reasons": []})).unwrap();
        assert_eq!(denied.reasons, vec![DEFAULT_DENY_REASON]);
    }

    #[test]
    fn test_malformed_output() {
        let cases: Vec<&[u8]> = vec![
            b"not json",
            br#"{}"#,
            br#"{"result": []}"#,
            br#"{"result": [{"expressions": [{"value": 3}]}]}"#,
            br#"{"result": [{"expressions": [{"value": {"allow": "yes"}}]}]}"#,
            br#"{"result": [{"expressions": [{"value": {"reasons": []}}]}]}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_eval_output(case), Err(EvaluationError::MalformedOutput(_))),
                "accepted {}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let work = tempfile::tempdir().unwrap();
        let toolchain = OpaToolchain::new(ToolchainConfig {
            binary: "/nonexistent/fuse-policy-opa".to_string(),
            work_dir: Some(work.path().to_path_buf()),
            ..ToolchainConfig::default()
        });

        let err = toolchain.compile("p", "package p").await.unwrap_err();
        assert!(matches!(err, EvaluationError::ToolchainUnavailable { .. }));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    mod fake_opa {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        struct Fixture {
            _bin: TempDir,
            work: TempDir,
            toolchain: OpaToolchain,
        }

        impl Fixture {
            fn new(script: &str, eval_timeout_ms: u64) -> Self {
                let bin = tempfile::tempdir().unwrap();
                let path = bin.path().join("opa");
                std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

                let work = tempfile::tempdir().unwrap();
                let toolchain = OpaToolchain::new(ToolchainConfig {
                    binary: path.to_string_lossy().into_owned(),
                    eval_timeout_ms,
                    compile_timeout_ms: 5_000,
                    work_dir: Some(work.path().to_path_buf()),
                });
                Self { _bin: bin, work, toolchain }
            }

            fn leftovers(&self) -> usize {
                std::fs::read_dir(self.work.path()).unwrap().count()
            }
        }

        const BUILD_SCRIPT: &str = r#"
if [ "$1" = "build" ]; then
  while [ $# -gt 0 ]; do
    if [ "$1" = "-o" ]; then printf 'wasm-bundle' > "$2"; fi
    shift
  done
  exit 0
fi
exit 3"#;

        #[tokio::test]
        async fn test_compile_returns_bundle_and_cleans_up() {
            let fixture = Fixture::new(BUILD_SCRIPT, 5_000);
            let bundle = fixture.toolchain.compile("p", "package p").await.unwrap();
            assert_eq!(bundle, b"wasm-bundle");
            assert_eq!(fixture.leftovers(), 0);
        }

        #[tokio::test]
        async fn test_compile_failure() {
            let fixture = Fixture::new("echo 'rego_parse_error: unexpected token' >&2\nexit 1", 5_000);
            let err = fixture.toolchain.compile("p", "package p").await.unwrap_err();
            match err {
                EvaluationError::CompileFailed(message) => assert!(message.contains("rego_parse_error")),
                other => panic!("expected compile failure, got {:?}", other),
            }
            assert_eq!(fixture.leftovers(), 0);
        }

        #[tokio::test]
        async fn test_evaluate_source_parses_decision() {
            let script = r#"cat <<'EOF'
{"result": [{"expressions": [{"value": {"allow": true, "reasons": ["rule_0 passed"], "rule_0": true}}]}]}
EOF"#;
            let fixture = Fixture::new(script, 5_000);
            let result = fixture
                .toolchain
                .evaluate_source("p", "package p", &json!({"value": 50}))
                .await
                .unwrap();

            assert!(result.allow);
            assert_eq!(result.reasons, vec!["rule_0 passed"]);
            assert_eq!(fixture.leftovers(), 0);
        }

        #[tokio::test]
        async fn test_evaluate_bundle_receives_input_file() {
            let script = r#"
input=""
target=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--input" ]; then input="$2"; fi
  if [ "$1" = "--target" ]; then target="$2"; fi
  shift
done
[ "$target" = "wasm" ] || { echo "bundle evaluated without the wasm target" >&2; exit 2; }
if grep -q '"value":50' "$input"; then allow=true; else allow=false; fi
echo "{\"result\": [{\"expressions\": [{\"value\": {\"allow\": $allow}}]}]}""#;
            let fixture = Fixture::new(script, 5_000);
            let result = fixture
                .toolchain
                .evaluate_bundle("p", b"wasm-bundle", &json!({"value": 50}))
                .await
                .unwrap();

            assert!(result.allow);
            assert_eq!(result.reasons, vec![DEFAULT_ALLOW_REASON]);
        }

        #[tokio::test]
        async fn test_evaluate_source_uses_default_target() {
            let script = r#"
for arg in "$@"; do
  if [ "$arg" = "--target" ] || [ "$arg" = "--bundle" ]; then echo "unexpected $arg" >&2; exit 2; fi
done
echo '{"result": [{"expressions": [{"value": {"allow": false}}]}]}'"#;
            let fixture = Fixture::new(script, 5_000);
            let result = fixture
                .toolchain
                .evaluate_source("p", "package p", &json!({}))
                .await
                .unwrap();
            assert!(!result.allow);
        }

        #[tokio::test]
        async fn test_eval_timeout_kills_and_cleans_up() {
            let fixture = Fixture::new("sleep 5", 100);
            let started = Instant::now();
            let err = fixture
                .toolchain
                .evaluate_source("p", "package p", &json!({}))
                .await
                .unwrap_err();

            assert!(matches!(err, EvaluationError::Timeout { timeout_ms: 100, .. }));
            assert!(err.is_transient());
            assert!(started.elapsed() < Duration::from_secs(4));
            assert_eq!(fixture.leftovers(), 0);
        }

        #[tokio::test]
        async fn test_eval_crash_is_reported() {
            let fixture = Fixture::new("echo 'panic: runtime error' >&2\nkill -9 $$", 5_000);
            let err = fixture
                .toolchain
                .evaluate_source("p", "package p", &json!({}))
                .await
                .unwrap_err();

            match err {
                EvaluationError::EvalFailed(message) => assert!(message.contains("panic")),
                other => panic!("expected eval failure, got {:?}", other),
            }
            assert_eq!(fixture.leftovers(), 0);
        }

        #[tokio::test]
        async fn test_garbage_output_is_malformed() {
            let fixture = Fixture::new("echo 'hello'", 5_000);
            let err = fixture
                .toolchain
                .evaluate_source("p", "package p", &json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, EvaluationError::MalformedOutput(_)));
        }
    }
}
