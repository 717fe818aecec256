//! Fuse Policy Engine
//!
//! Compiles JSON rule expressions to Rego and evaluates policies with one of
//! three backends:
//!
//! - `native`: a tree-walking interpreter, the reference semantics
//! - `generated-source`: `opa eval` over the generated Rego module
//! - `compiled-artifact`: `opa build -t wasm`, then `opa eval` on the wasm target
//!
//! Every backend is derived from the same parsed [`Expr`] tree and returns
//! the same [`EvaluationResult`] shape.

pub mod artifact;
pub mod canonicalization;
pub mod codegen;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod hash;
pub mod orchestrator;
pub mod parser;
pub mod policy;
pub mod remote;
pub mod store;
pub mod toolchain;
pub mod types;

pub use artifact::{ArtifactCache, CompiledArtifact};
pub use config::{EngineConfig, RemoteConfig, ToolchainConfig};
pub use context::EvaluationContext;
pub use decision::{Decision, EvaluationResult, FallbackRecord};
pub use error::{EvaluationError, ParseErrors, PolicyError, Result};
pub use evaluator::NativeEvaluator;
pub use expr::{Expr, VarPath};
pub use orchestrator::PolicyEngine;
pub use policy::{Policy, PolicyDraft, PolicyPatch};
pub use remote::{HttpPolicySource, PolicySource};
pub use store::PolicyStore;
pub use toolchain::OpaToolchain;

/// Version of the policy engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::decision::{Decision, EvaluationResult};
    pub use crate::error::{PolicyError, Result};
    pub use crate::orchestrator::PolicyEngine;
    pub use crate::policy::{Policy, PolicyDraft, PolicyPatch};
    pub use crate::store::PolicyStore;
    pub use crate::types::*;
}
