//! Error kinds surfaced by the supervisor.
//!
//! Orchestration code returns `anyhow::Result`; these variants travel inside
//! it so callers can still tell a classification failure from a step failure.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrthoError {
    /// An experiment's keys match zero or several handler methods.
    #[error("classification error: {0}")]
    Classification(String),
    /// `extends`/`via` names an unknown experiment, a `via` chain loops, or a
    /// module path cannot be found.
    #[error("resolution error: {0}")]
    Resolution(String),
    /// A configured source could not be imported.
    #[error("import error in {path}: {cause}")]
    Import { path: String, cause: String },
    /// Duplicate keys, colliding exports, reserved names and similar misuse.
    #[error("contract error: {0}")]
    Contract(String),
    /// Step directory creation or file registry failures.
    #[error("step error: {0}")]
    Step(String),
    #[error("config error: {0}")]
    Config(String),
}

impl OrthoError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrthoError::Classification(_) => "classification",
            OrthoError::Resolution(_) => "resolution",
            OrthoError::Import { .. } => "import",
            OrthoError::Contract(_) => "contract",
            OrthoError::Step(_) => "step",
            OrthoError::Config(_) => "config",
        }
    }
}
