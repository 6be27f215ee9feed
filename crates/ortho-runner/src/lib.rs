//! Experiment-driven supervisor: configuration, experiment classification,
//! module composition, step bookkeeping and script execution.

use std::path::{Path, PathBuf};

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod experiments;
pub mod handler;
pub mod importer;
pub mod reporter;
pub mod shell;
pub mod steps;

pub use config::{default_config, read_config, write_config};
pub use dispatch::{dispatch, DispatchOutcome};
pub use executor::{run_prepared, RunOutcome};
pub use experiments::{collect_experiments, Experiment, Experiments};
pub use handler::{classify, prep, Method, Prepared};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_ENV: &str = "ORTHO_CONFIG";

/// The directory a supervisor invocation works in. Relative paths recorded
/// in state, config and experiments are resolved against `root`.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config_path: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_path = root.join(CONFIG_FILE);
        Self { root, config_path }
    }

    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.config_path = if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        };
        self
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let rel = rel.as_ref();
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.root.join(rel)
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;
    use std::path::PathBuf;

    pub fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ortho_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ortho_core::ensure_dir(&dir).expect("scratch dir");
        dir
    }
}
