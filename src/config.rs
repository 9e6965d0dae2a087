//! Environment-driven configuration (`spec.md` §6).
//!
//! The teacher loads configuration by layering a TOML file under
//! `get_config_dir()` with a `GFLOW_`-prefixed environment overlay
//! (`config::Environment::with_prefix`). This spec's configuration surface
//! is env-var only (`STATE_DIR`, `DB_PATH`, `MAX_WORKERS`, `MEMORY_LIMITS`,
//! `NO_GPU`, `TEST_MODE`, `GPU_ENV_VAR`), so `Config::from_env` keeps the
//! teacher's "read once into a typed struct with defaults" shape without the
//! file-layering machinery that has nothing left to layer.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Name of the environment variable injected into a worker's child process
/// to advertise its assigned GPU indices, when `GPU_ENV_VAR` is unset.
pub const DEFAULT_GPU_ENV_VAR: &str = "NVIDIA_VISIBLE_DEVICES";

/// Default number of worker slots when `MAX_WORKERS` is unset.
pub const DEFAULT_MAX_WORKERS: usize = 1;

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_workers: usize,
    pub memory_limits: HashMap<String, u32>,
    pub no_gpu: bool,
    pub test_mode: bool,
    pub gpu_env_var: String,
}

impl Config {
    /// Build configuration from the process environment.
    ///
    /// `STATE_DIR` defaults to `$XDG_STATE_HOME/ravel` (via `dirs`, mirroring
    /// the teacher's `get_config_dir`/`get_data_dir` helpers in
    /// `src/core/mod.rs`) when unset. `DB_PATH` defaults to
    /// `STATE_DIR/ravel.db`.
    pub fn from_env() -> Result<Self> {
        let state_dir = match env::var_os("STATE_DIR") {
            Some(v) => PathBuf::from(v),
            None => dirs::state_dir()
                .or_else(dirs::data_dir)
                .context("could not determine a default STATE_DIR; set STATE_DIR explicitly")?
                .join("ravel"),
        };

        let db_path = match env::var_os("DB_PATH") {
            Some(v) => PathBuf::from(v),
            None => state_dir.join("ravel.db"),
        };

        let max_workers = match env::var("MAX_WORKERS") {
            Ok(v) => v
                .parse::<usize>()
                .context("MAX_WORKERS must be a positive integer")?
                .max(1),
            Err(_) => DEFAULT_MAX_WORKERS,
        };

        let memory_limits = match env::var("MEMORY_LIMITS") {
            Ok(v) => parse_memory_limits(&v)?,
            Err(_) => HashMap::new(),
        };

        let no_gpu = env::var_os("NO_GPU").is_some();
        let test_mode = env::var_os("TEST_MODE").is_some();

        let gpu_env_var =
            env::var("GPU_ENV_VAR").unwrap_or_else(|_| DEFAULT_GPU_ENV_VAR.to_string());

        Ok(Self {
            state_dir,
            db_path,
            max_workers,
            memory_limits,
            no_gpu,
            test_mode,
            gpu_env_var,
        })
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }
}

/// Parse `"tag=int,tag=int"` into a ceiling table. `spec.md` §6.
fn parse_memory_limits(raw: &str) -> Result<HashMap<String, u32>> {
    let mut limits = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (tag, limit) = pair
            .split_once('=')
            .with_context(|| format!("invalid MEMORY_LIMITS entry {pair:?}, expected tag=int"))?;
        let limit: u32 = limit
            .trim()
            .parse()
            .with_context(|| format!("invalid MEMORY_LIMITS ceiling in {pair:?}"))?;
        limits.insert(tag.trim().to_string(), limit);
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_tag_limits() {
        let limits = parse_memory_limits("large=1,small=4").unwrap();
        assert_eq!(limits.get("large"), Some(&1));
        assert_eq!(limits.get("small"), Some(&4));
    }

    #[test]
    fn empty_memory_limits_string_yields_no_ceilings() {
        assert!(parse_memory_limits("").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_memory_limits("large").is_err());
        assert!(parse_memory_limits("large=notanumber").is_err());
    }
}
