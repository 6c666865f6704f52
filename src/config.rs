//! Cluster-wide configuration, loaded the way the teacher's own
//! `AppConfig::new` loads settings: a `config::Config` builder with
//! defaults, an optional `Settings.toml` / `Settings.<RUN_MODE>.toml`
//! file, and environment overrides.

use std::env;

use config::{Config, ConfigError, Environment, File};
use dusa_collection_utils::core::logger::{set_log_level, LogLevel};
use serde::{Deserialize, Serialize};

use crate::errors;

/// `worker_culling_strategy` from `spec.md` §6.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CullingStrategy {
    Oldest,
    Youngest,
}

/// Fork-worker mode, carrying the auto-refork request threshold when
/// enabled (`spec.md` §6: "bool or int threshold").
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(untagged)]
pub enum ForkWorker {
    Disabled(bool),
    Threshold(u64),
}

impl ForkWorker {
    pub fn enabled(&self) -> bool {
        match self {
            ForkWorker::Disabled(b) => *b,
            ForkWorker::Threshold(_) => true,
        }
    }

    /// Request count at which `:ping!` auto-invokes `fork_worker!` on
    /// worker 0. `None` disables auto-refork (fork-worker still usable
    /// via an explicit SIGURG).
    pub fn auto_refork_threshold(&self) -> Option<u64> {
        match self {
            ForkWorker::Threshold(n) => Some(*n),
            ForkWorker::Disabled(_) => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterConfig {
    /// Process-title / log-prefix name for the application.
    pub app_name: String,
    /// Optional tag appended to the process title (`spec.md` §6).
    pub tag: Option<String>,

    /// Number of workers to keep alive.
    pub workers: u32,
    /// Seconds between a worker's last PING and it being killed for
    /// not checking in.
    pub worker_timeout: u64,
    /// Seconds a worker may take to send its first BOOT.
    pub worker_boot_timeout: u64,
    /// Seconds between a worker's PING messages.
    pub worker_check_interval: u64,
    /// Which workers `cull_workers` prefers to retire first.
    pub worker_culling_strategy: CullingStrategy,

    /// Fork-worker / mold mode.
    pub fork_worker: ForkWorker,
    /// Whether a promoted worker becomes a pure forking "mold".
    pub mold_worker: bool,
    /// Whether the application was preloaded before the first fork
    /// (enables copy-on-write sharing).
    pub preload_app: bool,
    /// Exit the master once every worker idle-times-out.
    pub idle_timeout: bool,
    /// Re-raise instead of swallowing a worker's own SIGTERM handler
    /// exception (informative only; enforced by the engine).
    pub raise_exception_on_sigterm: bool,
    /// Suppress the "running a single worker" warning some deployments
    /// intentionally want.
    pub silence_single_worker_warning: bool,

    pub debug_mode: bool,
}

impl ClusterConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("app_name", "cluster")?
            .set_default("tag", None::<String>)?
            .set_default("workers", 2)?
            .set_default("worker_timeout", 60)?
            .set_default("worker_boot_timeout", 60)?
            .set_default("worker_check_interval", 5)?
            .set_default("worker_culling_strategy", "oldest")?
            .set_default("fork_worker", false)?
            .set_default("mold_worker", false)?
            .set_default("preload_app", false)?
            .set_default("idle_timeout", false)?
            .set_default("raise_exception_on_sigterm", false)?
            .set_default("silence_single_worker_warning", false)?
            .set_default("debug_mode", false)?;

        let builder = builder.add_source(File::with_name("Settings").required(false));
        let builder =
            builder.add_source(File::with_name(&format!("Settings.{run_mode}")).required(false));
        let builder = builder.add_source(Environment::with_prefix("CLUSTER").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Mirrors `AppConfig::validate`: reject nonsensical option
    /// combinations before any worker spawns (`Errors::ConfigReading`
    /// per `spec.md` §7 `ConfigFatal`).
    pub fn validate(&self) -> Result<(), dusa_collection_utils::core::errors::ErrorArrayItem> {
        if self.workers == 0 {
            return Err(errors::config_fatal("workers must be >= 1"));
        }
        if self.mold_worker && !self.fork_worker.enabled() {
            return Err(errors::config_fatal(
                "mold_worker requires fork_worker to be enabled",
            ));
        }
        Ok(())
    }

    /// If debug mode is set, raise the global log level, matching
    /// `state_persistence::debug_log_set` in the teacher.
    pub fn apply_log_level(&self) {
        if self.debug_mode {
            set_log_level(LogLevel::Debug);
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            app_name: "cluster".into(),
            tag: None,
            workers: 2,
            worker_timeout: 60,
            worker_boot_timeout: 60,
            worker_check_interval: 5,
            worker_culling_strategy: CullingStrategy::Oldest,
            fork_worker: ForkWorker::Disabled(false),
            mold_worker: false,
            preload_app: false,
            idle_timeout: false,
            raise_exception_on_sigterm: false,
            silence_single_worker_warning: false,
            debug_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_fatal() {
        let cfg = ClusterConfig {
            workers: 0,
            ..ClusterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mold_without_fork_worker_is_fatal() {
        let cfg = ClusterConfig {
            mold_worker: true,
            fork_worker: ForkWorker::Disabled(false),
            ..ClusterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_implies_enabled() {
        assert!(ForkWorker::Threshold(1000).enabled());
        assert_eq!(
            ForkWorker::Threshold(1000).auto_refork_threshold(),
            Some(1000)
        );
        assert_eq!(ForkWorker::Disabled(true).auto_refork_threshold(), None);
    }

    /// Mirrors `state_persistence`'s `tempdir()`-backed round-trip tests:
    /// write a real `Settings.toml`, point `ClusterConfig::new()` at the
    /// directory it lives in, confirm the file overrides the defaults.
    #[test]
    fn new_picks_up_settings_toml_from_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Settings.toml"),
            "workers = 7\napp_name = \"from-file\"\n",
        )
        .unwrap();

        let original_cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        let loaded = ClusterConfig::new();
        env::set_current_dir(original_cwd).unwrap();

        let cfg = loaded.unwrap();
        assert_eq!(cfg.workers, 7);
        assert_eq!(cfg.app_name, "from-file");
    }
}
