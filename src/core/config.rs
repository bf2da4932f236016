//! # Runtime configuration.
//!
//! [`Config`] centralizes the settings of a [`Runtime`](crate::Runtime): slot
//! budgets, engine count, time limits, restart pacing and the worker command.
//!
//! ## Sentinel values
//! - `engine_count = 0` → one engine per slot (`init_slots + run_slots`)
//! - `analysis_duration_limit = 0s` → no limit
//!
//! ## Environment overrides
//! [`Config::from_env`] starts from the defaults and applies, when set:
//!
//! | Variable                          | Field                      |
//! |-----------------------------------|----------------------------|
//! | `ENGINEVISOR_INIT_SLOTS`          | `init_slots`               |
//! | `ENGINEVISOR_RUN_SLOTS`           | `run_slots`                |
//! | `ENGINEVISOR_ENGINE_COUNT`        | `engine_count`             |
//! | `ENGINEVISOR_DURATION_LIMIT_SECS` | `analysis_duration_limit`  |
//! | `ENGINEVISOR_ENGINE_PROGRAM`      | `engine.program`           |
//! | `ENGINEVISOR_DATA_PATH`           | `engine.data_path`         |
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use enginevisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.run_slots = 2;
//! cfg.analysis_duration_limit = Duration::from_secs(600);
//!
//! assert_eq!(cfg.total_slots(), 3);
//! assert_eq!(cfg.engines(), 3);
//! assert!(cfg.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::policies::BackoffPolicy;

/// How to launch one worker process.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineCommand {
    /// Worker executable.
    pub program: PathBuf,
    /// Extra arguments, passed before `--path=`.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Passed to the worker as `--path=<data_path>`.
    pub data_path: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            data_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Full argument list handed to the executable.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        if let Some(path) = &self.data_path {
            argv.push(format!("--path={}", path.display()));
        }
        argv
    }
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::new("analysis-engine")
    }
}

/// Runtime configuration.
///
/// ## Field semantics
/// - `init_slots`: concurrent INIT requests
/// - `run_slots`: concurrent RUN and SAVE requests
/// - `engine_count`: worker processes (`0` = `init_slots + run_slots`)
/// - `analysis_duration_limit`: per-request wall clock limit (`0s` = none)
/// - `cancel_grace`: wait for an interrupted worker to acknowledge before restarting it
/// - `stop_timeout`: bound for each step of the stop escalation
/// - `restart_backoff`: pacing of relaunches after a failed launch
/// - `grace`: shutdown wait before reporting stuck engines
/// - `bus_capacity`: event bus ring buffer size (min 1)
#[derive(Clone, Debug)]
pub struct Config {
    pub init_slots: usize,
    pub run_slots: usize,
    pub engine_count: usize,
    pub analysis_duration_limit: Duration,
    pub cancel_grace: Duration,
    pub stop_timeout: Duration,
    pub restart_backoff: BackoffPolicy,
    pub grace: Duration,
    pub bus_capacity: usize,
    pub engine: EngineCommand,
}

impl Config {
    /// Upper bound on requests admitted at once.
    #[inline]
    pub fn total_slots(&self) -> usize {
        self.init_slots + self.run_slots
    }

    /// Number of engines to start.
    #[inline]
    pub fn engines(&self) -> usize {
        if self.engine_count == 0 {
            self.total_slots()
        } else {
            self.engine_count
        }
    }

    /// Duration limit as an `Option` (`None` = unlimited).
    #[inline]
    pub fn duration_limit(&self) -> Option<Duration> {
        if self.analysis_duration_limit.is_zero() {
            None
        } else {
            Some(self.analysis_duration_limit)
        }
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Checks the slot and engine budget.
    ///
    /// Every admitted request must be able to find an engine, so the total
    /// slot budget may not exceed the engine count.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let fail = |reason: String| -> Result<(), RuntimeError> {
            Err(RuntimeError::Config { reason })
        };
        if self.init_slots == 0 {
            return fail("init_slots must be at least 1".into());
        }
        if self.run_slots == 0 {
            return fail("run_slots must be at least 1".into());
        }
        if self.total_slots() > self.engines() {
            return fail(format!(
                "total slots ({}) exceed engine count ({})",
                self.total_slots(),
                self.engines()
            ));
        }
        if self.engine.program.as_os_str().is_empty() {
            return fail("engine program is empty".into());
        }
        Ok(())
    }

    /// Defaults overridden by `ENGINEVISOR_*` process environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(n) = parse(&lookup, "ENGINEVISOR_INIT_SLOTS")? {
            cfg.init_slots = n;
        }
        if let Some(n) = parse(&lookup, "ENGINEVISOR_RUN_SLOTS")? {
            cfg.run_slots = n;
        }
        if let Some(n) = parse(&lookup, "ENGINEVISOR_ENGINE_COUNT")? {
            cfg.engine_count = n;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ENGINEVISOR_DURATION_LIMIT_SECS")? {
            cfg.analysis_duration_limit = Duration::from_secs(secs);
        }
        if let Some(program) = lookup("ENGINEVISOR_ENGINE_PROGRAM") {
            cfg.engine.program = program.into();
        }
        if let Some(path) = lookup("ENGINEVISOR_DATA_PATH") {
            cfg.engine.data_path = Some(path.into());
        }
        Ok(cfg)
    }
}

fn parse<T, F>(lookup: &F, name: &str) -> Result<Option<T>, RuntimeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RuntimeError::Config {
                reason: format!("{name}={raw:?}: {e}"),
            }),
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `init_slots = 1`, `run_slots = 3`, `engine_count = 0` (four engines)
    /// - `analysis_duration_limit = 0s` (unlimited)
    /// - `cancel_grace = 1s`, `stop_timeout = 1s`
    /// - `restart_backoff = BackoffPolicy::default()`
    /// - `grace = 10s`, `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            init_slots: 1,
            run_slots: 3,
            engine_count: 0,
            analysis_duration_limit: Duration::ZERO,
            cancel_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            restart_backoff: BackoffPolicy::default(),
            grace: Duration::from_secs(10),
            bus_capacity: 1024,
            engine: EngineCommand::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert_eq!(cfg.total_slots(), 4);
        assert_eq!(cfg.engines(), 4);
        assert_eq!(cfg.duration_limit(), None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn fewer_engines_than_slots_is_rejected() {
        let cfg = Config {
            engine_count: 2,
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.as_label(), "runtime_config");
        assert!(err.to_string().contains("exceed engine count"));
    }

    #[test]
    fn zero_slots_are_rejected() {
        let cfg = Config {
            run_slots: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides() {
        let cfg = Config::from_env_with(env(&[
            ("ENGINEVISOR_INIT_SLOTS", "2"),
            ("ENGINEVISOR_RUN_SLOTS", " 1 "),
            ("ENGINEVISOR_DURATION_LIMIT_SECS", "90"),
            ("ENGINEVISOR_ENGINE_PROGRAM", "/opt/engine"),
            ("ENGINEVISOR_DATA_PATH", "/tmp/data"),
        ]))
        .unwrap();
        assert_eq!((cfg.init_slots, cfg.run_slots), (2, 1));
        assert_eq!(cfg.duration_limit(), Some(Duration::from_secs(90)));
        assert_eq!(cfg.engine.program, PathBuf::from("/opt/engine"));
        assert_eq!(cfg.engine.argv(), vec!["--path=/tmp/data".to_string()]);
    }

    #[test]
    fn malformed_env_value_names_the_variable() {
        let err = Config::from_env_with(env(&[("ENGINEVISOR_ENGINE_COUNT", "many")])).unwrap_err();
        assert!(err.to_string().contains("ENGINEVISOR_ENGINE_COUNT"));
    }
}
