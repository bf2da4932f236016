use std::sync::Arc;

use crate::core::{Config, Runtime};
use crate::engine::{ProcessLauncher, WorkerLauncher};
use crate::error::RuntimeError;
use crate::modules::{ModuleRegistry, StaticRegistry};
use crate::subscribers::Subscribe;

/// Builder for a [`Runtime`].
///
/// Defaults: no subscribers, an empty [`StaticRegistry`] and a
/// [`ProcessLauncher`] for `cfg.engine`.
pub struct RuntimeBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    registry: Option<Arc<dyn ModuleRegistry>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
}

impl RuntimeBuilder {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            registry: None,
            launcher: None,
        }
    }

    /// Sets event subscribers.
    ///
    /// Each subscriber receives runtime events (engine lifecycle, pool
    /// pressure, settled analyses) through its own bounded queue.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the module registry used to resolve analyses.
    pub fn with_registry(mut self, registry: Arc<dyn ModuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the process launcher (in-memory workers, containers, ...).
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Validates the configuration and assembles the runtime.
    ///
    /// Nothing is spawned until [`Runtime::start`].
    pub fn build(self) -> Result<Arc<Runtime>, RuntimeError> {
        self.cfg.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticRegistry::new()));
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher::new(self.cfg.engine.clone())));
        Ok(Arc::new(Runtime::new_internal(
            self.cfg,
            self.subscribers,
            registry,
            launcher,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let cfg = Config {
            engine_count: 1,
            ..Config::default()
        };
        let err = Runtime::builder(cfg).build().err().expect("must fail");
        assert_eq!(err.as_label(), "runtime_config");
    }

    #[test]
    fn build_does_not_need_a_tokio_runtime() {
        let rt = Runtime::builder(Config::default()).build().expect("valid");
        assert_eq!(rt.config().engines(), 4);
        assert_eq!(rt.pool().capacity(), 4);
    }
}
