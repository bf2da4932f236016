//! # Module registry.
//!
//! Maps an analysis `(namespace, name)` to the metadata of an installed
//! module. The scheduler consults it before admitting an analysis: a missing
//! module turns the analysis into an ERROR without touching the pool.
//!
//! [`StaticRegistry`] is an in-memory registry whose contents can change at
//! runtime (modules installed or removed while analyses exist).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

/// Lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module '{0}' is not installed")]
    NotInstalled(String),

    #[error("analysis '{name}' is not provided by module '{namespace}'")]
    AnalysisNotFound { namespace: String, name: String },
}

impl ModuleError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ModuleError::NotInstalled(_) => "module_not_installed",
            ModuleError::AnalysisNotFound { .. } => "module_analysis_not_found",
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Metadata describing one analysis of an installed module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisMeta {
    pub name: String,
    /// Runs arbitrary user code; created disabled unless explicitly enabled.
    pub arbitrary_code: bool,
    /// `(namespace, name)` of analyses bundled into every request of this one.
    pub addons: Vec<(String, String)>,
    /// Options whose changes never require recomputation.
    pub passive_options: Vec<String>,
}

impl AnalysisMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arbitrary_code(mut self) -> Self {
        self.arbitrary_code = true;
        self
    }

    #[must_use]
    pub fn with_addon(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.addons.push((namespace.into(), name.into()));
        self
    }

    #[must_use]
    pub fn with_passive_options<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.passive_options
            .extend(names.into_iter().map(Into::into));
        self
    }
}

/// Source of module metadata.
pub trait ModuleRegistry: Send + Sync + 'static {
    /// Metadata of `namespace::name`, or why it is unavailable.
    fn lookup(&self, namespace: &str, name: &str) -> Result<AnalysisMeta, ModuleError>;

    /// True if any analysis of `namespace` can be served.
    fn is_installed(&self, namespace: &str) -> bool;
}

/// In-memory registry.
#[derive(Default)]
pub struct StaticRegistry {
    modules: RwLock<HashMap<String, HashMap<String, AnalysisMeta>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) a module and its analyses, builder style.
    #[must_use]
    pub fn with_module<I>(self, namespace: impl Into<String>, analyses: I) -> Self
    where
        I: IntoIterator<Item = AnalysisMeta>,
    {
        self.install(namespace, analyses);
        self
    }

    /// Installs (or replaces) a module.
    pub fn install<I>(&self, namespace: impl Into<String>, analyses: I)
    where
        I: IntoIterator<Item = AnalysisMeta>,
    {
        let table = analyses
            .into_iter()
            .map(|meta| (meta.name.clone(), meta))
            .collect();
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.into(), table);
    }

    /// Removes a module; returns whether it was installed.
    pub fn uninstall(&self, namespace: &str) -> bool {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some()
    }
}

impl ModuleRegistry for StaticRegistry {
    fn lookup(&self, namespace: &str, name: &str) -> Result<AnalysisMeta, ModuleError> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let module = modules
            .get(namespace)
            .ok_or_else(|| ModuleError::NotInstalled(namespace.to_owned()))?;
        module
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::AnalysisNotFound {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })
    }

    fn is_installed(&self, namespace: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_reports_missing_module_and_analysis() {
        let reg = StaticRegistry::new().with_module("jmv", [AnalysisMeta::new("ttest")]);

        assert!(reg.is_installed("jmv"));
        assert_eq!(reg.lookup("jmv", "ttest").map(|m| m.name), Ok("ttest".into()));
        assert_eq!(
            reg.lookup("foo", "bar"),
            Err(ModuleError::NotInstalled("foo".into()))
        );
        assert!(matches!(
            reg.lookup("jmv", "anova"),
            Err(ModuleError::AnalysisNotFound { .. })
        ));
    }

    #[test]
    fn install_and_uninstall_at_runtime() {
        let reg = StaticRegistry::new();
        assert!(!reg.is_installed("foo"));
        reg.install("foo", [AnalysisMeta::new("bar").arbitrary_code()]);
        assert!(reg.lookup("foo", "bar").map(|m| m.arbitrary_code).unwrap_or(false));
        assert!(reg.uninstall("foo"));
        assert!(!reg.uninstall("foo"));
    }
}
