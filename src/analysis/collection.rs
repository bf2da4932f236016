//! # AnalysisCollection: the analyses of one instance, in order.
//!
//! Owns every [`Analysis`] of an instance and exposes the three ordered views
//! the scheduler drains:
//!
//! | view         | selects                                         |
//! |--------------|-------------------------------------------------|
//! | `needs_init` | status NONE, enabled, not built-in              |
//! | `needs_op`   | status COMPLETE with an undispatched pending op |
//! | `needs_run`  | status INITED, enabled, not built-in            |
//!
//! Order is insertion order. Mutating wrappers (`set_options`, `run`, ...)
//! record the id in a change list when the analysis needs scheduling; the
//! scheduler drains it with [`AnalysisCollection::take_changed`].
//!
//! ## Ids
//! Ids allocated here are odd (`next_id += 2`); ids supplied by clients must
//! be even so the two sources never collide.

use std::sync::Arc;

use thiserror::Error;

use crate::error::OpError;
use crate::modules::{ModuleError, ModuleRegistry};
use crate::options::{OptionMap, Options, OptionsError};
use crate::protocol::{AnalysisId, InstanceId};

use super::analysis::{Analysis, AnalysisStatus, OpKind, OpReply};
use super::builtin::Builtin;

/// Rejections raised by collection operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("analysis {0} not found")]
    NotFound(AnalysisId),

    #[error("analysis id {0} already exists")]
    DuplicateId(AnalysisId),

    #[error("client analysis ids must be even, got {0}")]
    OddClientId(AnalysisId),

    #[error("instance '{0}' not found")]
    UnknownInstance(InstanceId),

    #[error(transparent)]
    Options(#[from] OptionsError),
}

impl CollectionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CollectionError::NotFound(_) => "collection_not_found",
            CollectionError::DuplicateId(_) => "collection_duplicate_id",
            CollectionError::OddClientId(_) => "collection_odd_client_id",
            CollectionError::UnknownInstance(_) => "collection_unknown_instance",
            CollectionError::Options(e) => e.as_label(),
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Request to create an analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewAnalysis {
    /// `0` allocates a server-side (odd) id.
    pub id: AnalysisId,
    pub namespace: String,
    pub name: String,
    /// Serialized initial options.
    pub options: Vec<u8>,
    /// `None` applies the module policy (disabled if it runs arbitrary code).
    pub enabled: Option<bool>,
    /// Insert position; `None` appends.
    pub index: Option<usize>,
}

impl NewAnalysis {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: AnalysisId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: impl Options) -> Self {
        self.options = options.as_wire_bytes();
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Ordered analyses of one instance.
pub struct AnalysisCollection {
    instance_id: InstanceId,
    registry: Arc<dyn ModuleRegistry>,
    analyses: Vec<Analysis>,
    next_id: AnalysisId,
    changed: Vec<AnalysisId>,
}

impl AnalysisCollection {
    pub fn new(instance_id: InstanceId, registry: Arc<dyn ModuleRegistry>) -> Self {
        Self {
            instance_id,
            registry,
            analyses: Vec::new(),
            next_id: 1,
            changed: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn len(&self) -> usize {
        self.analyses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Analysis> {
        self.analyses.iter()
    }

    pub fn get(&self, id: AnalysisId) -> Option<&Analysis> {
        self.analyses.iter().find(|a| a.id() == id)
    }

    pub fn get_mut(&mut self, id: AnalysisId) -> Option<&mut Analysis> {
        self.analyses.iter_mut().find(|a| a.id() == id)
    }

    pub fn contains(&self, id: AnalysisId) -> bool {
        self.get(id).is_some()
    }

    fn index_of(&self, id: AnalysisId) -> Result<usize, CollectionError> {
        self.analyses
            .iter()
            .position(|a| a.id() == id)
            .ok_or(CollectionError::NotFound(id))
    }

    fn allocate_id(&mut self) -> AnalysisId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }

    fn mark_changed(&mut self, id: AnalysisId) {
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    /// Drains the ids that need a scheduling pass, in the order they changed.
    pub fn take_changed(&mut self) -> Vec<AnalysisId> {
        std::mem::take(&mut self.changed)
    }

    /// Creates an analysis and returns its id.
    pub fn create(&mut self, spec: NewAnalysis) -> Result<AnalysisId, CollectionError> {
        let id = match spec.id {
            0 => self.allocate_id(),
            id if id % 2 == 1 => return Err(CollectionError::OddClientId(id)),
            id if self.contains(id) => return Err(CollectionError::DuplicateId(id)),
            id => id,
        };

        let analysis = self.construct(id, &spec.namespace, &spec.name, &spec.options, spec.enabled)?;
        let schedule = analysis.status() == AnalysisStatus::None;

        let index = spec.index.unwrap_or(self.analyses.len()).min(self.analyses.len());
        self.analyses.insert(index, analysis);
        if schedule {
            self.mark_changed(id);
        }
        Ok(id)
    }

    /// Inserts an empty annotation right after `patron` and links the two.
    pub fn create_annotation(&mut self, patron: AnalysisId) -> Result<AnalysisId, CollectionError> {
        let index = self.index_of(patron)?;
        let id = self.allocate_id();
        let mut annotation = Analysis::new_builtin(
            self.instance_id.clone(),
            id,
            Builtin::Empty,
            OptionMap::new(),
        );
        annotation.set_depends_on(Some(patron));
        self.analyses.insert(index + 1, annotation);
        self.analyses[index].add_dependent(id);
        Ok(id)
    }

    fn construct(
        &self,
        id: AnalysisId,
        namespace: &str,
        name: &str,
        options: &[u8],
        enabled: Option<bool>,
    ) -> Result<Analysis, CollectionError> {
        if let Some(kind) = Builtin::from_name(namespace, name) {
            let options = OptionMap::from_bytes(options)?;
            return Ok(Analysis::new_builtin(
                self.instance_id.clone(),
                id,
                kind,
                options,
            ));
        }

        match self.registry.lookup(namespace, name) {
            Ok(meta) => {
                let mut map = OptionMap::new().with_passive(meta.passive_options.iter().cloned());
                map.apply_wire_bytes(options)?;
                let enabled = enabled.unwrap_or(!meta.arbitrary_code);
                let mut analysis = Analysis::new(
                    self.instance_id.clone(),
                    id,
                    namespace,
                    name,
                    Box::new(map),
                    enabled,
                );
                analysis.set_addons(self.construct_addons(id, &meta.addons));
                Ok(analysis)
            }
            Err(e) => {
                // Kept schedulable so admission reports the missing module.
                tracing::debug!(namespace, name, error = %e, "creating analysis without module");
                let mut map = OptionMap::new();
                map.apply_wire_bytes(options)?;
                Ok(Analysis::new(
                    self.instance_id.clone(),
                    id,
                    namespace,
                    name,
                    Box::new(map),
                    enabled.unwrap_or(true),
                ))
            }
        }
    }

    fn construct_addons(&self, id: AnalysisId, addons: &[(String, String)]) -> Vec<Analysis> {
        addons
            .iter()
            .map(|(namespace, name)| {
                let passive = self
                    .registry
                    .lookup(namespace, name)
                    .map(|meta| meta.passive_options)
                    .unwrap_or_default();
                Analysis::new(
                    self.instance_id.clone(),
                    id,
                    namespace.as_str(),
                    name.as_str(),
                    Box::new(OptionMap::new().with_passive(passive)),
                    true,
                )
            })
            .collect()
    }

    /// Removes an analysis, detaching it from its patron and dependents.
    ///
    /// Pending ops are rejected and the returned analysis is DELETED.
    pub fn remove(&mut self, id: AnalysisId) -> Result<Analysis, CollectionError> {
        let index = self.index_of(id)?;
        let mut analysis = self.analyses.remove(index);

        for child in analysis.dependents().to_vec() {
            if let Some(child) = self.get_mut(child) {
                child.set_depends_on(None);
            }
        }
        if let Some(patron) = analysis.depends_on().and_then(|p| self.get_mut(p)) {
            patron.remove_dependent(id);
        }

        analysis.fail_ops(OpError::Deleted);
        analysis.set_status(AnalysisStatus::Deleted);
        self.changed.retain(|c| *c != id);
        Ok(analysis)
    }

    /// See [`Analysis::set_options`].
    pub fn set_options(
        &mut self,
        id: AnalysisId,
        options: &[u8],
        changed: &[String],
        revision: u64,
        enabled: Option<bool>,
    ) -> Result<bool, CollectionError> {
        let analysis = self.get_mut(id).ok_or(CollectionError::NotFound(id))?;
        let schedule = analysis.set_options(options, changed, revision, enabled)?;
        if schedule {
            self.mark_changed(id);
        }
        Ok(schedule)
    }

    /// See [`Analysis::run`].
    pub fn run(&mut self, id: AnalysisId) -> Result<bool, CollectionError> {
        let analysis = self.get_mut(id).ok_or(CollectionError::NotFound(id))?;
        let schedule = analysis.run();
        if schedule {
            self.mark_changed(id);
        }
        Ok(schedule)
    }

    /// See [`Analysis::rerun`].
    pub fn rerun(&mut self, id: AnalysisId) -> Result<bool, CollectionError> {
        let analysis = self.get_mut(id).ok_or(CollectionError::NotFound(id))?;
        let schedule = analysis.rerun();
        if schedule {
            self.mark_changed(id);
        }
        Ok(schedule)
    }

    /// Reruns every enabled analysis; returns how many were rescheduled.
    pub fn rerun_all(&mut self) -> usize {
        let ids: Vec<AnalysisId> = self
            .analyses
            .iter_mut()
            .filter(|a| a.enabled())
            .filter_map(|a| a.rerun().then_some(a.id()))
            .collect();
        for id in &ids {
            self.mark_changed(*id);
        }
        ids.len()
    }

    /// See [`Analysis::queue_op`].
    pub fn queue_op(&mut self, id: AnalysisId, kind: OpKind) -> Result<OpReply, CollectionError> {
        let analysis = self.get_mut(id).ok_or(CollectionError::NotFound(id))?;
        let (reply, notify) = analysis.queue_op(kind);
        if notify {
            self.mark_changed(id);
        }
        Ok(reply)
    }

    /// A module was (re)installed: re-resolve its analyses and rerun them.
    pub fn module_installed(&mut self, namespace: &str) -> usize {
        let mut rerun = Vec::new();
        for index in 0..self.analyses.len() {
            let analysis = &self.analyses[index];
            if analysis.namespace() != namespace || analysis.is_builtin() {
                continue;
            }
            let id = analysis.id();
            let Ok(meta) = self.registry.lookup(namespace, analysis.name()) else {
                continue;
            };
            let addons = self.construct_addons(id, &meta.addons);
            let analysis = &mut self.analyses[index];
            analysis.set_addons(addons);
            if analysis.rerun() {
                rerun.push(id);
            }
        }
        for id in &rerun {
            self.mark_changed(*id);
        }
        rerun.len()
    }

    /// Checks that a worker can serve `id`: its module is installed and provides it.
    pub fn resolve(&self, id: AnalysisId) -> Result<(), ModuleError> {
        match self.get(id) {
            Some(a) if !a.is_builtin() => self.registry.lookup(a.namespace(), a.name()).map(drop),
            _ => Ok(()),
        }
    }

    /// Answers every pending op of every analysis with `err`.
    pub fn fail_all_ops(&mut self, err: OpError) {
        for analysis in &mut self.analyses {
            analysis.fail_ops(err.clone());
        }
    }

    /// Analyses waiting for their first (or a fresh) INIT.
    pub fn needs_init(&self) -> impl Iterator<Item = &Analysis> {
        self.analyses.iter().filter(|a| {
            !a.is_builtin() && a.enabled() && a.status() == AnalysisStatus::None
        })
    }

    /// Initialized analyses waiting to RUN.
    pub fn needs_run(&self) -> impl Iterator<Item = &Analysis> {
        self.analyses.iter().filter(|a| {
            !a.is_builtin() && a.enabled() && a.status() == AnalysisStatus::Inited
        })
    }

    /// Completed analyses with a pending op.
    pub fn needs_op(&self) -> impl Iterator<Item = &Analysis> {
        self.analyses
            .iter()
            .filter(|a| !a.is_builtin() && a.status() == AnalysisStatus::Complete && a.needs_op())
    }
}
