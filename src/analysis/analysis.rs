//! # Analysis: one requested computation and its lifecycle.
//!
//! ```text
//!          set_options / run / rerun
//!   ┌──────────────────────────────────────────┐
//!   ▼                                          │
//! NONE ──admit──► RUNNING ──result──► INITED ──┤
//!                    │                  │      │
//!                    │             admit (run) │
//!                    │                  ▼      │
//!                    ├──result──► COMPLETE ────┤ (pending op → SAVE → COMPLETE)
//!                    └──error───► ERROR ───────┘
//!
//! any ──remove──► DELETED
//! ```
//!
//! State-changing methods return `true` when the owner must be told the
//! analysis needs scheduling (or its results changed); the
//! [`AnalysisCollection`](super::AnalysisCollection) turns that into a
//! change record the scheduler drains.
//!
//! ## Rules
//! - Built-ins never leave COMPLETE and never request scheduling.
//! - Revision is caller-supplied; nothing here increments it.
//! - Each pending op is answered exactly once.

use std::collections::{BTreeSet, VecDeque};

use tokio::sync::oneshot;

use crate::error::OpError;
use crate::options::{OptionMap, Options, OptionsError};
use crate::protocol::{
    AnalysisId, AnalysisKey, AnalysisResponse, InstanceId, ResultElement, ResultStatus,
    ResultTree,
};

use super::builtin::Builtin;

/// Maximum number of queued side-operations per analysis.
pub const MAX_PENDING_OPS: usize = 4;

/// Scheduling status of an analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisStatus {
    /// Needs scheduling.
    None,
    Running,
    Inited,
    Complete,
    Error,
    Deleted,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::None => "none",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Inited => "inited",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Deleted => "deleted",
        }
    }
}

/// Side-operation queued on a completed analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Persist a sub-artifact of the results.
    Save { path: String, part: Option<String> },
}

/// Receiver of a pending op outcome.
pub type OpReply = oneshot::Receiver<Result<AnalysisResponse, OpError>>;

struct PendingOp {
    kind: OpKind,
    dispatched: bool,
    reply: oneshot::Sender<Result<AnalysisResponse, OpError>>,
}

/// Point-in-time copy of an analysis, for callers outside the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisSnapshot {
    pub key: AnalysisKey,
    pub namespace: String,
    pub name: String,
    pub revision: u64,
    pub status: AnalysisStatus,
    pub enabled: bool,
    pub changes: Vec<String>,
    pub clear_state: bool,
    pub results: Option<AnalysisResponse>,
    pub pending_ops: usize,
    pub depends_on: Option<AnalysisId>,
    pub dependents: Vec<AnalysisId>,
}

/// One analysis of one instance.
pub struct Analysis {
    instance_id: InstanceId,
    id: AnalysisId,
    namespace: String,
    name: String,
    revision: u64,
    status: AnalysisStatus,
    enabled: bool,
    changes: BTreeSet<String>,
    clear_state: bool,
    options: Box<dyn Options>,
    results: Option<AnalysisResponse>,
    addons: Vec<Analysis>,
    dependents: Vec<AnalysisId>,
    depends_on: Option<AnalysisId>,
    ops: VecDeque<PendingOp>,
    builtin: Option<Builtin>,
}

impl Analysis {
    pub(crate) fn new(
        instance_id: InstanceId,
        id: AnalysisId,
        namespace: impl Into<String>,
        name: impl Into<String>,
        options: Box<dyn Options>,
        enabled: bool,
    ) -> Self {
        Self {
            instance_id,
            id,
            namespace: namespace.into(),
            name: name.into(),
            revision: 0,
            status: AnalysisStatus::None,
            enabled,
            changes: BTreeSet::new(),
            clear_state: false,
            options,
            results: None,
            addons: Vec::new(),
            dependents: Vec::new(),
            depends_on: None,
            ops: VecDeque::new(),
            builtin: None,
        }
    }

    pub(crate) fn new_builtin(
        instance_id: InstanceId,
        id: AnalysisId,
        kind: Builtin,
        options: OptionMap,
    ) -> Self {
        let mut analysis = Self::new(
            instance_id,
            id,
            super::builtin::BUILTIN_NAMESPACE,
            kind.name(),
            Box::new(options),
            true,
        );
        analysis.builtin = Some(kind);
        analysis.status = AnalysisStatus::Complete;
        analysis.refresh_builtin();
        analysis
    }

    pub fn id(&self) -> AnalysisId {
        self.id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn key(&self) -> AnalysisKey {
        AnalysisKey::new(self.instance_id.clone(), self.id)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn status(&self) -> AnalysisStatus {
        self.status
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn clear_state(&self) -> bool {
        self.clear_state
    }

    pub fn changes(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(String::as_str)
    }

    pub fn results(&self) -> Option<&AnalysisResponse> {
        self.results.as_ref()
    }

    pub fn addons(&self) -> &[Analysis] {
        &self.addons
    }

    pub fn dependents(&self) -> &[AnalysisId] {
        &self.dependents
    }

    pub fn depends_on(&self) -> Option<AnalysisId> {
        self.depends_on
    }

    pub fn builtin(&self) -> Option<Builtin> {
        self.builtin
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }

    pub fn options_bytes(&self) -> Vec<u8> {
        self.options.as_wire_bytes()
    }

    /// Merges new options.
    ///
    /// Returns `Ok(false)` when nothing requires recomputation: no
    /// non-passive option changed, `changed` is empty and the analysis was
    /// not just enabled. Otherwise the analysis goes back to NONE.
    pub fn set_options(
        &mut self,
        options: &[u8],
        changed: &[String],
        revision: u64,
        enabled: Option<bool>,
    ) -> Result<bool, OptionsError> {
        let non_passive = self.options.apply_wire_bytes(options)?;
        self.revision = revision;

        if self.builtin.is_some() {
            self.refresh_builtin();
            return Ok(false);
        }

        let now_enabled = enabled == Some(true) && !self.enabled;
        if let Some(enabled) = enabled {
            self.enabled = enabled;
        }

        if !non_passive && changed.is_empty() && !now_enabled {
            return Ok(false);
        }

        self.changes.extend(changed.iter().cloned());
        self.status = AnalysisStatus::None;
        Ok(true)
    }

    /// Reschedules without touching the revision.
    pub fn run(&mut self) -> bool {
        if self.builtin.is_some() {
            return false;
        }
        self.status = AnalysisStatus::None;
        true
    }

    /// Reschedules and asks the worker to discard cached state.
    pub fn rerun(&mut self) -> bool {
        if self.builtin.is_some() {
            return false;
        }
        self.clear_state = true;
        self.status = AnalysisStatus::None;
        true
    }

    /// Applies a result message. Returns whether listeners should be
    /// notified: only for a complete, non-silent result.
    ///
    /// An error result with an empty body does not blank previous output: the
    /// previous result is kept with only the error text and revision patched in.
    pub fn set_results(
        &mut self,
        mut response: AnalysisResponse,
        mut complete: bool,
        silent: bool,
    ) -> bool {
        if let Some(message) = response.results.error_message().map(str::to_owned)
            && response.results.is_placeholder()
            && let Some(previous) = &self.results
        {
            let mut reused = previous.clone();
            reused.revision = response.revision;
            reused.status = response.status;
            reused.results.error = Some(message);
            if reused.results.status != ResultStatus::Error {
                reused.results.status = ResultStatus::Complete;
            }
            response = reused;
            complete = true;
        }

        if response.options.is_empty() {
            response.options = self.options.as_wire_bytes();
        } else if let Err(e) = self.options.apply_wire_bytes(&response.options) {
            tracing::warn!(analysis = %self.key(), error = %e, "ignoring options echoed by worker");
        }

        if complete {
            self.changes.clear();
            if let Some(status) = status_from_result(response.status) {
                self.status = status;
            }
        }
        self.clear_state = false;
        self.results = Some(response);
        complete && !silent
    }

    /// Marks the analysis as failed with `message`.
    pub fn set_error(&mut self, message: impl Into<String>) -> bool {
        let response = self.error_response(message);
        let notify = self.set_results(response, true, false);
        self.status = AnalysisStatus::Error;
        notify
    }

    /// Builds an ERROR response for the current revision.
    pub fn error_response(&self, message: impl Into<String>) -> AnalysisResponse {
        AnalysisResponse {
            instance_id: self.instance_id.clone(),
            analysis_id: self.id,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            revision: self.revision,
            status: ResultStatus::Error,
            options: Vec::new(),
            results: ResultTree {
                title: self.name.clone(),
                status: ResultStatus::Error,
                error: Some(message.into()),
                elements: vec![ResultElement::preformatted("", "")],
            },
        }
    }

    /// Queues a side-operation and returns where its outcome will arrive.
    ///
    /// The second value tells whether the scheduler must be notified.
    pub fn queue_op(&mut self, kind: OpKind) -> (OpReply, bool) {
        let (tx, rx) = oneshot::channel();
        if self.builtin.is_some() {
            let _ = tx.send(Err(OpError::Failed(format!(
                "built-in analysis '{}' has nothing to save",
                self.name
            ))));
            return (rx, false);
        }
        if self.ops.len() >= MAX_PENDING_OPS {
            let _ = tx.send(Err(OpError::TooMany));
            return (rx, false);
        }
        self.ops.push_back(PendingOp {
            kind,
            dispatched: false,
            reply: tx,
        });
        (rx, true)
    }

    /// True if the oldest pending op has not been sent to a worker yet.
    pub fn needs_op(&self) -> bool {
        self.ops.front().is_some_and(|op| !op.dispatched)
    }

    /// The op the next SAVE request would carry.
    pub fn pending_op(&self) -> Option<&OpKind> {
        self.ops.front().filter(|op| !op.dispatched).map(|op| &op.kind)
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn mark_op_dispatched(&mut self) {
        if let Some(op) = self.ops.front_mut() {
            op.dispatched = true;
        }
    }

    /// Answers the oldest pending op.
    pub(crate) fn resolve_op(&mut self, outcome: Result<AnalysisResponse, OpError>) {
        if let Some(op) = self.ops.pop_front() {
            let _ = op.reply.send(outcome);
        }
    }

    /// Answers every pending op with `err`.
    pub(crate) fn fail_ops(&mut self, err: OpError) {
        for op in self.ops.drain(..) {
            let _ = op.reply.send(Err(err.clone()));
        }
    }

    pub(crate) fn set_status(&mut self, status: AnalysisStatus) {
        if self.builtin.is_some() && status != AnalysisStatus::Deleted {
            return;
        }
        self.status = status;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_addons(&mut self, addons: Vec<Analysis>) {
        self.addons = addons;
    }

    pub(crate) fn add_dependent(&mut self, child: AnalysisId) {
        if !self.dependents.contains(&child) {
            self.dependents.push(child);
        }
    }

    pub(crate) fn remove_dependent(&mut self, child: AnalysisId) {
        self.dependents.retain(|id| *id != child);
    }

    pub(crate) fn set_depends_on(&mut self, patron: Option<AnalysisId>) {
        self.depends_on = patron;
    }

    pub fn snapshot(&self) -> AnalysisSnapshot {
        AnalysisSnapshot {
            key: self.key(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            revision: self.revision,
            status: self.status,
            enabled: self.enabled,
            changes: self.changes.iter().cloned().collect(),
            clear_state: self.clear_state,
            results: self.results.clone(),
            pending_ops: self.ops.len(),
            depends_on: self.depends_on,
            dependents: self.dependents.clone(),
        }
    }

    fn refresh_builtin(&mut self) {
        let Some(kind) = self.builtin else { return };
        let bytes = self.options.as_wire_bytes();
        let options = OptionMap::from_bytes(&bytes).unwrap_or_default();
        self.results = Some(AnalysisResponse {
            instance_id: self.instance_id.clone(),
            analysis_id: self.id,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            revision: self.revision,
            status: ResultStatus::Complete,
            options: bytes,
            results: kind.render(&options),
        });
    }
}

fn status_from_result(status: ResultStatus) -> Option<AnalysisStatus> {
    match status {
        ResultStatus::None => None,
        ResultStatus::Inited => Some(AnalysisStatus::Inited),
        ResultStatus::Running => Some(AnalysisStatus::Running),
        ResultStatus::Complete => Some(AnalysisStatus::Complete),
        ResultStatus::Error => Some(AnalysisStatus::Error),
    }
}
