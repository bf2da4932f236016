//! Analyses and their per-instance collection.
//!
//! ## Contents
//! - [`Analysis`] one computation: options, revision, status, pending ops, addons
//! - [`AnalysisCollection`] ordered analyses of an instance plus the scheduling views
//! - [`Builtin`] in-process analyses (`jmv::empty`, `jmv::weights`)

#[allow(clippy::module_inception)]
mod analysis;
mod builtin;
mod collection;

pub use analysis::{
    Analysis, AnalysisSnapshot, AnalysisStatus, MAX_PENDING_OPS, OpKind, OpReply,
};
pub use builtin::{Builtin, WEIGHTS_OPTION};
pub use collection::{AnalysisCollection, CollectionError, NewAnalysis};
