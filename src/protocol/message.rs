//! Wire messages exchanged with worker processes.
//!
//! Every frame carries one [`Envelope`]: a transaction id, a message-level
//! [`MessageStatus`] and a [`Payload`]. The payload is a sum type, so routing
//! is a `match` rather than a lookup on a type-name string.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Analysis identifier within one instance.
pub type AnalysisId = u32;

/// Identifier of a data-set instance (one open document).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool and engine key: one analysis of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalysisKey {
    pub instance_id: InstanceId,
    pub analysis_id: AnalysisId,
}

impl AnalysisKey {
    pub fn new(instance_id: InstanceId, analysis_id: AnalysisId) -> Self {
        Self {
            instance_id,
            analysis_id,
        }
    }
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.analysis_id)
    }
}

/// Message-level status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    InProgress,
    Complete,
    Error,
}

/// What the worker is asked to do with an analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perform {
    /// First-time setup: produce the result skeleton.
    Init,
    /// Compute the results.
    Run,
    /// Persist a sub-artifact of a completed analysis.
    Save,
}

impl Perform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Perform::Init => "init",
            Perform::Run => "run",
            Perform::Save => "save",
        }
    }
}

/// Analysis-level status reported inside a response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    #[default]
    None,
    Inited,
    Running,
    Complete,
    Error,
}

/// Request for one analysis (plus its addons).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub instance_id: InstanceId,
    pub analysis_id: AnalysisId,
    pub namespace: String,
    pub name: String,
    /// Serialized options, opaque to the scheduler.
    pub options: Vec<u8>,
    /// Option names changed since the last successful computation.
    pub changed: Vec<String>,
    pub revision: u64,
    pub clear_state: bool,
    pub perform: Perform,
    /// Target path for SAVE.
    pub path: Option<String>,
    /// Target part for SAVE.
    pub part: Option<String>,
    pub addons: Vec<AnalysisRequest>,
}

impl AnalysisRequest {
    pub fn key(&self) -> AnalysisKey {
        AnalysisKey::new(self.instance_id.clone(), self.analysis_id)
    }
}

/// One element of a result tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultElement {
    pub name: String,
    pub content: ElementContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ElementContent {
    Preformatted(String),
    Html(String),
    Group(Vec<ResultElement>),
    /// Rendered by the client; opaque here.
    Opaque(Vec<u8>),
}

impl ResultElement {
    pub fn preformatted(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: ElementContent::Preformatted(text.into()),
        }
    }

    pub fn html(name: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: ElementContent::Html(html.into()),
        }
    }
}

/// Result tree of an analysis.
///
/// Only `status`, `error` and the shape of `elements` are interpreted by the
/// scheduler; everything else is passed through to clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTree {
    pub title: String,
    pub status: ResultStatus,
    /// Error message; `None` or empty means no error.
    pub error: Option<String>,
    pub elements: Vec<ResultElement>,
}

impl ResultTree {
    /// Error message, if a non-empty one is present.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|m| !m.is_empty())
    }

    /// True when the body carries nothing: no elements, or a single empty
    /// preformatted element (what a dying worker sends).
    pub fn is_placeholder(&self) -> bool {
        match self.elements.as_slice() {
            [] => true,
            [only] => matches!(&only.content, ElementContent::Preformatted(t) if t.is_empty()),
            _ => false,
        }
    }
}

/// Result message for one analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub instance_id: InstanceId,
    pub analysis_id: AnalysisId,
    pub namespace: String,
    pub name: String,
    pub revision: u64,
    pub status: ResultStatus,
    /// Options echoed by the worker; empty when not echoed.
    pub options: Vec<u8>,
    pub results: ResultTree,
}

impl AnalysisResponse {
    /// Builds an ERROR response for `request` carrying `message`.
    ///
    /// Used wherever a process-level failure has to reach the analysis layer
    /// as a well-formed result.
    pub fn error_for(request: &AnalysisRequest, message: impl Into<String>) -> Self {
        Self {
            instance_id: request.instance_id.clone(),
            analysis_id: request.analysis_id,
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            revision: request.revision,
            status: ResultStatus::Error,
            options: Vec::new(),
            results: ResultTree {
                title: request.name.clone(),
                status: ResultStatus::Error,
                error: Some(message.into()),
                elements: vec![ResultElement::preformatted("", "")],
            },
        }
    }

    pub fn key(&self) -> AnalysisKey {
        AnalysisKey::new(self.instance_id.clone(), self.analysis_id)
    }

    /// True if the response belongs to `request`: same instance, analysis and revision.
    pub fn matches(&self, request: &AnalysisRequest) -> bool {
        self.instance_id == request.instance_id
            && self.analysis_id == request.analysis_id
            && self.revision == request.revision
    }

    /// True if either the response or its tree reports an error.
    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
            || self.results.status == ResultStatus::Error
            || self.results.error_message().is_some()
    }
}

/// Envelope payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    AnalysisRequest(AnalysisRequest),
    AnalysisResponse(AnalysisResponse),
    /// Asks the worker to exit cleanly.
    Shutdown,
}

/// One framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub status: MessageStatus,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(revision: u64) -> AnalysisRequest {
        AnalysisRequest {
            instance_id: InstanceId::from("inst"),
            analysis_id: 5,
            namespace: "jmv".into(),
            name: "descriptives".into(),
            options: Vec::new(),
            changed: Vec::new(),
            revision,
            clear_state: false,
            perform: Perform::Run,
            path: None,
            part: None,
            addons: Vec::new(),
        }
    }

    #[test]
    fn synthesized_error_is_placeholder_with_message() {
        let resp = AnalysisResponse::error_for(&request(4), "boom");
        assert!(resp.is_error());
        assert!(resp.results.is_placeholder());
        assert_eq!(resp.results.error_message(), Some("boom"));
        assert!(resp.matches(&request(4)));
        assert!(!resp.matches(&request(5)));
    }

    #[test]
    fn placeholder_detection() {
        let mut tree = ResultTree::default();
        assert!(tree.is_placeholder());

        tree.elements.push(ResultElement::preformatted("out", "text"));
        assert!(!tree.is_placeholder());

        tree.elements = vec![ResultElement::html("", "")];
        assert!(!tree.is_placeholder());
    }

    #[test]
    fn empty_error_string_is_not_an_error() {
        let tree = ResultTree {
            error: Some(String::new()),
            ..ResultTree::default()
        };
        assert_eq!(tree.error_message(), None);
    }

    #[test]
    fn key_display() {
        let key = request(1).key();
        assert_eq!(key.to_string(), "inst/5");
    }
}
