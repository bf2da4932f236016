//! Built-in analyses computed in-process.
//!
//! `jmv::empty` (an annotation placeholder) and `jmv::weights` (the
//! data-set weighting notice) never reach the pool: they are COMPLETE from
//! construction and their results are rendered synchronously from options.

use crate::options::OptionMap;
use crate::protocol::{ResultElement, ResultStatus, ResultTree};

pub(crate) const BUILTIN_NAMESPACE: &str = "jmv";

/// Option holding the weighting variable of `jmv::weights`.
pub const WEIGHTS_OPTION: &str = "weights";

/// Kind of built-in analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Empty,
    Weights,
}

impl Builtin {
    /// Recognizes built-ins by namespace and name.
    pub fn from_name(namespace: &str, name: &str) -> Option<Self> {
        if namespace != BUILTIN_NAMESPACE {
            return None;
        }
        match name {
            "empty" => Some(Builtin::Empty),
            "weights" => Some(Builtin::Weights),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Empty => "empty",
            Builtin::Weights => "weights",
        }
    }

    /// Renders the result tree for the given options.
    pub(crate) fn render(&self, options: &OptionMap) -> ResultTree {
        match self {
            Builtin::Empty => ResultTree {
                title: String::new(),
                status: ResultStatus::Complete,
                error: None,
                elements: Vec::new(),
            },
            Builtin::Weights => {
                let content = match options.text(WEIGHTS_OPTION).filter(|w| !w.is_empty()) {
                    Some(var) => format!(
                        "Data is weighted by the variable <strong>{}</strong>",
                        escape_html(var)
                    ),
                    None => "Data is unweighted".to_owned(),
                };
                ResultTree {
                    title: "Weights".to_owned(),
                    status: ResultStatus::Complete,
                    error: None,
                    elements: vec![ResultElement::html("", content)],
                }
            }
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
