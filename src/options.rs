//! # Analysis options model.
//!
//! The scheduler never interprets option values. It needs two things from
//! whatever model owns them:
//! - serialize the current values for a request ([`Options::as_wire_bytes`]);
//! - merge incoming values and report whether anything *non-passive* changed
//!   ([`Options::apply_wire_bytes`]). Passive options (e.g. display-only
//!   toggles) do not trigger a recomputation on their own.
//!
//! [`OptionMap`] is the bundled implementation: an ordered name → value map
//! serialized with `bincode`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to decode incoming option bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid options payload: {0}")]
pub struct OptionsError(pub String);

impl OptionsError {
    pub fn as_label(&self) -> &'static str {
        "options_invalid"
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Options model of one analysis.
pub trait Options: Send + 'static {
    /// Serialized current values.
    fn as_wire_bytes(&self) -> Vec<u8>;

    /// Merges `bytes` into the current values.
    ///
    /// Returns `true` if any non-passive option changed value.
    fn apply_wire_bytes(&mut self, bytes: &[u8]) -> Result<bool, OptionsError>;
}

/// One option value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    List(Vec<OptionValue>),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Number(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Ordered option map with a set of passive option names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptionMap {
    values: BTreeMap<String, OptionValue>,
    passive: BTreeSet<String>,
}

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares options whose changes never require recomputation.
    #[must_use]
    pub fn with_passive<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.passive.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets one value, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    /// Text value of `name`, if it is text.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_passive(&self, name: &str) -> bool {
        self.passive.contains(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encodes only the values (passive names are local metadata).
    pub fn to_bytes(&self) -> Vec<u8> {
        // A BTreeMap of plain enums always encodes.
        bincode::serde::encode_to_vec(&self.values, bincode::config::standard())
            .unwrap_or_default()
    }

    /// Decodes a value map produced by [`OptionMap::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OptionsError> {
        Ok(Self {
            values: decode_values(bytes)?,
            passive: BTreeSet::new(),
        })
    }
}

fn decode_values(bytes: &[u8]) -> Result<BTreeMap<String, OptionValue>, OptionsError> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(values, _)| values)
        .map_err(|e| OptionsError(e.to_string()))
}

impl Options for OptionMap {
    fn as_wire_bytes(&self) -> Vec<u8> {
        self.to_bytes()
    }

    fn apply_wire_bytes(&mut self, bytes: &[u8]) -> Result<bool, OptionsError> {
        let incoming = decode_values(bytes)?;
        let mut non_passive = false;
        for (name, value) in incoming {
            if self.values.get(&name) == Some(&value) {
                continue;
            }
            if !self.passive.contains(&name) {
                non_passive = true;
            }
            self.values.insert(name, value);
        }
        Ok(non_passive)
    }
}
