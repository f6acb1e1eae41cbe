//! Algorithm instance options.
//!
//! Options are a small string-keyed map (`min-ttl`, `dst-ip`, ...) so
//! the registry can merge registration defaults under caller-supplied
//! values before the algorithm factory validates them. Factories reject
//! unknown keys; validation failures surface synchronously from
//! `run_instance`.

use std::collections::BTreeMap;
use std::fmt;

use super::error::{Error, Result};

/// A single option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// String-keyed option map for algorithm instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<String, OptionValue>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an integer option, replacing any previous value.
    pub fn set_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.0.insert(key.into(), OptionValue::Int(value));
        self
    }

    /// Set a string option, replacing any previous value.
    pub fn set_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), OptionValue::Str(value.into()));
        self
    }

    /// Look up an integer option.
    ///
    /// Returns `InvalidArgument` when the key holds a string.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(Error::InvalidArgument(format!(
                "option {key} expects an integer, got '{other}'"
            ))),
        }
    }

    /// Look up a string option.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(Error::InvalidArgument(format!(
                "option {key} expects a string, got '{other}'"
            ))),
        }
    }

    /// Merge `defaults` under this map: existing keys win.
    pub fn with_defaults(mut self, defaults: &Options) -> Self {
        for (key, value) in &defaults.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Reject any key not in `known`.
    pub fn ensure_known(&self, known: &[&str]) -> Result<()> {
        for key in self.0.keys() {
            if !known.contains(&key.as_str()) {
                return Err(Error::InvalidArgument(format!("unknown option: {key}")));
            }
        }
        Ok(())
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
