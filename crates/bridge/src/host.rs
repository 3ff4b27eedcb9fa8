//! Host-owned state as seen by queued callbacks.
//!
//! Callbacks never reach for global host state. The drain hands each one a
//! `&mut H` where `H: HostState`, on the host thread, so the host type does not
//! need to be `Send` or `Sync`.

use std::collections::BTreeMap;
use std::fmt;

/// A value that can cross from an evaluation thread into the host and back.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl HostValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "nil"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Integer(i) => write!(f, "{}", i),
            HostValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{:.0}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            HostValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        HostValue::Integer(i)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

/// Errors a host reports back to a queued callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HostError {
    /// The key is owned by the host and cannot be written from a REPL.
    ReadOnly(String),
    /// The key is not acceptable to this host.
    InvalidKey(String),
    /// Anything else.
    Other(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::ReadOnly(key) => write!(f, "'{}' is read-only", key),
            HostError::InvalidKey(key) => write!(f, "invalid key '{}'", key),
            HostError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for HostError {}

/// The host state that queued work is allowed to touch.
///
/// Only ever called on the host thread, from inside a drain.
pub trait HostState {
    fn get(&self, key: &str) -> Option<HostValue>;

    /// Setting `HostValue::Nil` is equivalent to removing the key.
    fn set(&mut self, key: &str, value: HostValue) -> Result<(), HostError>;

    fn remove(&mut self, key: &str) -> Result<Option<HostValue>, HostError>;

    /// All keys, sorted.
    fn keys(&self) -> Vec<String>;
}

/// A plain key/value host. Counts writes so tests can assert exactly-once
/// application of queued mutations.
#[derive(Debug, Default)]
pub struct MapHost {
    values: BTreeMap<String, HostValue>,
    writes: u64,
}

impl MapHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set`/`remove` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl HostState for MapHost {
    fn get(&self, key: &str) -> Option<HostValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: HostValue) -> Result<(), HostError> {
        if key.is_empty() {
            return Err(HostError::InvalidKey(key.to_string()));
        }
        if value.is_nil() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), value);
        }
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<Option<HostValue>, HostError> {
        self.writes += 1;
        Ok(self.values.remove(key))
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}
