//! Evaluation case types shared by the gateway and the inference server.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque prediction value returned by a competitor's predict callable.
pub type Prediction = Value;

/// Unique, stable key identifying one evaluation case (e.g. a series UID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable tuple of arguments describing one evaluation case.
///
/// Elements are opaque JSON values. The reference layout is a single
/// element holding a directory path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchPayload(Vec<Value>);

impl BatchPayload {
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    /// Single-element payload holding a filesystem path.
    pub fn from_path(path: &Path) -> Self {
        Self(vec![Value::String(path.to_string_lossy().into_owned())])
    }

    pub fn args(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One accepted row of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub row_id: RowId,
    pub prediction: Prediction,
}
