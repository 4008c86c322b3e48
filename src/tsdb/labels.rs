//! Engine-side label set

use crate::model::{canonicalize, Label, METRIC_NAME_LABEL};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Immutable, canonically ordered label set.
///
/// Cheap to clone; the head, appenders and WAL records share one
/// allocation per series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Arc<[Label]>);

impl Labels {
    /// Build from labels that are already in canonical order.
    pub fn from_sorted(labels: &[Label]) -> Self {
        Self(Arc::from(labels))
    }

    /// Build from labels in any order.
    pub fn new(mut labels: Vec<Label>) -> Self {
        canonicalize(&mut labels);
        Self(Arc::from(labels))
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(pairs.into_iter().map(|(n, v)| Label::new(n, v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Label> {
        self.0.to_vec()
    }

    /// JSON form used in WAL records
    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&*self.0)?)
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self> {
        let labels: Vec<Label> = serde_json::from_str(raw)
            .map_err(|e| Error::Serialization(format!("invalid label set {:?}: {}", raw, e)))?;
        Ok(Self::new(labels))
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}
