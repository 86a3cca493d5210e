//! Index specifications and drift detection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Key direction for one indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDirection {
    Ascending,
    Descending,
    Hashed,
}

impl IndexDirection {
    /// Returns the canonical lowercase string stored alongside the index.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
            Self::Hashed => "hashed",
        }
    }
}

impl Default for IndexDirection {
    fn default() -> Self {
        Self::Ascending
    }
}

impl FromStr for IndexDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascending" | "asc" | "1" => Ok(Self::Ascending),
            "descending" | "desc" | "-1" => Ok(Self::Descending),
            "hashed" => Ok(Self::Hashed),
            other => Err(CoreError::ValidationError(format!(
                "unknown index direction `{other}`"
            ))),
        }
    }
}

impl fmt::Display for IndexDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field participating in an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    /// Dotted field path, e.g. `customer.id`.
    pub field: String,
    #[serde(default)]
    pub direction: IndexDirection,
}

impl IndexKey {
    #[must_use]
    pub fn new(field: impl Into<String>, direction: IndexDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// Declared or observed index definition.
///
/// Key order matters to the store (compound index semantics) but not to drift
/// detection, see [`IndexSpec::equal_fields`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Creates an empty, non-unique index definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            unique: false,
        }
    }

    /// Appends an ascending key.
    #[must_use]
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push(IndexKey::new(field, IndexDirection::Ascending));
        self
    }

    /// Appends a descending key.
    #[must_use]
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push(IndexKey::new(field, IndexDirection::Descending));
        self
    }

    /// Appends a hashed key.
    #[must_use]
    pub fn hashed(mut self, field: impl Into<String>) -> Self {
        self.keys.push(IndexKey::new(field, IndexDirection::Hashed));
        self
    }

    /// Marks the index as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Validates the definition before it is sent to a store.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an empty or malformed name, no keys, a
    /// repeated field, or a field path with characters outside `[A-Za-z0-9_.]`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError("index name is empty".into()));
        }
        if !self.name.chars().all(is_name_char) {
            return Err(CoreError::ValidationError(format!(
                "index name `{}` contains characters outside [A-Za-z0-9_.-]",
                self.name
            )));
        }
        if self.keys.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "index `{}` has no keys",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for key in &self.keys {
            let valid = !key.field.is_empty()
                && key
                    .field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
            if !valid {
                return Err(CoreError::ValidationError(format!(
                    "index `{}` has invalid field path `{}`",
                    self.name, key.field
                )));
            }
            if !seen.insert(key.field.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "index `{}` repeats field `{}`",
                    self.name, key.field
                )));
            }
        }
        Ok(())
    }

    /// Field paths in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|key| key.field.as_str())
    }

    /// Order-insensitive equality of participating fields, directions and uniqueness.
    #[must_use]
    pub fn equal_fields(&self, other: &IndexSpec) -> bool {
        self.unique == other.unique && self.key_set() == other.key_set()
    }

    fn key_set(&self) -> BTreeSet<(&str, IndexDirection)> {
        self.keys
            .iter()
            .map(|key| (key.field.as_str(), key.direction))
            .collect()
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Comparison of one index name between declaration and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexModel {
    pub name: String,
    /// Specification observed in storage.
    pub current: Option<IndexSpec>,
    /// Specification the collection declares.
    pub defined: Option<IndexSpec>,
    pub equal_fields: bool,
}

impl IndexModel {
    /// Builds the model for one name; `equal_fields` is false unless both sides exist and agree.
    #[must_use]
    pub fn new(name: impl Into<String>, current: Option<IndexSpec>, defined: Option<IndexSpec>) -> Self {
        let equal_fields = match (&current, &defined) {
            (Some(current), Some(defined)) => current.equal_fields(defined),
            _ => false,
        };
        Self {
            name: name.into(),
            current,
            defined,
            equal_fields,
        }
    }

    /// Declared but absent from storage.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.defined.is_some() && self.current.is_none()
    }

    /// Present in storage but not declared.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.defined.is_none() && self.current.is_some()
    }

    /// Present on both sides with different fields or uniqueness.
    #[must_use]
    pub fn is_mismatched(&self) -> bool {
        self.defined.is_some() && self.current.is_some() && !self.equal_fields
    }

    /// Any kind of drift.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.equal_fields
    }
}

/// Compares declared index specs against the specs present in storage.
///
/// Produces one model per name in the union of both sides, sorted by name.
#[must_use]
pub fn diff_indexes(defined: &[IndexSpec], current: &[IndexSpec]) -> Vec<IndexModel> {
    let mut by_name: BTreeMap<&str, (Option<&IndexSpec>, Option<&IndexSpec>)> = BTreeMap::new();
    for spec in current {
        by_name.entry(spec.name.as_str()).or_default().0 = Some(spec);
    }
    for spec in defined {
        by_name.entry(spec.name.as_str()).or_default().1 = Some(spec);
    }

    by_name
        .into_iter()
        .map(|(name, (current, defined))| IndexModel::new(name, current.cloned(), defined.cloned()))
        .collect()
}
