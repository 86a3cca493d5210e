//! Document predicates, partial updates and read options understood by every
//! [`DocumentStore`](crate::traits::DocumentStore).
//!
//! Documents are JSON objects carrying their identifier under [`ID_FIELD`].
//! Field paths are dotted (`lock.expires_at`); a missing field compares equal
//! to `null`, the way document databases usually treat absent keys.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::ids::DocumentId;

/// Reserved field holding the document identifier.
pub const ID_FIELD: &str = "_id";

/// Predicate over a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Matches the document with this identifier.
    Id(DocumentId),
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    /// `true` matches documents where the field is present (even `null`).
    Exists(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists(field.into(), true)
    }

    /// Field is absent or `null`.
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::Eq(field.into(), Value::Null)
    }

    /// Conjunction with another filter, flattening nested `And`s.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All, other) | (other, Self::All) => other,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    /// Disjunction with another filter.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or(mut branches) => {
                branches.push(other);
                Self::Or(branches)
            }
            this => Self::Or(vec![this, other]),
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the predicate against a document.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => doc
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .map_or(false, |stored| stored == id.to_string()),
            Self::Eq(field, expected) => values_equal(lookup_or_null(doc, field), expected),
            Self::Ne(field, expected) => !values_equal(lookup_or_null(doc, field), expected),
            Self::Lt(field, bound) => compare_field(doc, field, bound) == Some(Ordering::Less),
            Self::Lte(field, bound) => matches!(
                compare_field(doc, field, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Gt(field, bound) => compare_field(doc, field, bound) == Some(Ordering::Greater),
            Self::Gte(field, bound) => matches!(
                compare_field(doc, field, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Exists(field, wanted) => lookup(doc, field).is_some() == *wanted,
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Self::Not(inner) => !inner.matches(doc),
        }
    }

    /// Identifier the filter pins, if any; lets stores narrow their scan.
    #[must_use]
    pub fn id_hint(&self) -> Option<DocumentId> {
        match self {
            Self::Id(id) => Some(*id),
            Self::And(filters) => filters.iter().find_map(Filter::id_hint),
            _ => None,
        }
    }
}

/// Partial modification of a document.
///
/// Applied as: optional whole-body replacement (the identifier is preserved),
/// then `set` assignments, then `unset` removals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub replace: Option<Value>,
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
}

impl Update {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn replace_with(body: Value) -> Self {
        Self {
            replace: Some(body),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replace.is_none() && self.set.is_empty() && self.unset.is_empty()
    }

    /// Produces the post-image of `doc` under this update.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when the replacement is not an object or a
    /// dotted path runs through a non-object value.
    pub fn apply(&self, doc: &Value) -> CoreResult<Value> {
        let mut result = match &self.replace {
            Some(body) => {
                let mut body = body.clone();
                let object = body.as_object_mut().ok_or_else(|| {
                    CoreError::ValidationError("replacement document must be an object".into())
                })?;
                match doc.get(ID_FIELD) {
                    Some(id) => {
                        object.insert(ID_FIELD.to_string(), id.clone());
                    }
                    None => {
                        object.remove(ID_FIELD);
                    }
                }
                body
            }
            None => doc.clone(),
        };

        for (field, value) in &self.set {
            if field == ID_FIELD {
                return Err(CoreError::ValidationError("`_id` cannot be modified".into()));
            }
            set_path(&mut result, field, value.clone())?;
        }
        for field in &self.unset {
            unset_path(&mut result, field);
        }
        Ok(result)
    }
}

/// Sort direction for [`FindOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Paging and ordering for multi-document reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Field to order by; results are ordered by `_id` when unset.
    pub sort: Option<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Orders and pages an already-filtered result set.
    #[must_use]
    pub fn apply(&self, mut docs: Vec<Value>) -> Vec<Value> {
        let (field, order) = match &self.sort {
            Some((field, order)) => (field.as_str(), *order),
            None => (ID_FIELD, SortOrder::Ascending),
        };
        docs.sort_by(|a, b| {
            let ordering = compare_values(lookup_or_null(a, field), lookup_or_null(b, field))
                .unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        let iter = docs.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Resolves a dotted path inside a document.
#[must_use]
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

fn lookup_or_null<'a>(doc: &'a Value, path: &str) -> &'a Value {
    lookup(doc, path).unwrap_or(&Value::Null)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

fn compare_field(doc: &Value, field: &str, bound: &Value) -> Option<Ordering> {
    let value = lookup(doc, field)?;
    if value.is_null() || bound.is_null() {
        return None;
    }
    compare_values(value, bound)
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> CoreResult<()> {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            CoreError::ValidationError(format!("cannot set `{path}`: parent is not an object"))
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return Ok(());
        }
        let child = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if child.is_null() {
            *child = Value::Object(Map::new());
        }
        current = child;
    }
    Ok(())
}

fn unset_path(doc: &mut Value, path: &str) {
    match path.rsplit_once('.') {
        Some((parent, leaf)) => {
            let parent = path_mut(doc, parent);
            if let Some(object) = parent.and_then(Value::as_object_mut) {
                object.remove(leaf);
            }
        }
        None => {
            if let Some(object) = doc.as_object_mut() {
                object.remove(path);
            }
        }
    }
}

fn path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object_mut()?.get_mut(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "_id": "0190f0e4-54b1-7cc2-9a6e-9d1c1b7a2f10",
            "name": "widget",
            "qty": 4,
            "lock": { "state": "locked", "expires_at": 1_000 },
            "note": null
        })
    }

    #[test]
    fn test_equality_and_missing_fields() {
        let d = doc();
        assert!(Filter::eq("name", "widget").matches(&d));
        assert!(Filter::eq("qty", 4.0).matches(&d));
        assert!(Filter::is_null("missing").matches(&d));
        assert!(Filter::is_null("note").matches(&d));
        assert!(!Filter::is_null("lock").matches(&d));
        assert!(Filter::ne("name", "gadget").matches(&d));
    }

    #[test]
    fn test_range_comparisons() {
        let d = doc();
        assert!(Filter::lt("lock.expires_at", 2_000).matches(&d));
        assert!(!Filter::lt("lock.expires_at", 1_000).matches(&d));
        assert!(Filter::lte("lock.expires_at", 1_000).matches(&d));
        assert!(Filter::gt("qty", 3).matches(&d));
        assert!(!Filter::gt("missing", 0).matches(&d));
        assert!(!Filter::lt("name", 5).matches(&d));
    }

    #[test]
    fn test_exists_and_combinators() {
        let d = doc();
        assert!(Filter::exists("note").matches(&d));
        assert!(Filter::Exists("missing".into(), false).matches(&d));

        let unlocked_or_expired = Filter::is_null("lock")
            .or(Filter::lt("lock.expires_at", 5_000));
        assert!(unlocked_or_expired.matches(&d));
        assert!(!unlocked_or_expired.clone().not().matches(&d));
        assert!(Filter::eq("name", "widget")
            .and(unlocked_or_expired)
            .matches(&d));
    }

    #[test]
    fn test_id_filter_and_hint() {
        let id: DocumentId = "0190f0e4-54b1-7cc2-9a6e-9d1c1b7a2f10".parse().unwrap();
        let filter = Filter::Id(id).and(Filter::eq("qty", 4));
        assert!(filter.matches(&doc()));
        assert_eq!(filter.id_hint(), Some(id));
        assert_eq!(Filter::All.and(Filter::eq("a", 1)), Filter::eq("a", 1));
        assert_eq!(Filter::eq("a", 1).id_hint(), None);
    }

    #[test]
    fn test_update_set_unset_replace() {
        let d = doc();
        let updated = Update::new()
            .set("lock.state", "error")
            .set("lock.error.message", "boom")
            .unset("note")
            .apply(&d)
            .unwrap();
        assert_eq!(updated["lock"]["state"], "error");
        assert_eq!(updated["lock"]["error"]["message"], "boom");
        assert!(updated.get("note").is_none());

        let replaced = Update::replace_with(json!({ "name": "gadget", "_id": "other" }))
            .unset("lock")
            .apply(&d)
            .unwrap();
        assert_eq!(replaced["_id"], d["_id"]);
        assert_eq!(replaced["name"], "gadget");
        assert!(replaced.get("qty").is_none());
    }

    #[test]
    fn test_update_rejects_id_and_scalar_parent() {
        assert!(Update::new().set("_id", "x").apply(&doc()).is_err());
        assert!(Update::new().set("name.first", "x").apply(&doc()).is_err());
    }

    #[test]
    fn test_find_options() {
        let docs = vec![
            json!({"_id": "b", "rank": 2}),
            json!({"_id": "a", "rank": 3}),
            json!({"_id": "c", "rank": 1}),
        ];
        let by_id = FindOptions::default().apply(docs.clone());
        assert_eq!(by_id[0]["_id"], "a");

        let top = FindOptions::default()
            .sort_by("rank", SortOrder::Descending)
            .skip(1)
            .limit(1)
            .apply(docs);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["_id"], "b");
    }
}
