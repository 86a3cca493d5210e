//! Lease-based lock state stored on each lockable document.
//!
//! All lock state lives on the document under [`LOCK_FIELD`]; there is no lock
//! table. An absent or `null` field means the document is unlocked, so a token
//! exists exactly when the document is locked or flagged with an error.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::CoreResult;
use crate::filter::{Filter, Update};
use crate::ids::{DocumentId, LockToken};

/// Reserved field holding the lock sub-document.
pub const LOCK_FIELD: &str = "_lock";

const TOKEN_PATH: &str = "_lock.token";
const STATE_PATH: &str = "_lock.state";
const EXPIRES_PATH: &str = "_lock.expires_at";
const ERROR_PATH: &str = "_lock.error";

/// Lock state of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Unlocked,
    Locked,
    Error,
}

impl LockState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error descriptor left on a document by a faulted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockErrorInfo {
    pub message: String,
    /// Short classification, e.g. the error type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}

impl LockErrorInfo {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            details: None,
            recorded_at: Utc::now().trunc_subsecs(3),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Captures an error's message and its source chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let info = Self::new(err.to_string());
        if chain.is_empty() {
            info
        } else {
            info.with_details(chain.join(": "))
        }
    }
}

/// Lock sub-document as persisted under [`LOCK_FIELD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub token: LockToken,
    pub state: LockState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub locked_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Free-form name of the holder, for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LockErrorInfo>,
}

impl LockInfo {
    /// Fresh `Locked` claim valid for `lease` from `now`.
    ///
    /// Timestamps are kept at millisecond precision, the stored resolution.
    #[must_use]
    pub fn claim(now: DateTime<Utc>, lease: Duration, actor: Option<String>) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            token: LockToken::new(),
            state: LockState::Locked,
            locked_at: now,
            expires_at: now + lease,
            actor,
            error: None,
        }
    }

    /// Whether a `Locked` lease has run out; error locks never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == LockState::Locked && self.expires_at < now
    }

    /// Reads the lock sub-document of a stored document.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationError` when the field is present but malformed.
    pub fn from_document(doc: &Value) -> CoreResult<Option<Self>> {
        match doc.get(LOCK_FIELD) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }
}

/// Lock state of a stored document, `Unlocked` when no lock sub-document exists.
#[must_use]
pub fn lock_state_of(lock: Option<&LockInfo>) -> LockState {
    lock.map_or(LockState::Unlocked, |info| info.state)
}

/// Documents nobody holds at `now`: unlocked, or holding an expired lease.
#[must_use]
pub fn free_filter(now: DateTime<Utc>) -> Filter {
    let expired = Filter::eq(STATE_PATH, LockState::Locked.as_str())
        .and(Filter::lt(EXPIRES_PATH, now.timestamp_millis()));
    Filter::is_null(LOCK_FIELD).or(expired)
}

/// The document `id`, if it may be claimed at `now`.
#[must_use]
pub fn claimable_filter(id: DocumentId, now: DateTime<Utc>) -> Filter {
    Filter::Id(id).and(free_filter(now))
}

/// Documents whose live lock is held under `token`.
#[must_use]
pub fn held_filter(id: DocumentId, token: LockToken) -> Filter {
    Filter::Id(id)
        .and(Filter::eq(TOKEN_PATH, token.to_string()))
        .and(Filter::eq(STATE_PATH, LockState::Locked.as_str()))
}

/// Documents in the given lock state.
#[must_use]
pub fn state_filter(state: LockState) -> Filter {
    match state {
        LockState::Unlocked => Filter::is_null(LOCK_FIELD),
        other => Filter::eq(STATE_PATH, other.as_str()),
    }
}

/// Writes a fresh claim.
///
/// # Errors
///
/// Propagates serialization failures.
pub fn claim_update(info: &LockInfo) -> CoreResult<Update> {
    Ok(Update::new().set(LOCK_FIELD, serde_json::to_value(info)?))
}

/// Flags a held lock with an error descriptor instead of releasing it.
///
/// # Errors
///
/// Propagates serialization failures.
pub fn error_update(error: &LockErrorInfo) -> CoreResult<Update> {
    Ok(Update::new()
        .set(STATE_PATH, LockState::Error.as_str())
        .set(ERROR_PATH, serde_json::to_value(error)?))
}

/// Removes the lock sub-document.
#[must_use]
pub fn release_update() -> Update {
    Update::new().unset(LOCK_FIELD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn locked_doc(id: DocumentId, info: &LockInfo) -> Value {
        json!({ "_id": id.to_string(), "name": "x", "_lock": serde_json::to_value(info).unwrap() })
    }

    #[test]
    fn test_claimable_unlocked_and_expired() {
        let id = DocumentId::new();
        let now = Utc::now();
        let free = json!({ "_id": id.to_string(), "_lock": null });
        assert!(claimable_filter(id, now).matches(&free));

        let held = LockInfo::claim(now, Duration::seconds(30), None);
        assert!(!claimable_filter(id, now).matches(&locked_doc(id, &held)));

        let stale = LockInfo::claim(now - Duration::minutes(5), Duration::seconds(30), None);
        assert!(claimable_filter(id, now).matches(&locked_doc(id, &stale)));
    }

    #[test]
    fn test_error_lock_is_never_claimable() {
        let id = DocumentId::new();
        let now = Utc::now();
        let mut info = LockInfo::claim(now - Duration::days(1), Duration::seconds(1), None);
        info.state = LockState::Error;
        assert!(!info.is_expired_at(now));
        assert!(!claimable_filter(id, now).matches(&locked_doc(id, &info)));
    }

    #[test]
    fn test_held_filter_requires_token() {
        let id = DocumentId::new();
        let info = LockInfo::claim(Utc::now(), Duration::seconds(30), Some("worker-1".into()));
        let doc = locked_doc(id, &info);
        assert!(held_filter(id, info.token).matches(&doc));
        assert!(!held_filter(id, LockToken::new()).matches(&doc));
    }

    #[test]
    fn test_updates_round_through_document() {
        let id = DocumentId::new();
        let info = LockInfo::claim(Utc::now(), Duration::seconds(30), None);
        let doc = claim_update(&info)
            .unwrap()
            .apply(&json!({ "_id": id.to_string() }))
            .unwrap();
        assert_eq!(LockInfo::from_document(&doc).unwrap(), Some(info));

        let errored = error_update(&LockErrorInfo::new("boom")).unwrap().apply(&doc).unwrap();
        let stored = LockInfo::from_document(&errored).unwrap().unwrap();
        assert_eq!(stored.state, LockState::Error);
        assert_eq!(stored.error.unwrap().message, "boom");
        assert!(state_filter(LockState::Error).matches(&errored));

        let released = release_update().apply(&errored).unwrap();
        assert_eq!(LockInfo::from_document(&released).unwrap(), None);
        assert!(state_filter(LockState::Unlocked).matches(&released));
    }

    #[test]
    fn test_error_info_captures_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let outer = crate::CoreError::from(inner);
        let info = LockErrorInfo::from_error(&outer);
        assert_eq!(info.message, "I/O error: disk full");
    }
}
