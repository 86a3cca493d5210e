use thiserror::Error;

/// Canonical error type for repository operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Document or entity was not found in the store.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type or collection name (e.g. `"order"`).
        entity: String,
        /// Identifier of the missing document.
        id: String,
    },

    /// Document already exists, or a unique index rejected the write.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type or collection name.
        entity: String,
        /// Identifier (or unique key) that conflicts.
        id: String,
    },

    /// Another holder owns a valid lock on the document.
    ///
    /// Not fatal: callers retry later or skip the document.
    #[error("document `{id}` in `{collection}` is locked: {reason}")]
    LockConflict {
        /// Collection holding the document.
        collection: String,
        /// Identifier of the locked document.
        id: String,
        /// Why the claim was refused.
        reason: String,
    },

    /// The scope's token no longer matches the stored lock.
    ///
    /// The lease expired and was reclaimed by another holder. Local changes must
    /// be discarded; the operation is never retried automatically.
    #[error("lock on `{id}` in `{collection}` was lost")]
    LockLost {
        /// Collection holding the document.
        collection: String,
        /// Identifier of the document.
        id: String,
    },

    /// Declared and live indexes disagree.
    #[error("index mismatch in `{collection}`: {}", names.join(", "))]
    IndexMismatch {
        /// Collection whose indexes drifted.
        collection: String,
        /// Names of the drifted indexes.
        names: Vec<String>,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a `LockConflict` variant.
    #[must_use]
    pub fn lock_conflict(
        collection: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::LockConflict {
            collection: collection.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `LockLost` variant.
    #[must_use]
    pub fn lock_lost(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::LockLost {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` for errors a caller may resolve by retrying later.
    #[must_use]
    pub const fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() || err.is_data() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenient result alias for repository operations.
pub type CoreResult<T> = Result<T, CoreError>;
