//! Persistence error types.

use thiserror::Error;

use crate::id::AggregateId;

/// Top-level error type for the persistence engine.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// Another writer already stored an event at this version.
    #[error("concurrency conflict on aggregate {aggregate_id}: version {version} already exists")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: AggregateId,
        /// The version that was already taken.
        version: i64,
    },

    /// The empty aggregate shell could not be constructed.
    #[error("instance creation failed: {0}")]
    InstanceCreation(String),

    /// A payload could not be encoded or decoded.
    #[error("codec error for {type_name}: {message}")]
    Codec {
        /// The recorded type name of the payload.
        type_name: String,
        /// The underlying codec message.
        message: String,
    },

    /// A domain event handler failed during synchronous publish.
    #[error("event handler failed: {0}")]
    Handler(String),

    /// A notification could not be delivered.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A storage read or write failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The unit of work could not be committed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// The operation observed a cancelled token.
    #[error("operation cancelled")]
    Cancelled,
}

impl PersistenceError {
    /// Returns `true` when retrying the operation may succeed.
    ///
    /// Instance-creation, codec and validation failures are permanent and
    /// must be fixed by the caller.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Commit(_) | Self::ConcurrencyConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_and_commit_errors_are_transient() {
        assert!(PersistenceError::Storage("connection reset".into()).is_transient());
        assert!(PersistenceError::Commit("serialization failure".into()).is_transient());
        assert!(
            PersistenceError::ConcurrencyConflict {
                aggregate_id: AggregateId::from("a-1"),
                version: 3,
            }
            .is_transient()
        );
    }

    #[test]
    fn test_instance_creation_and_codec_errors_are_permanent() {
        assert!(!PersistenceError::InstanceCreation("no default".into()).is_transient());
        assert!(
            !PersistenceError::Codec {
                type_name: "account.opened".into(),
                message: "missing field".into(),
            }
            .is_transient()
        );
        assert!(!PersistenceError::Cancelled.is_transient());
    }

    #[test]
    fn test_concurrency_conflict_message_names_version() {
        let err = PersistenceError::ConcurrencyConflict {
            aggregate_id: AggregateId::from("a-1"),
            version: 3,
        };

        assert_eq!(
            err.to_string(),
            "concurrency conflict on aggregate a-1: version 3 already exists"
        );
    }
}
