//! Crate-level error types for command execution, the append gateway, and
//! code encryption.

/// Coarse classification of a [`CommandError`].
///
/// Transport layers map this onto their own status codes; the core never
/// inspects error messages to decide behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input, caught before any I/O.
    InvalidArgument,
    /// The referenced aggregate or entity does not exist or was removed.
    NotFound,
    /// A uniqueness or existence conflict.
    AlreadyExists,
    /// No effective change, or a required prior state is absent.
    PreconditionFailed,
    /// The permission collaborator rejected the actor.
    PermissionDenied,
    /// Optimistic concurrency retries were exhausted.
    Conflict,
    /// Storage, filter, or push failure not attributable to caller input.
    Internal,
}

/// Error returned by a command to its caller.
///
/// Exactly one of these is surfaced per invocation. Stage 1 validation only
/// ever produces [`InvalidArgument`](CommandError::InvalidArgument); the
/// remaining kinds come from stage 2 or from the append gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Caller-supplied input was rejected before any state was read.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target aggregate or sub-entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target already exists or a unique key is taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The current state does not allow the change (or nothing would change).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The actor is not allowed to perform the command.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt of the preparation pipeline lost the race against a
    /// concurrent writer on the same aggregate.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// Unexpected failure in storage, encryption, or a collaborator.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CommandError::NotFound(_) => ErrorKind::NotFound,
            CommandError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CommandError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            CommandError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CommandError::Conflict => ErrorKind::Conflict,
            CommandError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CommandError::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        CommandError::NotFound(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        CommandError::PreconditionFailed(msg.into())
    }

    pub(crate) fn already_exists(msg: impl Into<String>) -> Self {
        CommandError::AlreadyExists(msg.into())
    }
}

/// Error returned by an [`EventStore`](crate::EventStore) from `filter` or
/// `push`.
///
/// A failed push never leaves partial state behind, whatever the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// An add was requested for a `(namespace, key)` that already exists.
    #[error("unique constraint {namespace}/{key} violated: {message}")]
    UniqueViolation {
        /// Ledger namespace of the offending key.
        namespace: String,
        /// The offending key.
        key: String,
        /// Caller-facing message attached to the constraint.
        message: String,
    },

    /// A concurrent writer advanced the aggregate past the guarded sequence.
    #[error("sequence conflict on {aggregate}: expected {expected}, found {actual}")]
    Conflict {
        /// `type/id` of the contended aggregate.
        aggregate: String,
        /// Sequence the batch was prepared against.
        expected: u64,
        /// Latest matching sequence found at commit time.
        actual: u64,
    },

    /// A command failed structural validation.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// The caller's deadline passed before the operation could run.
    #[error("operation cancelled: deadline exceeded")]
    Cancelled,

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Whether the whole preparation pipeline may be retried.
    ///
    /// Only sequence conflicts qualify; a re-run may observe the winning
    /// writer's events and decide differently.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Conflict { .. })
    }
}

impl From<GatewayError> for CommandError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UniqueViolation { message, .. } => CommandError::AlreadyExists(message),
            GatewayError::Conflict { .. } => CommandError::Conflict,
            other => CommandError::Internal(other.to_string()),
        }
    }
}

/// Error returned by an [`EncryptionAlgorithm`](crate::EncryptionAlgorithm).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The stored value names a key that is not in the keyring.
    #[error("unknown encryption key: {0}")]
    UnknownKey(String),

    /// The stored value was produced by a different algorithm.
    #[error("algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch {
        /// Algorithm of the configured collaborator.
        expected: String,
        /// Algorithm recorded on the stored value.
        found: String,
    },

    /// Key material has the wrong length.
    #[error("invalid key material for key {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,

    /// Decryption failed (wrong key or tampered ciphertext).
    #[error("decryption failed")]
    Decrypt,
}

impl From<CryptoError> for CommandError {
    fn from(err: CryptoError) -> Self {
        CommandError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_conflict_display() {
        assert_eq!(
            CommandError::Conflict.to_string(),
            "optimistic concurrency conflict: retries exhausted"
        );
    }

    #[test]
    fn command_error_kind_matches_variant() {
        assert_eq!(
            CommandError::invalid("x").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(CommandError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            CommandError::already_exists("x").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            CommandError::precondition("x").kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            CommandError::PermissionDenied("x".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(CommandError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn unique_violation_maps_to_already_exists_with_message() {
        let err = GatewayError::UniqueViolation {
            namespace: "usernames".into(),
            key: "org-1:alice".into(),
            message: "username already taken".into(),
        };
        assert!(err.to_string().contains("usernames/org-1:alice"));
        assert_eq!(
            CommandError::from(err),
            CommandError::AlreadyExists("username already taken".into())
        );
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = GatewayError::Conflict {
            aggregate: "user/u-1".into(),
            expected: 2,
            actual: 3,
        };
        assert!(conflict.is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::InvalidPayload("bad".into()).is_retryable());
        assert_eq!(CommandError::from(conflict), CommandError::Conflict);
    }

    #[test]
    fn cancelled_and_storage_map_to_internal() {
        assert_eq!(
            CommandError::from(GatewayError::Cancelled).kind(),
            ErrorKind::Internal
        );
        let err = CommandError::from(GatewayError::Storage("disk full".into()));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn crypto_error_maps_to_internal() {
        let err = CommandError::from(CryptoError::UnknownKey("k-9".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("k-9"));
    }

    // Errors cross task boundaries inside the orchestrator.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CommandError>();
            assert_send_sync::<GatewayError>();
            assert_send_sync::<CryptoError>();
        }
    };
}
