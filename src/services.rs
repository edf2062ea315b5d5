//! Injected collaborators: ID generation, time, authorization, and password
//! hashing.
//!
//! Nothing here is process-global. Every collaborator is handed to the
//! pipeline through [`Services`], which is built once per [`Commands`]
//! instance.
//!
//! [`Commands`]: crate::Commands

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::command::CommandContext;
use crate::config::CommandsConfig;
use crate::crypto::EncryptionAlgorithm;
use crate::error::CommandError;

/// Source of identifiers for newly created aggregates.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh aggregate ID.
    fn next_id(&self) -> Result<String, CommandError>;
}

/// Random UUID v4 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> Result<String, CommandError> {
        Ok(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Authorization collaborator.
///
/// Called inside stage 2 before any event is emitted, except for
/// self-service commands where the actor is the target user.
pub trait PermissionCheck: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CommandError::PermissionDenied`] if the actor may not
    /// exercise `permission` on `target_id` owned by `resource_owner`.
    fn check_permission(
        &self,
        ctx: &CommandContext,
        permission: &str,
        resource_owner: &str,
        target_id: &str,
    ) -> Result<(), CommandError>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn check_permission(
        &self,
        _ctx: &CommandContext,
        _permission: &str,
        _resource_owner: &str,
        _target_id: &str,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

/// One-way password hashing.
pub trait PasswordHasher: Send + Sync {
    /// Hash `password` into its encoded, storable form.
    fn hash(&self, password: &str) -> Result<String, CommandError>;
}

/// Permission names checked by the built-in commands.
pub mod permissions {
    pub const USER_WRITE: &str = "user.write";
    pub const USER_DELETE: &str = "user.delete";
    pub const USER_CREDENTIAL_WRITE: &str = "user.credential.write";
    pub const ORG_WRITE: &str = "org.write";
    pub const ORG_DELETE: &str = "org.delete";
    pub const ORG_IDP_WRITE: &str = "org.idp.write";
    pub const POLICY_WRITE: &str = "policy.write";
    pub const PROJECT_WRITE: &str = "project.write";
    pub const PROJECT_DELETE: &str = "project.delete";
    pub const IAM_WRITE: &str = "iam.write";
}

/// Collaborators and configuration available to stage 2 of every command.
#[derive(Clone)]
pub struct Services {
    pub id_generator: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub permissions: Arc<dyn PermissionCheck>,
    pub code_encryption: Arc<dyn EncryptionAlgorithm>,
    pub password_hasher: Option<Arc<dyn PasswordHasher>>,
    pub config: CommandsConfig,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("code_encryption", &self.code_encryption.algorithm())
            .field("password_hasher", &self.password_hasher.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_are_unique_and_compact() {
        let ids = UuidGenerator;
        let a = ids.next_id().expect("id");
        let b = ids.next_id().expect("id");
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
    }

    #[test]
    fn allow_all_permits() {
        let ctx = CommandContext::new("inst-1").with_actor("u-1");
        assert!(
            AllowAll
                .check_permission(&ctx, permissions::USER_WRITE, "org-1", "u-2")
                .is_ok()
        );
    }
}
