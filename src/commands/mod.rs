//! Built-in commands and the [`Commands`] facade that runs them.
//!
//! Every command is a plain struct implementing [`Validation`]. Stage 1
//! normalizes and checks its fields; stage 2 loads write models through the
//! filter, checks permissions and preconditions, and returns the events to
//! push.

mod instance;
mod login_policy;
mod metadata;
mod org;
mod org_domain;
mod org_idp;
mod project;
mod user;
mod user_email;
mod user_idp_link;
mod user_init;
mod user_password;
mod user_phone;

pub use instance::{AddSecretGenerator, ChangeSecretGenerator, RemoveSecretGenerator};
pub use login_policy::{
    AddIdpToLoginPolicy, AddLoginPolicy, ChangeLoginPolicy, RemoveIdpFromLoginPolicy,
};
pub use metadata::{
    BulkSetMetadata, MetadataTarget, RemoveAllMetadata, RemoveMetadata,
    RemoveUserMetadataKeyInOrg, SetMetadata,
};
pub use org::{AddOrg, ChangeOrg, RemoveOrg};
pub use org_domain::{
    AddOrgDomain, DomainValidation, GenerateOrgDomainValidation, RemoveOrgDomain,
    SetPrimaryOrgDomain, ValidateOrgDomain, VerifyOrgDomain,
};
pub use org_idp::{AddOrgIdpConfig, ChangeOrgIdpConfig, RemoveOrgIdpConfig};
pub use project::{AddProject, RemoveProject};
pub use user::{AddHuman, AddedHuman, ChangeUsername, LockUser, RemoveUser, UnlockUser};
pub use user_email::{ChangeEmail, ResendEmailCode, VerifyEmail};
pub use user_idp_link::{AddUserIdpLink, RemoveUserIdpLink};
pub use user_init::{ResendInitCode, VerifyInitCode};
pub use user_password::{RequestPasswordReset, SetPasswordWithCode};
pub use user_phone::{ChangePhone, RemovePhone, VerifyPhone};

use std::sync::Arc;

use crate::command::CommandContext;
use crate::config::CommandsConfig;
use crate::crypto::EncryptionAlgorithm;
use crate::error::CommandError;
use crate::event::{Aggregate, AggregateType};
use crate::eventstore::EventStore;
use crate::preparation::{self, Env, Outcome, Prepared, Validation};
use crate::services::{
    AllowAll, Clock, IdGenerator, PasswordHasher, PermissionCheck, Services, SystemClock,
    UuidGenerator,
};

/// Entry point for running commands against one event store.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct Commands {
    store: Arc<dyn EventStore>,
    services: Services,
}

impl std::fmt::Debug for Commands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commands")
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl Commands {
    pub fn builder() -> CommandsBuilder {
        CommandsBuilder::new()
    }

    /// Validate, prepare, and push `command`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Request context: instance, actor, correlation ID, deadline.
    /// * `command` - Any built-in or custom [`Validation`].
    ///
    /// # Returns
    ///
    /// The details of the last written event and the command's output.
    ///
    /// # Errors
    ///
    /// See [`preparation::execute`].
    pub async fn execute<V: Validation>(
        &self,
        ctx: &CommandContext,
        command: V,
    ) -> Result<Outcome<V::Output>, CommandError> {
        preparation::execute(self.store.as_ref(), &self.services, ctx, command).await
    }

    /// Validate and prepare `command` without pushing.
    pub async fn prepare<V: Validation>(
        &self,
        ctx: &CommandContext,
        command: V,
    ) -> Result<Prepared<V::Output>, CommandError> {
        preparation::prepare_commands(self.store.as_ref(), &self.services, ctx, command).await
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

/// Builder for [`Commands`].
///
/// An event store and a code encryption collaborator are required; every
/// other collaborator has a production default.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_iam::{AesGcmEncryption, Commands, InMemoryEventStore};
///
/// let key = AesGcmEncryption::generate_key();
/// let commands = Commands::builder()
///     .event_store(Arc::new(InMemoryEventStore::new()))
///     .code_encryption(Arc::new(AesGcmEncryption::new("key-1", &key).expect("valid key")))
///     .build()
///     .expect("builder should succeed");
/// assert_eq!(commands.services().config.max_conflict_retries, 1);
/// ```
pub struct CommandsBuilder {
    store: Option<Arc<dyn EventStore>>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    permissions: Arc<dyn PermissionCheck>,
    code_encryption: Option<Arc<dyn EncryptionAlgorithm>>,
    password_hasher: Option<Arc<dyn PasswordHasher>>,
    config: CommandsConfig,
}

impl CommandsBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            id_generator: Arc::new(UuidGenerator),
            clock: Arc::new(SystemClock),
            permissions: Arc::new(AllowAll),
            code_encryption: None,
            password_hasher: None,
            config: CommandsConfig::default(),
        }
    }

    /// Set the append gateway.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Set the clock used for code expiry.
    ///
    /// Share the same clock with the event store so that event timestamps
    /// and expiry checks agree.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionCheck>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn code_encryption(mut self, code_encryption: Arc<dyn EncryptionAlgorithm>) -> Self {
        self.code_encryption = Some(code_encryption);
        self
    }

    /// Set the password hasher. Without one, password changes fail with
    /// [`CommandError::Internal`].
    pub fn password_hasher(mut self, password_hasher: Arc<dyn PasswordHasher>) -> Self {
        self.password_hasher = Some(password_hasher);
        self
    }

    pub fn config(mut self, config: CommandsConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the [`Commands`] facade.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidArgument`] if no event store or no
    /// code encryption was set, or if a generator override in the config
    /// cannot produce a secret.
    pub fn build(self) -> Result<Commands, CommandError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| CommandError::invalid("an event store is required"))?;
        let code_encryption = self
            .code_encryption
            .ok_or_else(|| CommandError::invalid("a code encryption algorithm is required"))?;
        Ok(Commands {
            store,
            services: Services {
                id_generator: self.id_generator,
                clock: self.clock,
                permissions: self.permissions,
                code_encryption,
                password_hasher: self.password_hasher,
                config: self.config,
            },
        })
    }
}

impl Default for CommandsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage-1 check for a required, non-blank field.
fn require(field: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn aggregate(
    env: &Env<'_>,
    aggregate_type: AggregateType,
    id: &str,
    resource_owner: &str,
) -> Result<Aggregate, CommandError> {
    Aggregate::new(env.ctx.instance_id.clone(), aggregate_type, id, resource_owner)
}
