//! Write side of a multi-tenant identity and access management service,
//! built on event sourcing.
//!
//! Commands are validated without I/O, then decided against write models
//! reduced from the event log, and finally pushed atomically through an
//! [`EventStore`] that enforces per-aggregate sequencing and unique keys.

mod command;
mod commands;
mod config;
mod crypto;
mod error;
mod event;
mod eventstore;
pub mod payload;
mod preparation;
pub mod secret;
mod services;
pub mod testing;
pub mod unique;
pub mod write_model;

pub use command::{Command, CommandContext, SYSTEM_ACTOR, SequenceGuard};
pub use commands::{
    AddHuman, AddIdpToLoginPolicy, AddLoginPolicy, AddOrg, AddOrgDomain, AddOrgIdpConfig,
    AddProject, AddSecretGenerator, AddUserIdpLink, AddedHuman, BulkSetMetadata, ChangeEmail,
    ChangeLoginPolicy, ChangeOrg, ChangeOrgIdpConfig, ChangePhone, ChangeSecretGenerator,
    ChangeUsername, Commands, CommandsBuilder, DomainValidation, GenerateOrgDomainValidation,
    LockUser, MetadataTarget, RemoveAllMetadata, RemoveIdpFromLoginPolicy, RemoveMetadata,
    RemoveOrg, RemoveOrgDomain, RemoveOrgIdpConfig, RemovePhone, RemoveProject,
    RemoveSecretGenerator, RemoveUser, RemoveUserIdpLink, RemoveUserMetadataKeyInOrg,
    RequestPasswordReset, ResendEmailCode, ResendInitCode, SetMetadata, SetPasswordWithCode,
    SetPrimaryOrgDomain, UnlockUser, ValidateOrgDomain, VerifyEmail, VerifyInitCode,
    VerifyOrgDomain, VerifyPhone,
};
pub use config::{CommandsConfig, DEFAULT_MAX_CODE_ATTEMPTS, DEFAULT_MAX_CONFLICT_RETRIES};
pub use crypto::{AES_256_GCM, AesGcmEncryption, CryptoValue, EncryptionAlgorithm};
pub use error::{CommandError, CryptoError, ErrorKind, GatewayError};
pub use event::{Aggregate, AggregateKey, AggregateType, Event, EventPayload};
pub use eventstore::{EventStore, InMemoryEventStore, QueryClause, SearchQuery};
pub use preparation::{
    CreateCommands, Env, Filter, ObjectDetails, Outcome, Prepared, Validation, execute,
    prepare_commands,
};
pub use services::{
    AllowAll, Clock, IdGenerator, PasswordHasher, PermissionCheck, Services, SystemClock,
    UuidGenerator, permissions,
};
pub use unique::{UniqueAction, UniqueConstraint};
