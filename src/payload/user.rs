//! Events recorded on `user` aggregates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metadata::{MetadataRemoved, MetadataSet};
use super::require;
use crate::crypto::CryptoValue;
use crate::event::Aggregate;
use crate::unique::{self, UniqueConstraint};

/// Link between a user and an identity at an external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalLink {
    /// Org-level identity-provider configuration the link belongs to.
    pub idp_config_id: String,
    /// Subject identifier at the external provider.
    pub external_user_id: String,
}

/// Facts about a human user.
///
/// Uses adjacently tagged serialization (`"type"` + `"data"`); the tag is
/// the dotted event type stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UserEvent {
    #[serde(rename = "user.human.added")]
    HumanAdded {
        username: String,
        first_name: String,
        last_name: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_language: Option<String>,
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
    },
    #[serde(rename = "user.username.changed")]
    UsernameChanged { old_username: String, username: String },
    #[serde(rename = "user.locked")]
    Locked,
    #[serde(rename = "user.unlocked")]
    Unlocked,
    #[serde(rename = "user.removed")]
    Removed {
        username: String,
        #[serde(default)]
        external_links: Vec<ExternalLink>,
    },

    #[serde(rename = "user.human.email.changed")]
    EmailChanged { email: String },
    #[serde(rename = "user.human.email.code.added")]
    EmailCodeAdded {
        code: CryptoValue,
        expiry: Duration,
        code_returned: bool,
    },
    #[serde(rename = "user.human.email.verified")]
    EmailVerified,
    #[serde(rename = "user.human.email.verification.failed")]
    EmailVerificationFailed,

    #[serde(rename = "user.human.phone.changed")]
    PhoneChanged { phone: String },
    #[serde(rename = "user.human.phone.code.added")]
    PhoneCodeAdded {
        code: CryptoValue,
        expiry: Duration,
        code_returned: bool,
    },
    #[serde(rename = "user.human.phone.verified")]
    PhoneVerified,
    #[serde(rename = "user.human.phone.verification.failed")]
    PhoneVerificationFailed,
    #[serde(rename = "user.human.phone.removed")]
    PhoneRemoved,

    #[serde(rename = "user.human.password.code.added")]
    PasswordCodeAdded {
        code: CryptoValue,
        expiry: Duration,
        code_returned: bool,
    },
    #[serde(rename = "user.human.password.code.check.failed")]
    PasswordCodeCheckFailed,
    #[serde(rename = "user.human.password.changed")]
    PasswordChanged {
        encoded_hash: String,
        change_required: bool,
    },

    #[serde(rename = "user.human.initialization.code.added")]
    InitCodeAdded {
        code: CryptoValue,
        expiry: Duration,
        code_returned: bool,
    },
    #[serde(rename = "user.human.initialization.check.succeeded")]
    InitializedCheckSucceeded,
    #[serde(rename = "user.human.initialization.check.failed")]
    InitializedCheckFailed,

    #[serde(rename = "user.human.externalidp.added")]
    ExternalIdpAdded {
        idp_config_id: String,
        external_user_id: String,
        display_name: String,
    },
    #[serde(rename = "user.human.externalidp.removed")]
    ExternalIdpRemoved {
        idp_config_id: String,
        external_user_id: String,
    },
    #[serde(rename = "user.human.externalidp.cascade.removed")]
    ExternalIdpCascadeRemoved {
        idp_config_id: String,
        external_user_id: String,
    },

    #[serde(rename = "user.metadata.set")]
    MetadataSet(MetadataSet),
    #[serde(rename = "user.metadata.removed")]
    MetadataRemoved(MetadataRemoved),
    #[serde(rename = "user.metadata.removed.all")]
    MetadataRemovedAll,
}

impl UserEvent {
    pub const HUMAN_ADDED: &'static str = "user.human.added";
    pub const USERNAME_CHANGED: &'static str = "user.username.changed";
    pub const LOCKED: &'static str = "user.locked";
    pub const UNLOCKED: &'static str = "user.unlocked";
    pub const REMOVED: &'static str = "user.removed";
    pub const EMAIL_CHANGED: &'static str = "user.human.email.changed";
    pub const EMAIL_CODE_ADDED: &'static str = "user.human.email.code.added";
    pub const EMAIL_VERIFIED: &'static str = "user.human.email.verified";
    pub const EMAIL_VERIFICATION_FAILED: &'static str = "user.human.email.verification.failed";
    pub const PHONE_CHANGED: &'static str = "user.human.phone.changed";
    pub const PHONE_CODE_ADDED: &'static str = "user.human.phone.code.added";
    pub const PHONE_VERIFIED: &'static str = "user.human.phone.verified";
    pub const PHONE_VERIFICATION_FAILED: &'static str = "user.human.phone.verification.failed";
    pub const PHONE_REMOVED: &'static str = "user.human.phone.removed";
    pub const PASSWORD_CODE_ADDED: &'static str = "user.human.password.code.added";
    pub const PASSWORD_CODE_CHECK_FAILED: &'static str = "user.human.password.code.check.failed";
    pub const PASSWORD_CHANGED: &'static str = "user.human.password.changed";
    pub const INIT_CODE_ADDED: &'static str = "user.human.initialization.code.added";
    pub const INITIALIZED_CHECK_SUCCEEDED: &'static str =
        "user.human.initialization.check.succeeded";
    pub const INITIALIZED_CHECK_FAILED: &'static str = "user.human.initialization.check.failed";
    pub const EXTERNAL_IDP_ADDED: &'static str = "user.human.externalidp.added";
    pub const EXTERNAL_IDP_REMOVED: &'static str = "user.human.externalidp.removed";
    pub const EXTERNAL_IDP_CASCADE_REMOVED: &'static str =
        "user.human.externalidp.cascade.removed";
    pub const METADATA_SET: &'static str = "user.metadata.set";
    pub const METADATA_REMOVED: &'static str = "user.metadata.removed";
    pub const METADATA_REMOVED_ALL: &'static str = "user.metadata.removed.all";

    /// Every event type except metadata, i.e. everything that shapes the
    /// user itself.
    pub const LIFECYCLE_TYPES: &'static [&'static str] = &[
        Self::HUMAN_ADDED,
        Self::USERNAME_CHANGED,
        Self::LOCKED,
        Self::UNLOCKED,
        Self::REMOVED,
        Self::EMAIL_CHANGED,
        Self::EMAIL_CODE_ADDED,
        Self::EMAIL_VERIFIED,
        Self::EMAIL_VERIFICATION_FAILED,
        Self::PHONE_CHANGED,
        Self::PHONE_CODE_ADDED,
        Self::PHONE_VERIFIED,
        Self::PHONE_VERIFICATION_FAILED,
        Self::PHONE_REMOVED,
        Self::PASSWORD_CODE_ADDED,
        Self::PASSWORD_CODE_CHECK_FAILED,
        Self::PASSWORD_CHANGED,
        Self::INIT_CODE_ADDED,
        Self::INITIALIZED_CHECK_SUCCEEDED,
        Self::INITIALIZED_CHECK_FAILED,
        Self::EXTERNAL_IDP_ADDED,
        Self::EXTERNAL_IDP_REMOVED,
        Self::EXTERNAL_IDP_CASCADE_REMOVED,
    ];

    /// Dotted event type of this variant.
    pub fn event_type(&self) -> &'static str {
        match self {
            UserEvent::HumanAdded { .. } => Self::HUMAN_ADDED,
            UserEvent::UsernameChanged { .. } => Self::USERNAME_CHANGED,
            UserEvent::Locked => Self::LOCKED,
            UserEvent::Unlocked => Self::UNLOCKED,
            UserEvent::Removed { .. } => Self::REMOVED,
            UserEvent::EmailChanged { .. } => Self::EMAIL_CHANGED,
            UserEvent::EmailCodeAdded { .. } => Self::EMAIL_CODE_ADDED,
            UserEvent::EmailVerified => Self::EMAIL_VERIFIED,
            UserEvent::EmailVerificationFailed => Self::EMAIL_VERIFICATION_FAILED,
            UserEvent::PhoneChanged { .. } => Self::PHONE_CHANGED,
            UserEvent::PhoneCodeAdded { .. } => Self::PHONE_CODE_ADDED,
            UserEvent::PhoneVerified => Self::PHONE_VERIFIED,
            UserEvent::PhoneVerificationFailed => Self::PHONE_VERIFICATION_FAILED,
            UserEvent::PhoneRemoved => Self::PHONE_REMOVED,
            UserEvent::PasswordCodeAdded { .. } => Self::PASSWORD_CODE_ADDED,
            UserEvent::PasswordCodeCheckFailed => Self::PASSWORD_CODE_CHECK_FAILED,
            UserEvent::PasswordChanged { .. } => Self::PASSWORD_CHANGED,
            UserEvent::InitCodeAdded { .. } => Self::INIT_CODE_ADDED,
            UserEvent::InitializedCheckSucceeded => Self::INITIALIZED_CHECK_SUCCEEDED,
            UserEvent::InitializedCheckFailed => Self::INITIALIZED_CHECK_FAILED,
            UserEvent::ExternalIdpAdded { .. } => Self::EXTERNAL_IDP_ADDED,
            UserEvent::ExternalIdpRemoved { .. } => Self::EXTERNAL_IDP_REMOVED,
            UserEvent::ExternalIdpCascadeRemoved { .. } => Self::EXTERNAL_IDP_CASCADE_REMOVED,
            UserEvent::MetadataSet(_) => Self::METADATA_SET,
            UserEvent::MetadataRemoved(_) => Self::METADATA_REMOVED,
            UserEvent::MetadataRemovedAll => Self::METADATA_REMOVED_ALL,
        }
    }

    pub(crate) fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        let org = &aggregate.resource_owner;
        match self {
            UserEvent::HumanAdded { username, .. } => vec![UniqueConstraint::add(
                unique::USERNAMES,
                unique::username_key(org, username),
                "username already taken",
            )],
            UserEvent::UsernameChanged {
                old_username,
                username,
            } => vec![
                UniqueConstraint::remove(
                    unique::USERNAMES,
                    unique::username_key(org, old_username),
                ),
                UniqueConstraint::add(
                    unique::USERNAMES,
                    unique::username_key(org, username),
                    "username already taken",
                ),
            ],
            UserEvent::Removed {
                username,
                external_links,
            } => {
                let mut constraints = vec![UniqueConstraint::remove(
                    unique::USERNAMES,
                    unique::username_key(org, username),
                )];
                constraints.extend(external_links.iter().map(|link| {
                    UniqueConstraint::remove(
                        unique::EXTERNAL_IDPS,
                        unique::external_idp_key(&link.idp_config_id, &link.external_user_id),
                    )
                }));
                constraints
            }
            UserEvent::ExternalIdpAdded {
                idp_config_id,
                external_user_id,
                ..
            } => vec![UniqueConstraint::add(
                unique::EXTERNAL_IDPS,
                unique::external_idp_key(idp_config_id, external_user_id),
                "external identity already linked",
            )],
            UserEvent::ExternalIdpRemoved {
                idp_config_id,
                external_user_id,
            }
            | UserEvent::ExternalIdpCascadeRemoved {
                idp_config_id,
                external_user_id,
            } => vec![UniqueConstraint::remove(
                unique::EXTERNAL_IDPS,
                unique::external_idp_key(idp_config_id, external_user_id),
            )],
            _ => Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            UserEvent::HumanAdded {
                username,
                first_name,
                last_name,
                email,
                ..
            } => {
                require("username", username)?;
                require("first_name", first_name)?;
                require("last_name", last_name)?;
                require("email", email)
            }
            UserEvent::UsernameChanged { username, .. } => require("username", username),
            UserEvent::Removed { username, .. } => require("username", username),
            UserEvent::EmailChanged { email } => require("email", email),
            UserEvent::PhoneChanged { phone } => require("phone", phone),
            UserEvent::EmailCodeAdded { code, .. }
            | UserEvent::PhoneCodeAdded { code, .. }
            | UserEvent::PasswordCodeAdded { code, .. }
            | UserEvent::InitCodeAdded { code, .. } => {
                if code.crypted.is_empty() {
                    Err("code must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
            UserEvent::PasswordChanged { encoded_hash, .. } => {
                require("encoded_hash", encoded_hash)
            }
            UserEvent::ExternalIdpAdded {
                idp_config_id,
                external_user_id,
                ..
            }
            | UserEvent::ExternalIdpRemoved {
                idp_config_id,
                external_user_id,
            }
            | UserEvent::ExternalIdpCascadeRemoved {
                idp_config_id,
                external_user_id,
            } => {
                require("idp_config_id", idp_config_id)?;
                require("external_user_id", external_user_id)
            }
            UserEvent::MetadataSet(set) => set.validate(),
            UserEvent::MetadataRemoved(removed) => removed.validate(),
            _ => Ok(()),
        }
    }
}
