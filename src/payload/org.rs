//! Events recorded on `org` aggregates: the organization itself, its
//! domains, its identity-provider configurations, and its login policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metadata::{MetadataRemoved, MetadataSet};
use super::require;
use crate::crypto::CryptoValue;
use crate::event::Aggregate;
use crate::unique::{self, UniqueConstraint};

/// Resolved login-policy switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPolicySettings {
    pub allow_username_password: bool,
    pub allow_register: bool,
    pub allow_external_idp: bool,
    pub force_mfa: bool,
}

/// How an organization proves control of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainValidationType {
    /// Token served over HTTPS under `/.well-known/`.
    Http,
    /// Token published in a TXT record.
    Dns,
}

impl DomainValidationType {
    /// Where `token` has to be published for `domain`.
    pub fn token_location(self, domain: &str, token: &str) -> String {
        match self {
            DomainValidationType::Http => {
                format!("https://{domain}/.well-known/iam-challenge/{token}.txt")
            }
            DomainValidationType::Dns => format!("_iam-challenge.{domain}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrgEvent {
    #[serde(rename = "org.added")]
    Added { name: String },
    #[serde(rename = "org.changed")]
    Changed { old_name: String, name: String },
    #[serde(rename = "org.removed")]
    Removed {
        name: String,
        #[serde(default)]
        verified_domains: Vec<String>,
    },

    #[serde(rename = "org.domain.added")]
    DomainAdded { domain: String },
    #[serde(rename = "org.domain.verification.added")]
    DomainVerificationAdded {
        domain: String,
        validation_type: DomainValidationType,
        code: CryptoValue,
        #[serde(default)]
        expiry: Duration,
    },
    #[serde(rename = "org.domain.verification.failed")]
    DomainVerificationFailed { domain: String },
    #[serde(rename = "org.domain.verified")]
    DomainVerified { domain: String },
    #[serde(rename = "org.domain.primary.set")]
    DomainPrimarySet { domain: String },
    #[serde(rename = "org.domain.removed")]
    DomainRemoved { domain: String, was_verified: bool },

    #[serde(rename = "org.idp.config.added")]
    IdpConfigAdded {
        config_id: String,
        name: String,
        auto_register: bool,
    },
    #[serde(rename = "org.idp.config.changed")]
    IdpConfigChanged {
        config_id: String,
        old_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_register: Option<bool>,
    },
    #[serde(rename = "org.idp.config.removed")]
    IdpConfigRemoved { config_id: String, name: String },

    #[serde(rename = "org.policy.login.added")]
    LoginPolicyAdded(LoginPolicySettings),
    #[serde(rename = "org.policy.login.changed")]
    LoginPolicyChanged(LoginPolicySettings),
    #[serde(rename = "org.policy.login.removed")]
    LoginPolicyRemoved,
    #[serde(rename = "org.policy.login.idp.added")]
    LoginPolicyIdpAdded { idp_config_id: String },
    #[serde(rename = "org.policy.login.idp.removed")]
    LoginPolicyIdpRemoved { idp_config_id: String },

    #[serde(rename = "org.metadata.set")]
    MetadataSet(MetadataSet),
    #[serde(rename = "org.metadata.removed")]
    MetadataRemoved(MetadataRemoved),
    #[serde(rename = "org.metadata.removed.all")]
    MetadataRemovedAll,
}

impl OrgEvent {
    pub const ADDED: &'static str = "org.added";
    pub const CHANGED: &'static str = "org.changed";
    pub const REMOVED: &'static str = "org.removed";
    pub const DOMAIN_ADDED: &'static str = "org.domain.added";
    pub const DOMAIN_VERIFICATION_ADDED: &'static str = "org.domain.verification.added";
    pub const DOMAIN_VERIFICATION_FAILED: &'static str = "org.domain.verification.failed";
    pub const DOMAIN_VERIFIED: &'static str = "org.domain.verified";
    pub const DOMAIN_PRIMARY_SET: &'static str = "org.domain.primary.set";
    pub const DOMAIN_REMOVED: &'static str = "org.domain.removed";
    pub const IDP_CONFIG_ADDED: &'static str = "org.idp.config.added";
    pub const IDP_CONFIG_CHANGED: &'static str = "org.idp.config.changed";
    pub const IDP_CONFIG_REMOVED: &'static str = "org.idp.config.removed";
    pub const LOGIN_POLICY_ADDED: &'static str = "org.policy.login.added";
    pub const LOGIN_POLICY_CHANGED: &'static str = "org.policy.login.changed";
    pub const LOGIN_POLICY_REMOVED: &'static str = "org.policy.login.removed";
    pub const LOGIN_POLICY_IDP_ADDED: &'static str = "org.policy.login.idp.added";
    pub const LOGIN_POLICY_IDP_REMOVED: &'static str = "org.policy.login.idp.removed";
    pub const METADATA_SET: &'static str = "org.metadata.set";
    pub const METADATA_REMOVED: &'static str = "org.metadata.removed";
    pub const METADATA_REMOVED_ALL: &'static str = "org.metadata.removed.all";

    pub fn event_type(&self) -> &'static str {
        match self {
            OrgEvent::Added { .. } => Self::ADDED,
            OrgEvent::Changed { .. } => Self::CHANGED,
            OrgEvent::Removed { .. } => Self::REMOVED,
            OrgEvent::DomainAdded { .. } => Self::DOMAIN_ADDED,
            OrgEvent::DomainVerificationAdded { .. } => Self::DOMAIN_VERIFICATION_ADDED,
            OrgEvent::DomainVerificationFailed { .. } => Self::DOMAIN_VERIFICATION_FAILED,
            OrgEvent::DomainVerified { .. } => Self::DOMAIN_VERIFIED,
            OrgEvent::DomainPrimarySet { .. } => Self::DOMAIN_PRIMARY_SET,
            OrgEvent::DomainRemoved { .. } => Self::DOMAIN_REMOVED,
            OrgEvent::IdpConfigAdded { .. } => Self::IDP_CONFIG_ADDED,
            OrgEvent::IdpConfigChanged { .. } => Self::IDP_CONFIG_CHANGED,
            OrgEvent::IdpConfigRemoved { .. } => Self::IDP_CONFIG_REMOVED,
            OrgEvent::LoginPolicyAdded(_) => Self::LOGIN_POLICY_ADDED,
            OrgEvent::LoginPolicyChanged(_) => Self::LOGIN_POLICY_CHANGED,
            OrgEvent::LoginPolicyRemoved => Self::LOGIN_POLICY_REMOVED,
            OrgEvent::LoginPolicyIdpAdded { .. } => Self::LOGIN_POLICY_IDP_ADDED,
            OrgEvent::LoginPolicyIdpRemoved { .. } => Self::LOGIN_POLICY_IDP_REMOVED,
            OrgEvent::MetadataSet(_) => Self::METADATA_SET,
            OrgEvent::MetadataRemoved(_) => Self::METADATA_REMOVED,
            OrgEvent::MetadataRemovedAll => Self::METADATA_REMOVED_ALL,
        }
    }

    pub(crate) fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        let org = &aggregate.id;
        match self {
            OrgEvent::Added { name } => vec![UniqueConstraint::add(
                unique::ORG_NAMES,
                unique::org_name_key(name),
                "organization name already taken",
            )],
            OrgEvent::Changed { old_name, name } => vec![
                UniqueConstraint::remove(unique::ORG_NAMES, unique::org_name_key(old_name)),
                UniqueConstraint::add(
                    unique::ORG_NAMES,
                    unique::org_name_key(name),
                    "organization name already taken",
                ),
            ],
            OrgEvent::Removed {
                name,
                verified_domains,
            } => {
                let mut constraints = vec![UniqueConstraint::remove(
                    unique::ORG_NAMES,
                    unique::org_name_key(name),
                )];
                constraints.extend(verified_domains.iter().map(|domain| {
                    UniqueConstraint::remove(unique::ORG_DOMAINS, unique::org_domain_key(domain))
                }));
                constraints
            }
            OrgEvent::DomainVerified { domain } => vec![UniqueConstraint::add(
                unique::ORG_DOMAINS,
                unique::org_domain_key(domain),
                "domain already claimed by another organization",
            )],
            OrgEvent::DomainRemoved {
                domain,
                was_verified: true,
            } => vec![UniqueConstraint::remove(
                unique::ORG_DOMAINS,
                unique::org_domain_key(domain),
            )],
            OrgEvent::IdpConfigAdded { name, .. } => vec![UniqueConstraint::add(
                unique::IDP_CONFIG_NAMES,
                unique::idp_config_name_key(org, name),
                "identity provider name already taken",
            )],
            OrgEvent::IdpConfigChanged {
                old_name,
                name: Some(name),
                ..
            } if name != old_name => vec![
                UniqueConstraint::remove(
                    unique::IDP_CONFIG_NAMES,
                    unique::idp_config_name_key(org, old_name),
                ),
                UniqueConstraint::add(
                    unique::IDP_CONFIG_NAMES,
                    unique::idp_config_name_key(org, name),
                    "identity provider name already taken",
                ),
            ],
            OrgEvent::IdpConfigRemoved { name, .. } => vec![UniqueConstraint::remove(
                unique::IDP_CONFIG_NAMES,
                unique::idp_config_name_key(org, name),
            )],
            _ => Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            OrgEvent::Added { name } | OrgEvent::Removed { name, .. } => require("name", name),
            OrgEvent::Changed { name, .. } => require("name", name),
            OrgEvent::DomainAdded { domain }
            | OrgEvent::DomainVerificationAdded { domain, .. }
            | OrgEvent::DomainVerificationFailed { domain }
            | OrgEvent::DomainVerified { domain }
            | OrgEvent::DomainPrimarySet { domain }
            | OrgEvent::DomainRemoved { domain, .. } => require("domain", domain),
            OrgEvent::IdpConfigAdded {
                config_id, name, ..
            } => {
                require("config_id", config_id)?;
                require("name", name)
            }
            OrgEvent::IdpConfigChanged {
                config_id, name, ..
            } => {
                require("config_id", config_id)?;
                match name {
                    Some(name) => require("name", name),
                    None => Ok(()),
                }
            }
            OrgEvent::IdpConfigRemoved { config_id, .. } => require("config_id", config_id),
            OrgEvent::LoginPolicyIdpAdded { idp_config_id }
            | OrgEvent::LoginPolicyIdpRemoved { idp_config_id } => {
                require("idp_config_id", idp_config_id)
            }
            OrgEvent::MetadataSet(set) => set.validate(),
            OrgEvent::MetadataRemoved(removed) => removed.validate(),
            OrgEvent::LoginPolicyAdded(_)
            | OrgEvent::LoginPolicyChanged(_)
            | OrgEvent::LoginPolicyRemoved
            | OrgEvent::MetadataRemovedAll => Ok(()),
        }
    }
}
