//! Uniqueness-ledger instructions and the key namespaces they use.
//!
//! A constraint is never written on its own. It is derived from the payload
//! of a command and applied by the append gateway in the same atomic unit
//! as the event it belongs to.

/// Namespace for usernames, scoped per organization.
pub const USERNAMES: &str = "usernames";
/// Namespace for organization names, scoped per instance.
pub const ORG_NAMES: &str = "org_names";
/// Namespace for verified organization domains, scoped per instance.
pub const ORG_DOMAINS: &str = "org_domains";
/// Namespace for identity-provider configuration names, scoped per org.
pub const IDP_CONFIG_NAMES: &str = "idp_config_names";
/// Namespace for links between a user and an external identity.
pub const EXTERNAL_IDPS: &str = "external_idps";
/// Namespace for project names, scoped per org.
pub const PROJECT_NAMES: &str = "project_names";

/// Whether a constraint claims or releases its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueAction {
    /// Claim the key; the push fails if it is already taken.
    Add,
    /// Release the key; a no-op if it is absent.
    Remove,
}

/// A single staged mutation of the uniqueness ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    /// Claim or release.
    pub action: UniqueAction,
    /// Ledger namespace.
    pub namespace: &'static str,
    /// Key within the namespace.
    pub key: String,
    /// Message surfaced to the caller when an add collides.
    pub error_message: &'static str,
}

impl UniqueConstraint {
    /// Stage a claim of `key` in `namespace`.
    pub fn add(namespace: &'static str, key: String, error_message: &'static str) -> Self {
        Self {
            action: UniqueAction::Add,
            namespace,
            key,
            error_message,
        }
    }

    /// Stage a release of `key` in `namespace`.
    pub fn remove(namespace: &'static str, key: String) -> Self {
        Self {
            action: UniqueAction::Remove,
            namespace,
            key,
            error_message: "",
        }
    }
}

pub(crate) fn username_key(org_id: &str, username: &str) -> String {
    format!("{org_id}:{}", username.to_lowercase())
}

pub(crate) fn org_name_key(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) fn org_domain_key(domain: &str) -> String {
    domain.to_lowercase()
}

pub(crate) fn idp_config_name_key(org_id: &str, name: &str) -> String {
    format!("{org_id}:{name}")
}

pub(crate) fn external_idp_key(idp_config_id: &str, external_user_id: &str) -> String {
    format!("{idp_config_id}:{external_user_id}")
}

pub(crate) fn project_name_key(org_id: &str, name: &str) -> String {
    format!("{org_id}:{name}")
}
