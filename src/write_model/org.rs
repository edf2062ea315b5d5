//! Write models over `org` aggregates: the organization, one of its
//! domains, its IdP configurations and its login policy.

use std::collections::BTreeMap;

use crate::command::SequenceGuard;
use crate::error::CommandError;
use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::{QueryClause, SearchQuery};
use crate::payload::org::{DomainValidationType, LoginPolicySettings, OrgEvent};
use crate::payload::user::UserEvent;
use crate::secret::PendingCode;

use super::{ModelBase, WriteModel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrgState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

fn org_base(instance_id: impl Into<String>, org_id: impl Into<String>) -> ModelBase {
    let org_id = org_id.into();
    ModelBase::new(instance_id, AggregateType::Org, org_id.clone(), org_id)
}

/// An organization with its name and domains.
#[derive(Debug, Clone)]
pub struct OrgWriteModel {
    base: ModelBase,
    pub state: OrgState,
    pub name: String,
    pub primary_domain: Option<String>,
    pub verified_domains: Vec<String>,
}

impl OrgWriteModel {
    pub fn new(instance_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            base: org_base(instance_id, org_id),
            state: OrgState::Unspecified,
            name: String::new(),
            primary_domain: None,
            verified_domains: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.state == OrgState::Active
    }

    pub fn org_id(&self) -> &str {
        &self.base.aggregate_id
    }
}

impl WriteModel for OrgWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Org)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(&[
                    OrgEvent::ADDED,
                    OrgEvent::CHANGED,
                    OrgEvent::REMOVED,
                    OrgEvent::DOMAIN_VERIFIED,
                    OrgEvent::DOMAIN_PRIMARY_SET,
                    OrgEvent::DOMAIN_REMOVED,
                ]),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::Org(payload) = &event.payload else {
            return;
        };
        match payload {
            OrgEvent::Added { name } => {
                self.state = OrgState::Active;
                self.name = name.clone();
            }
            OrgEvent::Changed { name, .. } => self.name = name.clone(),
            OrgEvent::Removed { .. } => {
                self.state = OrgState::Removed;
                self.verified_domains.clear();
                self.primary_domain = None;
            }
            OrgEvent::DomainVerified { domain } => {
                if !self.verified_domains.contains(domain) {
                    self.verified_domains.push(domain.clone());
                }
            }
            OrgEvent::DomainPrimarySet { domain } => self.primary_domain = Some(domain.clone()),
            OrgEvent::DomainRemoved { domain, .. } => {
                self.verified_domains.retain(|d| d != domain);
                if self.primary_domain.as_ref() == Some(domain) {
                    self.primary_domain = None;
                }
            }
            _ => {}
        }
    }
}

/// One domain of an organization.
///
/// Reads every domain event of the org so its guard covers the whole domain
/// set; only events for its own domain change its fields.
#[derive(Debug, Clone)]
pub struct OrgDomainWriteModel {
    base: ModelBase,
    pub domain: String,
    pub exists: bool,
    pub verified: bool,
    pub primary: bool,
    /// Outstanding proof-of-control token, if one was generated.
    pub validation: Option<PendingCode>,
    pub validation_type: Option<DomainValidationType>,
}

impl OrgDomainWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        org_id: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            base: org_base(instance_id, org_id),
            domain: domain.into(),
            exists: false,
            verified: false,
            primary: false,
            validation: None,
            validation_type: None,
        }
    }

    fn is_mine(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.domain)
    }

    fn reset(&mut self) {
        self.exists = false;
        self.verified = false;
        self.primary = false;
        self.validation = None;
        self.validation_type = None;
    }
}

impl WriteModel for OrgDomainWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Org)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(&[
                    OrgEvent::DOMAIN_ADDED,
                    OrgEvent::DOMAIN_VERIFICATION_ADDED,
                    OrgEvent::DOMAIN_VERIFIED,
                    OrgEvent::DOMAIN_PRIMARY_SET,
                    OrgEvent::DOMAIN_REMOVED,
                    OrgEvent::REMOVED,
                ]),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::Org(payload) = &event.payload else {
            return;
        };
        match payload {
            OrgEvent::DomainAdded { domain } if self.is_mine(domain) => {
                self.reset();
                self.exists = true;
            }
            OrgEvent::DomainVerificationAdded {
                domain,
                validation_type,
                code,
                expiry,
            } if self.is_mine(domain) => {
                self.validation = Some(PendingCode {
                    code: code.clone(),
                    created_at: event.created_at,
                    expiry: *expiry,
                });
                self.validation_type = Some(*validation_type);
            }
            OrgEvent::DomainVerified { domain } if self.is_mine(domain) => {
                self.verified = true;
                self.validation = None;
            }
            OrgEvent::DomainPrimarySet { domain } => self.primary = self.is_mine(domain),
            OrgEvent::DomainRemoved { domain, .. } if self.is_mine(domain) => self.reset(),
            OrgEvent::Removed { .. } => self.reset(),
            _ => {}
        }
    }
}

/// One identity-provider configuration of an organization.
#[derive(Debug, Clone)]
pub struct OrgIdpConfigWriteModel {
    base: ModelBase,
    pub config_id: String,
    pub exists: bool,
    pub name: String,
    pub auto_register: bool,
}

impl OrgIdpConfigWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        org_id: impl Into<String>,
        config_id: impl Into<String>,
    ) -> Self {
        Self {
            base: org_base(instance_id, org_id),
            config_id: config_id.into(),
            exists: false,
            name: String::new(),
            auto_register: false,
        }
    }

    fn event_types() -> &'static [&'static str] {
        &[
            OrgEvent::IDP_CONFIG_ADDED,
            OrgEvent::IDP_CONFIG_CHANGED,
            OrgEvent::IDP_CONFIG_REMOVED,
            OrgEvent::REMOVED,
        ]
    }
}

impl WriteModel for OrgIdpConfigWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Org)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(Self::event_types()),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::Org(payload) = &event.payload else {
            return;
        };
        match payload {
            OrgEvent::IdpConfigAdded {
                config_id,
                name,
                auto_register,
            } if *config_id == self.config_id => {
                self.exists = true;
                self.name = name.clone();
                self.auto_register = *auto_register;
            }
            OrgEvent::IdpConfigChanged {
                config_id,
                name,
                auto_register,
                ..
            } if *config_id == self.config_id => {
                if let Some(name) = name {
                    self.name = name.clone();
                }
                if let Some(auto_register) = auto_register {
                    self.auto_register = *auto_register;
                }
            }
            OrgEvent::IdpConfigRemoved { config_id, .. } if *config_id == self.config_id => {
                self.exists = false;
            }
            OrgEvent::Removed { .. } => self.exists = false,
            _ => {}
        }
    }
}

/// The login policy of an organization.
#[derive(Debug, Clone)]
pub struct LoginPolicyWriteModel {
    base: ModelBase,
    pub exists: bool,
    pub settings: LoginPolicySettings,
    /// Identity providers allowed by the policy, in the order they were added.
    pub idp_config_ids: Vec<String>,
}

impl LoginPolicyWriteModel {
    pub fn new(instance_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            base: org_base(instance_id, org_id),
            exists: false,
            settings: LoginPolicySettings::default(),
            idp_config_ids: Vec::new(),
        }
    }

    pub fn allows_idp(&self, idp_config_id: &str) -> bool {
        self.idp_config_ids.iter().any(|id| id == idp_config_id)
    }

    fn event_types() -> &'static [&'static str] {
        &[
            OrgEvent::LOGIN_POLICY_ADDED,
            OrgEvent::LOGIN_POLICY_CHANGED,
            OrgEvent::LOGIN_POLICY_REMOVED,
            OrgEvent::LOGIN_POLICY_IDP_ADDED,
            OrgEvent::LOGIN_POLICY_IDP_REMOVED,
        ]
    }
}

impl WriteModel for LoginPolicyWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Org)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(Self::event_types()),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::Org(payload) = &event.payload else {
            return;
        };
        match payload {
            OrgEvent::LoginPolicyAdded(settings) | OrgEvent::LoginPolicyChanged(settings) => {
                self.exists = true;
                self.settings = *settings;
            }
            OrgEvent::LoginPolicyRemoved => {
                self.exists = false;
                self.settings = LoginPolicySettings::default();
                self.idp_config_ids.clear();
            }
            OrgEvent::LoginPolicyIdpAdded { idp_config_id } => {
                if !self.allows_idp(idp_config_id) {
                    self.idp_config_ids.push(idp_config_id.clone());
                }
            }
            OrgEvent::LoginPolicyIdpRemoved { idp_config_id } => {
                self.idp_config_ids.retain(|id| id != idp_config_id);
            }
            _ => {}
        }
    }
}

/// External links of all users of an organization to one identity provider.
///
/// Spans many user aggregates, so guards are per user via
/// [`guard_for`](OrgIdpLinksWriteModel::guard_for).
#[derive(Debug, Clone)]
pub struct OrgIdpLinksWriteModel {
    base: ModelBase,
    pub idp_config_id: String,
    /// user id → external user ids linked through this provider.
    pub links: BTreeMap<String, Vec<String>>,
}

impl OrgIdpLinksWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        org_id: impl Into<String>,
        idp_config_id: impl Into<String>,
    ) -> Self {
        Self {
            base: ModelBase::new(instance_id, AggregateType::User, "", org_id),
            idp_config_id: idp_config_id.into(),
            links: BTreeMap::new(),
        }
    }

    pub fn guard_for(&self, user_id: &str) -> SequenceGuard {
        SequenceGuard::new(
            self.base.sequence_of(AggregateType::User, user_id),
            Self::event_types().iter().map(|t| (*t).to_string()).collect(),
        )
    }

    fn event_types() -> &'static [&'static str] {
        &[
            UserEvent::EXTERNAL_IDP_ADDED,
            UserEvent::EXTERNAL_IDP_REMOVED,
            UserEvent::EXTERNAL_IDP_CASCADE_REMOVED,
            UserEvent::REMOVED,
        ]
    }

    fn clause() -> QueryClause {
        QueryClause::new(AggregateType::User).event_types(Self::event_types())
    }

    fn unlink(&mut self, user_id: &str, external_user_id: &str) {
        if let Some(ids) = self.links.get_mut(user_id) {
            ids.retain(|id| id != external_user_id);
            if ids.is_empty() {
                self.links.remove(user_id);
            }
        }
    }
}

impl WriteModel for OrgIdpLinksWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(Self::clause())
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::User(payload) = &event.payload else {
            return;
        };
        let user_id = event.aggregate.id.as_str();
        match payload {
            UserEvent::ExternalIdpAdded {
                idp_config_id,
                external_user_id,
                ..
            } if *idp_config_id == self.idp_config_id => {
                let ids = self.links.entry(user_id.to_string()).or_default();
                if !ids.contains(external_user_id) {
                    ids.push(external_user_id.clone());
                }
            }
            UserEvent::ExternalIdpRemoved {
                idp_config_id,
                external_user_id,
            }
            | UserEvent::ExternalIdpCascadeRemoved {
                idp_config_id,
                external_user_id,
            } if *idp_config_id == self.idp_config_id => self.unlink(user_id, external_user_id),
            UserEvent::Removed { .. } => {
                self.links.remove(user_id);
            }
            _ => {}
        }
    }
}

/// Everything that depends on one identity-provider configuration of an
/// organization: the configuration itself, the login policy that may allow
/// it, and the user links made through it.
///
/// Loaded with a single filter; events are routed to the sub-models by
/// aggregate type.
#[derive(Debug, Clone)]
pub struct IdpDependencyWriteModel {
    base: ModelBase,
    pub idp: OrgIdpConfigWriteModel,
    pub policy: LoginPolicyWriteModel,
    pub links: OrgIdpLinksWriteModel,
}

impl IdpDependencyWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        org_id: impl Into<String>,
        idp_config_id: impl Into<String>,
    ) -> Self {
        let instance_id = instance_id.into();
        let org_id = org_id.into();
        let idp_config_id = idp_config_id.into();
        Self {
            base: org_base(instance_id.clone(), org_id.clone()),
            idp: OrgIdpConfigWriteModel::new(
                instance_id.clone(),
                org_id.clone(),
                idp_config_id.clone(),
            ),
            policy: LoginPolicyWriteModel::new(instance_id.clone(), org_id.clone()),
            links: OrgIdpLinksWriteModel::new(instance_id, org_id, idp_config_id),
        }
    }
}

impl WriteModel for IdpDependencyWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        let mut org_types = OrgIdpConfigWriteModel::event_types().to_vec();
        org_types.extend_from_slice(LoginPolicyWriteModel::event_types());
        self.base
            .search_query()
            .clause(
                QueryClause::new(AggregateType::Org)
                    .aggregate_id(self.base.aggregate_id.clone())
                    .event_types(&org_types),
            )
            .clause(OrgIdpLinksWriteModel::clause())
    }

    // Sub-models fold their own events in `reduce`.
    fn apply(&mut self, _event: &Event) {}

    fn append_events(&mut self, events: &[Event]) {
        self.base.buffer(events);
        let (org, users): (Vec<Event>, Vec<Event>) = events
            .iter()
            .cloned()
            .partition(|e| e.aggregate.aggregate_type == AggregateType::Org);
        self.idp.append_events(&org);
        self.policy.append_events(&org);
        self.links.append_events(&users);
    }

    fn reduce(&mut self) -> Result<(), CommandError> {
        for event in self.base.take_buffer() {
            self.base.advance(&event);
        }
        self.idp.reduce()?;
        self.policy.reduce()?;
        self.links.reduce()
    }
}
