//! Identity-provider configurations owned by an organization.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::org::OrgEvent;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{IdpDependencyWriteModel, OrgIdpConfigWriteModel, WriteModel};

use super::org::load_org;
use super::{aggregate, require};

/// Register an identity provider for an organization. Outputs the config
/// ID.
#[derive(Debug, Clone, Default)]
pub struct AddOrgIdpConfig {
    pub org_id: String,
    /// Generated if absent.
    pub config_id: Option<String>,
    pub name: String,
    pub auto_register: bool,
}

impl Validation for AddOrgIdpConfig {
    type Output = String;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.name = self.name.trim().to_string();
        require("name", &self.name)?;
        if let Some(config_id) = &self.config_id {
            require("config_id", config_id)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddOrgIdpConfig {
    type Output = String;

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<String>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::ORG_IDP_WRITE, org.org_id(), org.org_id())?;
        let config_id = match &self.config_id {
            Some(id) => id.clone(),
            None => env.next_id()?,
        };
        let idp = env
            .filter
            .load(OrgIdpConfigWriteModel::new(
                env.filter.instance_id(),
                org.org_id(),
                config_id.as_str(),
            ))
            .await?;
        if idp.exists {
            return Err(CommandError::already_exists("identity provider already exists"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, org.org_id(), org.org_id())?,
            OrgEvent::IdpConfigAdded {
                config_id: config_id.clone(),
                name: self.name.clone(),
                auto_register: self.auto_register,
            },
        )
        .guarded(idp.guard());
        Ok(Prepared::new(vec![command], config_id))
    }
}

/// Change an identity provider. Absent fields stay as they are.
#[derive(Debug, Clone, Default)]
pub struct ChangeOrgIdpConfig {
    pub org_id: String,
    pub config_id: String,
    pub name: Option<String>,
    pub auto_register: Option<bool>,
}

impl Validation for ChangeOrgIdpConfig {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        require("config_id", &self.config_id)?;
        if let Some(name) = &mut self.name {
            *name = name.trim().to_string();
            require("name", name)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeOrgIdpConfig {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let idp = load_idp(env, &self.org_id, &self.config_id).await?;
        env.check_permission(permissions::ORG_IDP_WRITE, &self.org_id, &self.org_id)?;
        let name = self.name.clone().filter(|n| *n != idp.name);
        let auto_register = self.auto_register.filter(|a| *a != idp.auto_register);
        if name.is_none() && auto_register.is_none() {
            return Err(CommandError::precondition("identity provider not changed"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::IdpConfigChanged {
                config_id: self.config_id.clone(),
                old_name: idp.name.clone(),
                name,
                auto_register,
            },
        )
        .guarded(idp.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Remove an identity provider together with everything that depends on
/// it: the login policy entry and every user link made through it.
#[derive(Debug, Clone, Default)]
pub struct RemoveOrgIdpConfig {
    pub org_id: String,
    pub config_id: String,
}

impl Validation for RemoveOrgIdpConfig {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        require("config_id", &self.config_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveOrgIdpConfig {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let deps = load_dependencies(env, &self.org_id, &self.config_id).await?;
        if !deps.idp.exists {
            return Err(CommandError::not_found("identity provider not found"));
        }
        env.check_permission(permissions::ORG_IDP_WRITE, &self.org_id, &self.org_id)?;

        let org = aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?;
        let guard = deps.guard();
        let mut commands = vec![
            Command::new(
                org.clone(),
                OrgEvent::IdpConfigRemoved {
                    config_id: self.config_id.clone(),
                    name: deps.idp.name.clone(),
                },
            )
            .guarded(guard.clone()),
        ];
        if deps.policy.allows_idp(&self.config_id) {
            commands.push(
                Command::new(
                    org,
                    OrgEvent::LoginPolicyIdpRemoved {
                        idp_config_id: self.config_id.clone(),
                    },
                )
                .guarded(guard),
            );
        }
        commands.extend(cascade_link_removals(env, &self.org_id, &deps)?);
        Ok(Prepared::new(commands, ()))
    }
}

async fn load_idp(
    env: &Env<'_>,
    org_id: &str,
    config_id: &str,
) -> Result<OrgIdpConfigWriteModel, CommandError> {
    let idp = env
        .filter
        .load(OrgIdpConfigWriteModel::new(env.filter.instance_id(), org_id, config_id))
        .await?;
    if !idp.exists {
        return Err(CommandError::not_found("identity provider not found"));
    }
    Ok(idp)
}

pub(super) async fn load_dependencies(
    env: &Env<'_>,
    org_id: &str,
    config_id: &str,
) -> Result<IdpDependencyWriteModel, CommandError> {
    env.filter
        .load(IdpDependencyWriteModel::new(env.filter.instance_id(), org_id, config_id))
        .await
}

/// One cascade removal per user link made through the provider, each
/// guarded on its user's link history.
pub(super) fn cascade_link_removals(
    env: &Env<'_>,
    org_id: &str,
    deps: &IdpDependencyWriteModel,
) -> Result<Vec<Command>, CommandError> {
    let mut commands = Vec::new();
    for (user_id, external_ids) in &deps.links.links {
        let user = aggregate(env, AggregateType::User, user_id, org_id)?;
        let guard = deps.links.guard_for(user_id);
        for external_user_id in external_ids {
            commands.push(
                Command::new(
                    user.clone(),
                    UserEvent::ExternalIdpCascadeRemoved {
                        idp_config_id: deps.links.idp_config_id.clone(),
                        external_user_id: external_user_id.clone(),
                    },
                )
                .guarded(guard.clone()),
            );
        }
    }
    if !commands.is_empty() {
        tracing::debug!(
            idp_config_id = %deps.links.idp_config_id,
            links = commands.len(),
            "cascading external link removals"
        );
    }
    Ok(commands)
}
