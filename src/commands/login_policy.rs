//! Org login policies and the identity providers they allow.
//!
//! Removing an IdP from the policy also removes every user link to it in
//! the same push.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::org::{LoginPolicySettings, OrgEvent};
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{LoginPolicyWriteModel, WriteModel};

use super::org::load_org;
use super::org_idp::{cascade_link_removals, load_dependencies};
use super::{aggregate, require};

/// Create the login policy of an organization.
#[derive(Debug, Clone, Default)]
pub struct AddLoginPolicy {
    pub org_id: String,
    pub settings: LoginPolicySettings,
}

impl Validation for AddLoginPolicy {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddLoginPolicy {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::POLICY_WRITE, org.org_id(), org.org_id())?;
        let policy = load_policy(env, org.org_id()).await?;
        if policy.exists {
            return Err(CommandError::already_exists("login policy already exists"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, org.org_id(), org.org_id())?,
            OrgEvent::LoginPolicyAdded(self.settings),
        )
        .guarded(policy.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeLoginPolicy {
    pub org_id: String,
    pub settings: LoginPolicySettings,
}

impl Validation for ChangeLoginPolicy {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeLoginPolicy {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let policy = load_existing_policy(env, &self.org_id).await?;
        env.check_permission(permissions::POLICY_WRITE, &self.org_id, &self.org_id)?;
        if policy.settings == self.settings {
            return Err(CommandError::precondition("login policy not changed"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::LoginPolicyChanged(self.settings),
        )
        .guarded(policy.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Allow an identity provider in the login policy.
#[derive(Debug, Clone, Default)]
pub struct AddIdpToLoginPolicy {
    pub org_id: String,
    pub idp_config_id: String,
}

impl Validation for AddIdpToLoginPolicy {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        require("idp_config_id", &self.idp_config_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddIdpToLoginPolicy {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let deps = load_dependencies(env, &self.org_id, &self.idp_config_id).await?;
        env.check_permission(permissions::POLICY_WRITE, &self.org_id, &self.org_id)?;
        if !deps.policy.exists {
            return Err(CommandError::not_found("login policy not found"));
        }
        if !deps.idp.exists {
            return Err(CommandError::precondition("identity provider not configured"));
        }
        if deps.policy.allows_idp(&self.idp_config_id) {
            return Err(CommandError::already_exists(
                "identity provider already allowed by login policy",
            ));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::LoginPolicyIdpAdded {
                idp_config_id: self.idp_config_id.clone(),
            },
        )
        .guarded(deps.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Disallow an identity provider in the login policy.
///
/// Every user link made through the provider is removed in the same push.
#[derive(Debug, Clone, Default)]
pub struct RemoveIdpFromLoginPolicy {
    pub org_id: String,
    pub idp_config_id: String,
}

impl Validation for RemoveIdpFromLoginPolicy {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        require("idp_config_id", &self.idp_config_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveIdpFromLoginPolicy {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let deps = load_dependencies(env, &self.org_id, &self.idp_config_id).await?;
        env.check_permission(permissions::POLICY_WRITE, &self.org_id, &self.org_id)?;
        if !deps.policy.allows_idp(&self.idp_config_id) {
            return Err(CommandError::not_found(
                "identity provider not allowed by login policy",
            ));
        }
        let mut commands = vec![
            Command::new(
                aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
                OrgEvent::LoginPolicyIdpRemoved {
                    idp_config_id: self.idp_config_id.clone(),
                },
            )
            .guarded(deps.guard()),
        ];
        commands.extend(cascade_link_removals(env, &self.org_id, &deps)?);
        Ok(Prepared::new(commands, ()))
    }
}

async fn load_policy(env: &Env<'_>, org_id: &str) -> Result<LoginPolicyWriteModel, CommandError> {
    env.filter
        .load(LoginPolicyWriteModel::new(env.filter.instance_id(), org_id))
        .await
}

async fn load_existing_policy(
    env: &Env<'_>,
    org_id: &str,
) -> Result<LoginPolicyWriteModel, CommandError> {
    let policy = load_policy(env, org_id).await?;
    if !policy.exists {
        return Err(CommandError::not_found("login policy not found"));
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::Harness;

    #[tokio::test]
    async fn policy_add_and_change() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        h.add_login_policy(&org).await;
        assert!(matches!(
            h.commands
                .execute(
                    &h.ctx,
                    AddLoginPolicy {
                        org_id: org.clone(),
                        settings: LoginPolicySettings::default(),
                    },
                )
                .await,
            Err(CommandError::AlreadyExists(_))
        ));

        let current = LoginPolicySettings {
            allow_username_password: true,
            allow_external_idp: true,
            ..LoginPolicySettings::default()
        };
        assert!(matches!(
            h.commands
                .execute(
                    &h.ctx,
                    ChangeLoginPolicy {
                        org_id: org.clone(),
                        settings: current,
                    },
                )
                .await,
            Err(CommandError::PreconditionFailed(_))
        ));
        h.commands
            .execute(
                &h.ctx,
                ChangeLoginPolicy {
                    org_id: org,
                    settings: LoginPolicySettings {
                        force_mfa: true,
                        ..current
                    },
                },
            )
            .await
            .expect("change should succeed");
    }

    #[tokio::test]
    async fn idp_must_exist_and_be_added_once() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        h.add_login_policy(&org).await;
        let missing = AddIdpToLoginPolicy {
            org_id: org.clone(),
            idp_config_id: "nope".into(),
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, missing).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        let idp = h.add_idp(&org, "GitHub").await;
        h.allow_idp(&org, &idp).await;
        let again = AddIdpToLoginPolicy {
            org_id: org,
            idp_config_id: idp,
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, again).await,
            Err(CommandError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn removing_unallowed_idp_is_not_found() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        h.add_login_policy(&org).await;
        let idp = h.add_idp(&org, "GitHub").await;
        let result = h
            .commands
            .execute(
                &h.ctx,
                RemoveIdpFromLoginPolicy {
                    org_id: org,
                    idp_config_id: idp,
                },
            )
            .await;
        assert!(matches!(result, Err(CommandError::NotFound(_))));
    }
}
