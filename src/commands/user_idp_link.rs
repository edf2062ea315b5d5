//! Links between users and external identities.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{OrgIdpConfigWriteModel, WriteModel};

use super::require;
use super::user::{load_user, user_aggregate};

/// Link a user to an identity at one of its organization's identity
/// providers.
#[derive(Debug, Clone, Default)]
pub struct AddUserIdpLink {
    pub user_id: String,
    pub idp_config_id: String,
    pub external_user_id: String,
    pub display_name: String,
}

impl Validation for AddUserIdpLink {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        require("idp_config_id", &self.idp_config_id)?;
        self.external_user_id = self.external_user_id.trim().to_string();
        require("external_user_id", &self.external_user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddUserIdpLink {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        let idp = env
            .filter
            .load(OrgIdpConfigWriteModel::new(
                env.filter.instance_id(),
                user.resource_owner(),
                self.idp_config_id.as_str(),
            ))
            .await?;
        if !idp.exists {
            return Err(CommandError::precondition("identity provider not configured"));
        }
        if user.has_link(&self.idp_config_id, &self.external_user_id) {
            return Err(CommandError::already_exists("external identity already linked"));
        }
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::ExternalIdpAdded {
                idp_config_id: self.idp_config_id.clone(),
                external_user_id: self.external_user_id.clone(),
                display_name: self.display_name.clone(),
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoveUserIdpLink {
    pub user_id: String,
    pub idp_config_id: String,
    pub external_user_id: String,
}

impl Validation for RemoveUserIdpLink {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        require("idp_config_id", &self.idp_config_id)?;
        require("external_user_id", &self.external_user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveUserIdpLink {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if !user.has_link(&self.idp_config_id, &self.external_user_id) {
            return Err(CommandError::not_found("external identity not linked"));
        }
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::ExternalIdpRemoved {
                idp_config_id: self.idp_config_id.clone(),
                external_user_id: self.external_user_id.clone(),
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}
