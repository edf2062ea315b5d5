//! Organization lifecycle.

use async_trait::async_trait;

use crate::command::{Command, SequenceGuard};
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::org::OrgEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{OrgWriteModel, WriteModel};

use super::{aggregate, require};

/// Create an organization. Outputs the org ID.
#[derive(Debug, Clone, Default)]
pub struct AddOrg {
    pub name: String,
    /// Generated if absent.
    pub org_id: Option<String>,
}

impl Validation for AddOrg {
    type Output = String;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        self.name = self.name.trim().to_string();
        require("name", &self.name)?;
        if let Some(org_id) = &self.org_id {
            require("org_id", org_id)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddOrg {
    type Output = String;

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<String>, CommandError> {
        let org_id = match &self.org_id {
            Some(id) => id.clone(),
            None => env.next_id()?,
        };
        env.check_permission(permissions::ORG_WRITE, &org_id, &org_id)?;
        let org = env
            .filter
            .load(OrgWriteModel::new(env.filter.instance_id(), org_id.as_str()))
            .await?;
        if org.processed_sequence() > 0 {
            return Err(CommandError::already_exists("organization already exists"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &org_id, &org_id)?,
            OrgEvent::Added {
                name: self.name.clone(),
            },
        )
        .guarded(SequenceGuard::new_aggregate());
        Ok(Prepared::new(vec![command], org_id))
    }
}

/// Rename an organization.
#[derive(Debug, Clone, Default)]
pub struct ChangeOrg {
    pub org_id: String,
    pub name: String,
}

impl Validation for ChangeOrg {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.name = self.name.trim().to_string();
        require("name", &self.name)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeOrg {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::ORG_WRITE, org.org_id(), org.org_id())?;
        if org.name == self.name {
            return Err(CommandError::precondition("organization name not changed"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, org.org_id(), org.org_id())?,
            OrgEvent::Changed {
                old_name: org.name.clone(),
                name: self.name.clone(),
            },
        )
        .guarded(org.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Remove an organization, releasing its name and verified domains.
#[derive(Debug, Clone, Default)]
pub struct RemoveOrg {
    pub org_id: String,
}

impl Validation for RemoveOrg {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveOrg {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::ORG_DELETE, org.org_id(), org.org_id())?;
        let command = Command::new(
            aggregate(env, AggregateType::Org, org.org_id(), org.org_id())?,
            OrgEvent::Removed {
                name: org.name.clone(),
                verified_domains: org.verified_domains.clone(),
            },
        )
        .guarded(org.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Load an organization that must exist.
pub(super) async fn load_org(env: &Env<'_>, org_id: &str) -> Result<OrgWriteModel, CommandError> {
    let org = env
        .filter
        .load(OrgWriteModel::new(env.filter.instance_id(), org_id))
        .await?;
    if !org.exists() {
        return Err(CommandError::not_found("organization not found"));
    }
    Ok(org)
}
