//! Projects.

use async_trait::async_trait;

use crate::command::{Command, SequenceGuard};
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::project::ProjectEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{OrgWriteModel, ProjectWriteModel, WriteModel};

use super::{aggregate, require};

/// Create a project in an organization. Outputs the project ID.
#[derive(Debug, Clone, Default)]
pub struct AddProject {
    pub org_id: String,
    /// Generated if absent.
    pub project_id: Option<String>,
    pub name: String,
}

impl Validation for AddProject {
    type Output = String;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.name = self.name.trim().to_string();
        require("name", &self.name)?;
        if let Some(project_id) = &self.project_id {
            require("project_id", project_id)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddProject {
    type Output = String;

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<String>, CommandError> {
        let org = env
            .filter
            .load(OrgWriteModel::new(env.filter.instance_id(), self.org_id.as_str()))
            .await?;
        if !org.exists() {
            return Err(CommandError::precondition("organization not found"));
        }
        let project_id = match &self.project_id {
            Some(id) => id.clone(),
            None => env.next_id()?,
        };
        env.check_permission(permissions::PROJECT_WRITE, org.org_id(), &project_id)?;
        let existing = env
            .filter
            .load(ProjectWriteModel::new(env.filter.instance_id(), project_id.as_str(), ""))
            .await?;
        if existing.processed_sequence() > 0 {
            return Err(CommandError::already_exists("project already exists"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Project, &project_id, org.org_id())?,
            ProjectEvent::Added {
                name: self.name.clone(),
            },
        )
        .guarded(SequenceGuard::new_aggregate());
        Ok(Prepared::new(vec![command], project_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoveProject {
    pub project_id: String,
}

impl Validation for RemoveProject {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("project_id", &self.project_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveProject {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let project = env
            .filter
            .load(ProjectWriteModel::new(
                env.filter.instance_id(),
                self.project_id.as_str(),
                "",
            ))
            .await?;
        if !project.exists() {
            return Err(CommandError::not_found("project not found"));
        }
        env.check_permission(
            permissions::PROJECT_DELETE,
            project.resource_owner(),
            &self.project_id,
        )?;
        let command = Command::new(
            aggregate(
                env,
                AggregateType::Project,
                &self.project_id,
                project.resource_owner(),
            )?,
            ProjectEvent::Removed {
                name: project.name.clone(),
            },
        )
        .guarded(project.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::Harness;
    use crate::unique;

    fn add(org_id: &str, name: &str) -> AddProject {
        AddProject {
            org_id: org_id.into(),
            name: name.into(),
            ..AddProject::default()
        }
    }

    #[tokio::test]
    async fn project_names_are_unique_per_org() {
        let h = Harness::new();
        let acme = h.add_org("Acme").await;
        let other = h.add_org("Other").await;
        let project_id = h
            .commands
            .execute(&h.ctx, add(&acme, "Portal"))
            .await
            .expect("add project should succeed")
            .output;
        assert!(matches!(
            h.commands.execute(&h.ctx, add(&acme, "Portal")).await,
            Err(CommandError::AlreadyExists(_))
        ));
        h.commands
            .execute(&h.ctx, add(&other, "Portal"))
            .await
            .expect("same name in another org should succeed");

        h.commands
            .execute(
                &h.ctx,
                RemoveProject {
                    project_id: project_id.clone(),
                },
            )
            .await
            .expect("remove should succeed");
        assert!(
            !h.store
                .has_unique("inst-1", unique::PROJECT_NAMES, &format!("{acme}:Portal"))
                .await
        );
        assert!(matches!(
            h.commands.execute(&h.ctx, RemoveProject { project_id }).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn project_needs_existing_org() {
        let h = Harness::new();
        assert!(matches!(
            h.commands.execute(&h.ctx, add("missing", "Portal")).await,
            Err(CommandError::PreconditionFailed(_))
        ));
    }
}
