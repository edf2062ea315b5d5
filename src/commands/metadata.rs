//! Key/value metadata on users, orgs and projects.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::command::{Command, SequenceGuard};
use crate::error::CommandError;
use crate::event::{Aggregate, AggregateType, EventPayload};
use crate::payload::metadata::{MAX_METADATA_KEY_LEN, MetadataRemoved, MetadataSet};
use crate::payload::org::OrgEvent;
use crate::payload::project::ProjectEvent;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::services::permissions;
use crate::write_model::{
    MetadataListWriteModel, OrgMetadataWriteModel, ProjectMetadataWriteModel, TargetMetadata,
    UserMetadataWriteModel,
};

use super::org::load_org;
use super::require;

/// The aggregate whose metadata a command changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataTarget {
    User { user_id: String },
    Org { org_id: String },
    Project { project_id: String },
}

impl MetadataTarget {
    fn set_event(&self, set: MetadataSet) -> EventPayload {
        match self {
            MetadataTarget::User { .. } => UserEvent::MetadataSet(set).into(),
            MetadataTarget::Org { .. } => OrgEvent::MetadataSet(set).into(),
            MetadataTarget::Project { .. } => ProjectEvent::MetadataSet(set).into(),
        }
    }

    fn removed_event(&self, key: String) -> EventPayload {
        let removed = MetadataRemoved { key };
        match self {
            MetadataTarget::User { .. } => UserEvent::MetadataRemoved(removed).into(),
            MetadataTarget::Org { .. } => OrgEvent::MetadataRemoved(removed).into(),
            MetadataTarget::Project { .. } => ProjectEvent::MetadataRemoved(removed).into(),
        }
    }

    fn removed_all_event(&self) -> EventPayload {
        match self {
            MetadataTarget::User { .. } => UserEvent::MetadataRemovedAll.into(),
            MetadataTarget::Org { .. } => OrgEvent::MetadataRemovedAll.into(),
            MetadataTarget::Project { .. } => ProjectEvent::MetadataRemovedAll.into(),
        }
    }

    fn validate(&self) -> Result<(), CommandError> {
        match self {
            MetadataTarget::User { user_id } => require("user_id", user_id),
            MetadataTarget::Org { org_id } => require("org_id", org_id),
            MetadataTarget::Project { project_id } => require("project_id", project_id),
        }
    }
}

/// Metadata of an existing target, ready to build commands on.
struct LoadedTarget {
    aggregate: Aggregate,
    entries: BTreeMap<String, Vec<u8>>,
    guard: SequenceGuard,
}

impl LoadedTarget {
    fn command(&self, payload: EventPayload) -> Command {
        Command::new(self.aggregate.clone(), payload).guarded(self.guard.clone())
    }
}

async fn load_model<M: TargetMetadata>(
    env: &Env<'_>,
    model: M,
    what: &str,
) -> Result<LoadedTarget, CommandError> {
    let model = env.filter.load(model).await?;
    if !model.target_exists() {
        return Err(CommandError::not_found(format!("{what} not found")));
    }
    let base = model.base();
    Ok(LoadedTarget {
        aggregate: Aggregate::new(
            base.instance_id.clone(),
            base.aggregate_type,
            base.aggregate_id.clone(),
            base.resource_owner.clone(),
        )?,
        entries: model.metadata().entries.clone(),
        guard: model.guard(),
    })
}

/// Load the target, then check that the actor may change its metadata.
async fn load_target(env: &Env<'_>, target: &MetadataTarget) -> Result<LoadedTarget, CommandError> {
    let instance_id = env.filter.instance_id();
    let loaded = match target {
        MetadataTarget::User { user_id } => {
            load_model(env, UserMetadataWriteModel::new(instance_id, user_id.as_str(), ""), "user")
                .await?
        }
        MetadataTarget::Org { org_id } => {
            load_model(
                env,
                OrgMetadataWriteModel::new(instance_id, org_id.as_str(), org_id.as_str()),
                "organization",
            )
            .await?
        }
        MetadataTarget::Project { project_id } => {
            load_model(
                env,
                ProjectMetadataWriteModel::new(instance_id, project_id.as_str(), ""),
                "project",
            )
            .await?
        }
    };
    let owner = &loaded.aggregate.resource_owner;
    match target {
        MetadataTarget::User { user_id } => {
            env.check_user_permission(permissions::USER_WRITE, owner, user_id)?
        }
        MetadataTarget::Org { org_id } => {
            env.check_permission(permissions::ORG_WRITE, owner, org_id)?
        }
        MetadataTarget::Project { project_id } => {
            env.check_permission(permissions::PROJECT_WRITE, owner, project_id)?
        }
    }
    Ok(loaded)
}

fn validate_key(key: &str) -> Result<String, CommandError> {
    let key = key.trim();
    require("key", key)?;
    if key.len() > MAX_METADATA_KEY_LEN {
        return Err(CommandError::invalid(format!(
            "key must not exceed {MAX_METADATA_KEY_LEN} bytes"
        )));
    }
    Ok(key.to_string())
}

fn validate_entry(key: &str, value: &[u8]) -> Result<String, CommandError> {
    let key = validate_key(key)?;
    if value.is_empty() {
        return Err(CommandError::invalid("metadata value must not be empty"));
    }
    Ok(key)
}

/// Set one metadata entry.
#[derive(Debug, Clone)]
pub struct SetMetadata {
    pub target: MetadataTarget,
    pub key: String,
    pub value: Vec<u8>,
}

impl Validation for SetMetadata {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        self.target.validate()?;
        self.key = validate_entry(&self.key, &self.value)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for SetMetadata {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let loaded = load_target(env, &self.target).await?;
        if loaded.entries.get(&self.key) == Some(&self.value) {
            return Err(CommandError::precondition("metadata not changed"));
        }
        let command = loaded.command(self.target.set_event(MetadataSet {
            key: self.key.clone(),
            value: self.value.clone(),
        }));
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Set several metadata entries at once. Unchanged entries are skipped;
/// if nothing changes at all the command fails.
#[derive(Debug, Clone)]
pub struct BulkSetMetadata {
    pub target: MetadataTarget,
    pub entries: Vec<(String, Vec<u8>)>,
}

impl Validation for BulkSetMetadata {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        self.target.validate()?;
        if self.entries.is_empty() {
            return Err(CommandError::invalid("no metadata entries given"));
        }
        for (key, value) in &mut self.entries {
            *key = validate_entry(key, value)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for BulkSetMetadata {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let loaded = load_target(env, &self.target).await?;
        // Later duplicates of a key win, as they would if pushed one by one.
        let mut effective = loaded.entries.clone();
        let mut commands = Vec::new();
        for (key, value) in &self.entries {
            if effective.get(key) == Some(value) {
                continue;
            }
            effective.insert(key.clone(), value.clone());
            commands.push(loaded.command(self.target.set_event(MetadataSet {
                key: key.clone(),
                value: value.clone(),
            })));
        }
        if commands.is_empty() {
            return Err(CommandError::precondition("metadata not changed"));
        }
        Ok(Prepared::new(commands, ()))
    }
}

#[derive(Debug, Clone)]
pub struct RemoveMetadata {
    pub target: MetadataTarget,
    pub key: String,
}

impl Validation for RemoveMetadata {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        self.target.validate()?;
        self.key = validate_key(&self.key)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveMetadata {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let loaded = load_target(env, &self.target).await?;
        if !loaded.entries.contains_key(&self.key) {
            return Err(CommandError::not_found("metadata key not found"));
        }
        let command = loaded.command(self.target.removed_event(self.key.clone()));
        Ok(Prepared::new(vec![command], ()))
    }
}

#[derive(Debug, Clone)]
pub struct RemoveAllMetadata {
    pub target: MetadataTarget,
}

impl Validation for RemoveAllMetadata {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        self.target.validate()?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveAllMetadata {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let loaded = load_target(env, &self.target).await?;
        if loaded.entries.is_empty() {
            return Err(CommandError::not_found("no metadata set"));
        }
        let command = loaded.command(self.target.removed_all_event());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Remove one metadata key from every user of an organization. Outputs the
/// number of users changed.
#[derive(Debug, Clone, Default)]
pub struct RemoveUserMetadataKeyInOrg {
    pub org_id: String,
    pub key: String,
}

impl Validation for RemoveUserMetadataKeyInOrg {
    type Output = usize;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.key = validate_key(&self.key)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveUserMetadataKeyInOrg {
    type Output = usize;

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<usize>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::USER_WRITE, org.org_id(), org.org_id())?;
        let list = env
            .filter
            .load(MetadataListWriteModel::users_of_org(
                env.filter.instance_id(),
                org.org_id(),
            ))
            .await?;
        let holders = list.holders_of(&self.key);
        if holders.is_empty() {
            return Err(CommandError::not_found("no user holds the metadata key"));
        }
        let mut commands = Vec::with_capacity(holders.len());
        for user_id in holders {
            let user = Aggregate::new(
                env.ctx.instance_id.clone(),
                AggregateType::User,
                user_id,
                org.org_id(),
            )?;
            commands.push(
                Command::new(
                    user,
                    UserEvent::MetadataRemoved(MetadataRemoved {
                        key: self.key.clone(),
                    }),
                )
                .guarded(list.guard_for(user_id)),
            );
        }
        let changed = commands.len();
        Ok(Prepared::new(commands, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::Harness;

    fn user(user_id: &str) -> MetadataTarget {
        MetadataTarget::User {
            user_id: user_id.into(),
        }
    }

    fn set(target: MetadataTarget, key: &str, value: &str) -> SetMetadata {
        SetMetadata {
            target,
            key: key.into(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn keys_are_bounded() {
        assert!(validate_key(&"k".repeat(MAX_METADATA_KEY_LEN)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_METADATA_KEY_LEN + 1)).is_err());
        assert!(set(user("u"), "k", "").validate().is_err());
    }

    #[tokio::test]
    async fn set_detects_noop_and_remove_requires_key() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;

        h.commands
            .execute(&h.ctx, set(user(&user_id), "team", "core"))
            .await
            .expect("set should succeed");
        assert!(matches!(
            h.commands.execute(&h.ctx, set(user(&user_id), "team", "core")).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        let remove = |key: &str| RemoveMetadata {
            target: user(&user_id),
            key: key.into(),
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, remove("missing")).await,
            Err(CommandError::NotFound(_))
        ));
        h.commands
            .execute(&h.ctx, remove("team"))
            .await
            .expect("remove should succeed");
        assert!(matches!(
            h.commands
                .execute(&h.ctx, RemoveAllMetadata { target: user(&user_id) })
                .await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bulk_set_skips_unchanged_entries() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let target = MetadataTarget::Org { org_id: org.clone() };
        h.commands
            .execute(&h.ctx, set(target.clone(), "a", "1"))
            .await
            .expect("set should succeed");

        let before = h.store.len().await;
        h.commands
            .execute(
                &h.ctx,
                BulkSetMetadata {
                    target: target.clone(),
                    entries: vec![
                        ("a".into(), b"1".to_vec()),
                        ("b".into(), b"2".to_vec()),
                        ("c".into(), b"3".to_vec()),
                    ],
                },
            )
            .await
            .expect("bulk set should succeed");
        assert_eq!(h.store.len().await, before + 2);

        let unchanged = BulkSetMetadata {
            target: target.clone(),
            entries: vec![("b".into(), b"2".to_vec())],
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, unchanged).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        h.commands
            .execute(&h.ctx, RemoveAllMetadata { target })
            .await
            .expect("remove all should succeed");
    }

    #[tokio::test]
    async fn missing_targets_are_not_found() {
        let h = Harness::new();
        let project = MetadataTarget::Project {
            project_id: "nope".into(),
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, set(project, "k", "v")).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn removing_key_across_org_touches_only_holders() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let ada = h.add_user(&org, "ada").await;
        let bob = h.add_user(&org, "bob").await;
        let eve = h.add_user(&org, "eve").await;
        for id in [&ada, &bob] {
            h.commands
                .execute(&h.ctx, set(user(id), "team", "core"))
                .await
                .expect("set should succeed");
        }
        h.commands
            .execute(&h.ctx, set(user(&eve), "other", "x"))
            .await
            .expect("set should succeed");

        let cmd = RemoveUserMetadataKeyInOrg {
            org_id: org.clone(),
            key: "team".into(),
        };
        let outcome = h
            .commands
            .execute(&h.ctx, cmd.clone())
            .await
            .expect("remove should succeed");
        assert_eq!(outcome.output, 2);
        assert_eq!(
            h.event_types_of(AggregateType::User, &eve).await.last().map(String::as_str),
            Some(UserEvent::METADATA_SET)
        );
        assert!(matches!(
            h.commands.execute(&h.ctx, cmd).await,
            Err(CommandError::NotFound(_))
        ));
    }
}
