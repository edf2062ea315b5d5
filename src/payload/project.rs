//! Events recorded on `project` aggregates.

use serde::{Deserialize, Serialize};

use super::metadata::{MetadataRemoved, MetadataSet};
use super::require;
use crate::event::Aggregate;
use crate::unique::{self, UniqueConstraint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProjectEvent {
    #[serde(rename = "project.added")]
    Added { name: String },
    #[serde(rename = "project.removed")]
    Removed { name: String },

    #[serde(rename = "project.metadata.set")]
    MetadataSet(MetadataSet),
    #[serde(rename = "project.metadata.removed")]
    MetadataRemoved(MetadataRemoved),
    #[serde(rename = "project.metadata.removed.all")]
    MetadataRemovedAll,
}

impl ProjectEvent {
    pub const ADDED: &'static str = "project.added";
    pub const REMOVED: &'static str = "project.removed";
    pub const METADATA_SET: &'static str = "project.metadata.set";
    pub const METADATA_REMOVED: &'static str = "project.metadata.removed";
    pub const METADATA_REMOVED_ALL: &'static str = "project.metadata.removed.all";

    pub fn event_type(&self) -> &'static str {
        match self {
            ProjectEvent::Added { .. } => Self::ADDED,
            ProjectEvent::Removed { .. } => Self::REMOVED,
            ProjectEvent::MetadataSet(_) => Self::METADATA_SET,
            ProjectEvent::MetadataRemoved(_) => Self::METADATA_REMOVED,
            ProjectEvent::MetadataRemovedAll => Self::METADATA_REMOVED_ALL,
        }
    }

    pub(crate) fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        let org = &aggregate.resource_owner;
        match self {
            ProjectEvent::Added { name } => vec![UniqueConstraint::add(
                unique::PROJECT_NAMES,
                unique::project_name_key(org, name),
                "project name already taken",
            )],
            ProjectEvent::Removed { name } => vec![UniqueConstraint::remove(
                unique::PROJECT_NAMES,
                unique::project_name_key(org, name),
            )],
            _ => Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            ProjectEvent::Added { name } | ProjectEvent::Removed { name } => require("name", name),
            ProjectEvent::MetadataSet(set) => set.validate(),
            ProjectEvent::MetadataRemoved(removed) => removed.validate(),
            ProjectEvent::MetadataRemovedAll => Ok(()),
        }
    }
}
