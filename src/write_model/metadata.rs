//! Metadata write models for users, orgs and projects.
//!
//! Metadata events live on the aggregate they describe. The target models
//! also read that aggregate's lifecycle events, so they know whether the
//! target still exists.

use std::collections::{BTreeMap, HashMap};

use crate::command::SequenceGuard;
use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::{QueryClause, SearchQuery};
use crate::payload::metadata::MetadataChange;
use crate::payload::org::OrgEvent;
use crate::payload::project::ProjectEvent;
use crate::payload::user::UserEvent;

use super::{ModelBase, WriteModel};

/// Metadata event types recorded on aggregates of `aggregate_type`.
pub(crate) fn metadata_event_types(aggregate_type: AggregateType) -> &'static [&'static str] {
    match aggregate_type {
        AggregateType::User => &[
            UserEvent::METADATA_SET,
            UserEvent::METADATA_REMOVED,
            UserEvent::METADATA_REMOVED_ALL,
        ],
        AggregateType::Org => &[
            OrgEvent::METADATA_SET,
            OrgEvent::METADATA_REMOVED,
            OrgEvent::METADATA_REMOVED_ALL,
        ],
        AggregateType::Project => &[
            ProjectEvent::METADATA_SET,
            ProjectEvent::METADATA_REMOVED,
            ProjectEvent::METADATA_REMOVED_ALL,
        ],
        AggregateType::Instance => &[],
    }
}

fn fold(entries: &mut BTreeMap<String, Vec<u8>>, change: MetadataChange<'_>) {
    match change {
        MetadataChange::Set { key, value } => {
            entries.insert(key.to_string(), value.to_vec());
        }
        MetadataChange::Removed { key } => {
            entries.remove(key);
        }
        MetadataChange::RemovedAll => entries.clear(),
    }
}

/// Key-value metadata of a single aggregate, independent of its type.
#[derive(Debug, Clone)]
pub struct MetadataWriteModel {
    base: ModelBase,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl MetadataWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            base: ModelBase::new(instance_id, aggregate_type, aggregate_id, resource_owner),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    fn clause(&self) -> QueryClause {
        QueryClause::new(self.base.aggregate_type)
            .aggregate_id(self.base.aggregate_id.clone())
            .event_types(metadata_event_types(self.base.aggregate_type))
    }
}

impl WriteModel for MetadataWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(self.clause())
    }

    fn apply(&mut self, event: &Event) {
        if let Some(change) = event.payload.metadata_change() {
            fold(&mut self.entries, change);
        }
    }
}

/// Metadata of an aggregate together with whether that aggregate exists.
pub trait TargetMetadata: WriteModel {
    fn metadata(&self) -> &MetadataWriteModel;

    fn target_exists(&self) -> bool;
}

macro_rules! target_metadata_model {
    (
        $(#[$doc:meta])*
        $name:ident, $aggregate_type:expr, added: $added:pat, removed: $removed:pat,
        lifecycle: [$($lifecycle:expr),+ $(,)?] $(,)?
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            metadata: MetadataWriteModel,
            exists: bool,
        }

        impl $name {
            pub fn new(
                instance_id: impl Into<String>,
                aggregate_id: impl Into<String>,
                resource_owner: impl Into<String>,
            ) -> Self {
                Self {
                    metadata: MetadataWriteModel::new(
                        instance_id,
                        $aggregate_type,
                        aggregate_id,
                        resource_owner,
                    ),
                    exists: false,
                }
            }
        }

        impl WriteModel for $name {
            fn base(&self) -> &ModelBase {
                &self.metadata.base
            }

            fn base_mut(&mut self) -> &mut ModelBase {
                &mut self.metadata.base
            }

            fn query(&self) -> SearchQuery {
                self.metadata
                    .base
                    .search_query()
                    .clause(self.metadata.clause().event_types(&[$($lifecycle),+]))
            }

            fn apply(&mut self, event: &Event) {
                match &event.payload {
                    $added => self.exists = true,
                    $removed => {
                        self.exists = false;
                        self.metadata.entries.clear();
                    }
                    _ => self.metadata.apply(event),
                }
            }
        }

        impl TargetMetadata for $name {
            fn metadata(&self) -> &MetadataWriteModel {
                &self.metadata
            }

            fn target_exists(&self) -> bool {
                self.exists
            }
        }
    };
}

target_metadata_model!(
    /// Metadata of a user.
    UserMetadataWriteModel,
    AggregateType::User,
    added: EventPayload::User(UserEvent::HumanAdded { .. }),
    removed: EventPayload::User(UserEvent::Removed { .. }),
    lifecycle: [UserEvent::HUMAN_ADDED, UserEvent::REMOVED],
);

target_metadata_model!(
    /// Metadata of an organization.
    OrgMetadataWriteModel,
    AggregateType::Org,
    added: EventPayload::Org(OrgEvent::Added { .. }),
    removed: EventPayload::Org(OrgEvent::Removed { .. }),
    lifecycle: [OrgEvent::ADDED, OrgEvent::REMOVED],
);

target_metadata_model!(
    /// Metadata of a project.
    ProjectMetadataWriteModel,
    AggregateType::Project,
    added: EventPayload::Project(ProjectEvent::Added { .. }),
    removed: EventPayload::Project(ProjectEvent::Removed { .. }),
    lifecycle: [ProjectEvent::ADDED, ProjectEvent::REMOVED],
);

/// Metadata of every user owned by one organization.
///
/// Spans many aggregates, so guards are per user via
/// [`guard_for`](MetadataListWriteModel::guard_for).
#[derive(Debug, Clone)]
pub struct MetadataListWriteModel {
    base: ModelBase,
    pub entries: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MetadataListWriteModel {
    pub fn users_of_org(instance_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        let org_id = org_id.into();
        Self {
            base: ModelBase::new(instance_id, AggregateType::User, "", org_id),
            entries: HashMap::new(),
        }
    }

    /// IDs of the aggregates holding `key`, sorted.
    pub fn holders_of(&self, key: &str) -> Vec<&str> {
        let mut holders: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, entries)| entries.contains_key(key))
            .map(|(id, _)| id.as_str())
            .collect();
        holders.sort_unstable();
        holders
    }

    pub fn guard_for(&self, aggregate_id: &str) -> SequenceGuard {
        SequenceGuard::new(
            self.base.sequence_of(self.base.aggregate_type, aggregate_id),
            self.query().event_types_for(self.base.aggregate_type),
        )
    }
}

impl WriteModel for MetadataListWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(self.base.aggregate_type)
                .event_types(metadata_event_types(self.base.aggregate_type))
                .event_types(&[UserEvent::REMOVED]),
        )
    }

    fn apply(&mut self, event: &Event) {
        let id = &event.aggregate.id;
        match event.payload.metadata_change() {
            Some(MetadataChange::RemovedAll) => {
                self.entries.remove(id);
            }
            Some(change) => {
                let entries = self.entries.entry(id.clone()).or_default();
                fold(entries, change);
                if entries.is_empty() {
                    self.entries.remove(id);
                }
            }
            None => {
                if let EventPayload::User(UserEvent::Removed { .. }) = &event.payload {
                    self.entries.remove(id);
                }
            }
        }
    }
}
