//! Write models: request-local projections of committed events used by
//! stage 2 of the preparation pipeline to decide what to emit.
//!
//! A write model is constructed with its identity only, describes the
//! events it needs via [`WriteModel::query`], buffers them through
//! [`WriteModel::append_events`], and folds them with
//! [`WriteModel::reduce`]. Models are cheap to rebuild and never shared
//! across requests.

mod instance;
mod metadata;
mod org;
mod project;
mod user;

pub use instance::SecretGeneratorWriteModel;
pub use metadata::{
    MetadataListWriteModel, MetadataWriteModel, OrgMetadataWriteModel, ProjectMetadataWriteModel,
    TargetMetadata, UserMetadataWriteModel,
};
pub use org::{
    IdpDependencyWriteModel, LoginPolicyWriteModel, OrgDomainWriteModel, OrgIdpConfigWriteModel,
    OrgIdpLinksWriteModel, OrgState, OrgWriteModel,
};
pub use project::ProjectWriteModel;
pub use user::{ContactState, HumanWriteModel, UserState};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::command::SequenceGuard;
use crate::error::CommandError;
use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::SearchQuery;

/// Identity and sequence bookkeeping shared by every write model.
#[derive(Debug, Clone)]
pub struct ModelBase {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    /// Resource owner as carried by the latest folded event of the model's
    /// own aggregate; the constructor value until then.
    pub resource_owner: String,
    /// Highest sequence of the model's own aggregate folded in so far.
    pub processed_sequence: u64,
    /// Creation time of the latest folded event.
    pub change_date: Option<DateTime<Utc>>,
    /// Highest folded sequence per originating aggregate.
    sequences: HashMap<(AggregateType, String), u64>,
    buffer: Vec<Event>,
}

impl ModelBase {
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            resource_owner: resource_owner.into(),
            processed_sequence: 0,
            change_date: None,
            sequences: HashMap::new(),
            buffer: Vec::new(),
        }
    }

    /// Highest folded sequence of another aggregate, for cross-aggregate
    /// models.
    pub fn sequence_of(&self, aggregate_type: AggregateType, aggregate_id: &str) -> u64 {
        self.sequences
            .get(&(aggregate_type, aggregate_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Base query scoped to this model's instance and, if known, its
    /// resource owner.
    pub fn search_query(&self) -> SearchQuery {
        let query = SearchQuery::new(self.instance_id.clone());
        if self.resource_owner.is_empty() {
            query
        } else {
            query.resource_owner(self.resource_owner.clone())
        }
    }

    /// Buffer events that were not folded or buffered before.
    ///
    /// Sequences only grow per aggregate, so anything at or below the
    /// latest seen sequence of its aggregate is a replay and is dropped.
    pub fn buffer(&mut self, events: &[Event]) {
        for event in events {
            let key = (event.aggregate.aggregate_type, event.aggregate.id.clone());
            let folded = self.sequences.get(&key).copied().unwrap_or(0);
            let buffered = self
                .buffer
                .iter()
                .rev()
                .find(|e| e.aggregate.aggregate_type == key.0 && e.aggregate.id == key.1)
                .map_or(0, |e| e.sequence);
            if event.sequence <= folded.max(buffered) {
                continue;
            }
            self.buffer.push(event.clone());
        }
    }

    /// Drain the buffer in event order.
    pub fn take_buffer(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.buffer)
    }

    /// Record that `event` has been folded.
    pub fn advance(&mut self, event: &Event) {
        let key = (event.aggregate.aggregate_type, event.aggregate.id.clone());
        self.sequences.insert(key, event.sequence);
        if event.aggregate.aggregate_type == self.aggregate_type
            && event.aggregate.id == self.aggregate_id
        {
            self.processed_sequence = event.sequence;
            self.resource_owner = event.aggregate.resource_owner.clone();
        }
        self.change_date = Some(event.created_at);
    }
}

/// A projection of events into the state a command decides on.
///
/// Implementors provide identity access, the query, and the per-event fold;
/// buffering, replay protection, unknown-event skipping, and sequence
/// bookkeeping come from the default methods.
pub trait WriteModel: Send {
    fn base(&self) -> &ModelBase;

    fn base_mut(&mut self) -> &mut ModelBase;

    /// The events that make up this model. Pure; derived from identity.
    fn query(&self) -> SearchQuery;

    /// Fold one typed event into the model's fields.
    ///
    /// Never called for [`EventPayload::Unknown`].
    fn apply(&mut self, event: &Event);

    /// Buffer events for the next [`reduce`](WriteModel::reduce).
    fn append_events(&mut self, events: &[Event]) {
        self.base_mut().buffer(events);
    }

    /// Fold all buffered events in order, then clear the buffer.
    fn reduce(&mut self) -> Result<(), CommandError> {
        for event in self.base_mut().take_buffer() {
            if let EventPayload::Unknown { event_type, .. } = &event.payload {
                tracing::debug!(event_type = %event_type, "skipping unknown event");
            } else {
                self.apply(&event);
            }
            self.base_mut().advance(&event);
        }
        Ok(())
    }

    /// Highest own-aggregate sequence folded in.
    fn processed_sequence(&self) -> u64 {
        self.base().processed_sequence
    }

    /// Optimistic-concurrency guard for commands decided on this model.
    fn guard(&self) -> SequenceGuard {
        let base = self.base();
        SequenceGuard::new(
            base.processed_sequence,
            self.query().event_types_for(base.aggregate_type),
        )
    }
}
