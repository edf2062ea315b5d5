//! The append gateway: the single entry and exit point to the event log.
//!
//! [`EventStore::filter`] replays events matching a [`SearchQuery`];
//! [`EventStore::push`] atomically appends a batch of commands together with
//! the uniqueness-ledger mutations their payloads imply, or fails the whole
//! batch.

mod memory;

pub use memory::InMemoryEventStore;

use async_trait::async_trait;

use crate::command::{Command, CommandContext};
use crate::error::GatewayError;
use crate::event::{Aggregate, AggregateType, Event};

/// Backing store contract.
///
/// Implementations own the per-aggregate sequence counters and the
/// uniqueness ledger; nothing else mutates them.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Return all events matching `query`.
    ///
    /// Events are ordered by commit position, which orders them by sequence
    /// within each aggregate. An aggregate that never existed yields an
    /// empty result, not an error.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Cancelled`] if the context deadline has passed.
    /// - [`GatewayError::Storage`] if the backing store fails.
    async fn filter(
        &self,
        ctx: &CommandContext,
        query: &SearchQuery,
    ) -> Result<Vec<Event>, GatewayError>;

    /// Append `commands` atomically and return the committed events in
    /// batch order.
    ///
    /// # Errors
    ///
    /// The batch is rejected as a whole, leaving no partial state, on:
    /// - [`GatewayError::InvalidPayload`] if any command fails structural validation;
    /// - [`GatewayError::Conflict`] if any command's sequence guard is violated;
    /// - [`GatewayError::UniqueViolation`] if any staged add hits an existing key;
    /// - [`GatewayError::Cancelled`] if the context deadline has passed.
    async fn push(
        &self,
        ctx: &CommandContext,
        commands: Vec<Command>,
    ) -> Result<Vec<Event>, GatewayError>;
}

/// One disjunct of a [`SearchQuery`].
///
/// Empty lists match anything along that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryClause {
    pub aggregate_types: Vec<AggregateType>,
    pub aggregate_ids: Vec<String>,
    pub event_types: Vec<String>,
}

impl QueryClause {
    /// Match aggregates of one type.
    pub fn new(aggregate_type: AggregateType) -> Self {
        Self {
            aggregate_types: vec![aggregate_type],
            ..Self::default()
        }
    }

    /// Restrict to one aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.aggregate_ids.push(id.into());
        self
    }

    /// Restrict to the given event types.
    pub fn event_types(mut self, types: &[&str]) -> Self {
        self.event_types.extend(types.iter().map(|t| (*t).to_string()));
        self
    }

    fn matches(&self, aggregate: &Aggregate, event_type: &str) -> bool {
        let type_matches = self.aggregate_types.is_empty()
            || self.aggregate_types.contains(&aggregate.aggregate_type);
        let id_matches = self.aggregate_ids.is_empty()
            || self.aggregate_ids.iter().any(|id| *id == aggregate.id);
        let event_matches =
            self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type);
        type_matches && id_matches && event_matches
    }
}

/// Declarative description of the events that make up a write model.
///
/// An event matches when it lives in `instance_id`, carries
/// `resource_owner` (if set), is newer than `sequence_after` (if set), and
/// matches at least one clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub instance_id: String,
    pub resource_owner: Option<String>,
    pub clauses: Vec<QueryClause>,
    pub sequence_after: Option<u64>,
}

impl SearchQuery {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Only events whose resource owner is `owner`.
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    /// Only events with a sequence above `sequence`.
    pub fn sequence_after(mut self, sequence: u64) -> Self {
        self.sequence_after = Some(sequence);
        self
    }

    /// Add a clause.
    pub fn clause(mut self, clause: QueryClause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Whether an event with this identity, type and sequence matches.
    pub fn matches(&self, aggregate: &Aggregate, event_type: &str, sequence: u64) -> bool {
        aggregate.instance_id == self.instance_id
            && self
                .resource_owner
                .as_ref()
                .is_none_or(|owner| *owner == aggregate.resource_owner)
            && self.sequence_after.is_none_or(|after| sequence > after)
            && self.clauses.iter().any(|c| c.matches(aggregate, event_type))
    }

    /// Event types this query watches on aggregates of `aggregate_type`.
    ///
    /// An empty result means every type is watched.
    pub fn event_types_for(&self, aggregate_type: AggregateType) -> Vec<String> {
        let mut types = Vec::new();
        for clause in &self.clauses {
            if !clause.aggregate_types.is_empty()
                && !clause.aggregate_types.contains(&aggregate_type)
            {
                continue;
            }
            if clause.event_types.is_empty() {
                return Vec::new();
            }
            for t in &clause.event_types {
                if !types.contains(t) {
                    types.push(t.clone());
                }
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, owner: &str) -> Aggregate {
        Aggregate::new("inst-1", AggregateType::User, id, owner).expect("aggregate")
    }

    #[test]
    fn query_matches_on_all_dimensions() {
        let query = SearchQuery::new("inst-1")
            .resource_owner("org-1")
            .clause(
                QueryClause::new(AggregateType::User)
                    .aggregate_id("u-1")
                    .event_types(&["user.locked"]),
            );

        assert!(query.matches(&user("u-1", "org-1"), "user.locked", 1));
        assert!(!query.matches(&user("u-2", "org-1"), "user.locked", 1));
        assert!(!query.matches(&user("u-1", "org-2"), "user.locked", 1));
        assert!(!query.matches(&user("u-1", "org-1"), "user.unlocked", 1));

        let other_instance = Aggregate::new("inst-2", AggregateType::User, "u-1", "org-1")
            .expect("aggregate");
        assert!(!query.matches(&other_instance, "user.locked", 1));
    }

    #[test]
    fn query_without_clauses_matches_nothing() {
        let query = SearchQuery::new("inst-1");
        assert!(!query.matches(&user("u-1", "org-1"), "user.locked", 1));
    }

    #[test]
    fn sequence_after_is_exclusive() {
        let query = SearchQuery::new("inst-1")
            .sequence_after(2)
            .clause(QueryClause::new(AggregateType::User));
        assert!(!query.matches(&user("u-1", "o"), "x", 2));
        assert!(query.matches(&user("u-1", "o"), "x", 3));
    }

    #[test]
    fn event_types_for_merges_matching_clauses() {
        let query = SearchQuery::new("inst-1")
            .clause(QueryClause::new(AggregateType::Org).event_types(&["a", "b"]))
            .clause(QueryClause::new(AggregateType::User).event_types(&["c"]))
            .clause(QueryClause::new(AggregateType::Org).event_types(&["b", "d"]));
        assert_eq!(query.event_types_for(AggregateType::Org), vec!["a", "b", "d"]);
        assert_eq!(query.event_types_for(AggregateType::User), vec!["c"]);
    }

    #[test]
    fn untyped_clause_watches_everything() {
        let query = SearchQuery::new("inst-1")
            .clause(QueryClause::new(AggregateType::Org).event_types(&["a"]))
            .clause(QueryClause::new(AggregateType::Org));
        assert!(query.event_types_for(AggregateType::Org).is_empty());
    }
}
