//! In-process reference implementation of [`EventStore`].
//!
//! Events are kept in their stored form, `(event_type, data)` JSON pairs,
//! and decoded on the way out of `filter`, exactly like a durable backend
//! would. The log, the per-aggregate heads, and the uniqueness ledger sit
//! behind one `RwLock`: `filter` takes the read lock, `push` the write lock,
//! and a push validates the whole batch before mutating anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{EventStore, SearchQuery};
use crate::command::{Command, CommandContext};
use crate::error::GatewayError;
use crate::event::{Aggregate, AggregateKey, Event, EventPayload};
use crate::services::{Clock, SystemClock};
use crate::unique::UniqueAction;

/// `(instance, namespace, key)`: ledger entries never cross tenants.
type LedgerKey = (String, &'static str, String);

struct StoredRecord {
    aggregate: Aggregate,
    event_type: String,
    data: Value,
    sequence: u64,
    position: u64,
    created_at: DateTime<Utc>,
    creator: String,
    correlation_id: Option<String>,
}

impl StoredRecord {
    fn decode(&self) -> Event {
        Event {
            aggregate: self.aggregate.clone(),
            payload: EventPayload::decode(
                self.aggregate.aggregate_type,
                &self.event_type,
                self.data.clone(),
            ),
            sequence: self.sequence,
            position: self.position,
            created_at: self.created_at,
            creator: self.creator.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[derive(Default)]
struct AggregateHead {
    sequence: u64,
    /// Latest sequence per event type, for typed guards.
    latest_by_type: HashMap<String, u64>,
}

impl AggregateHead {
    fn latest_of(&self, event_types: &[String]) -> u64 {
        if event_types.is_empty() {
            return self.sequence;
        }
        event_types
            .iter()
            .filter_map(|t| self.latest_by_type.get(t))
            .copied()
            .max()
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct LogState {
    records: Vec<StoredRecord>,
    heads: HashMap<AggregateKey, AggregateHead>,
    ledger: HashSet<LedgerKey>,
}

/// A command that passed structural validation, with its encoded payload.
struct Encoded {
    command: Command,
    event_type: String,
    data: Value,
}

/// In-memory event log with an atomic uniqueness ledger.
///
/// # Examples
///
/// ```
/// use eventfold_iam::{CommandContext, EventStore, InMemoryEventStore, SearchQuery};
///
/// # tokio_test_block(async {
/// let store = InMemoryEventStore::new();
/// let ctx = CommandContext::new("inst-1");
/// let events = store
///     .filter(&ctx, &SearchQuery::new("inst-1"))
///     .await
///     .expect("filter should succeed");
/// assert!(events.is_empty());
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct InMemoryEventStore {
    state: RwLock<LogState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Create an empty store stamping events with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping events with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            clock,
        }
    }

    /// Number of committed events across all tenants.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Whether nothing was committed yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the ledger currently holds `(namespace, key)` for `instance_id`.
    pub async fn has_unique(&self, instance_id: &str, namespace: &str, key: &str) -> bool {
        self.state
            .read()
            .await
            .ledger
            .iter()
            .any(|(i, n, k)| i == instance_id && *n == namespace && k == key)
    }

    fn encode(command: Command) -> Result<Encoded, GatewayError> {
        command
            .aggregate
            .check()
            .map_err(GatewayError::InvalidPayload)?;
        command
            .payload
            .validate()
            .map_err(GatewayError::InvalidPayload)?;
        if command.payload.aggregate_type() != Some(command.aggregate.aggregate_type) {
            return Err(GatewayError::InvalidPayload(format!(
                "event {} cannot be appended to a {} aggregate",
                command.event_type(),
                command.aggregate.aggregate_type
            )));
        }
        let (event_type, data) = command
            .payload
            .encode()
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        Ok(Encoded {
            command,
            event_type,
            data,
        })
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn filter(
        &self,
        ctx: &CommandContext,
        query: &SearchQuery,
    ) -> Result<Vec<Event>, GatewayError> {
        if ctx.is_expired() {
            return Err(GatewayError::Cancelled);
        }
        let state = self.state.read().await;
        let events: Vec<Event> = state
            .records
            .iter()
            .filter(|r| query.matches(&r.aggregate, &r.event_type, r.sequence))
            .map(StoredRecord::decode)
            .collect();
        tracing::debug!(
            instance_id = %query.instance_id,
            count = events.len(),
            "filtered events"
        );
        Ok(events)
    }

    async fn push(
        &self,
        ctx: &CommandContext,
        commands: Vec<Command>,
    ) -> Result<Vec<Event>, GatewayError> {
        if ctx.is_expired() {
            return Err(GatewayError::Cancelled);
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = commands
            .into_iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.write().await;
        // The deadline may have passed while waiting for the lock.
        if ctx.is_expired() {
            return Err(GatewayError::Cancelled);
        }

        // Guards are checked against committed state only; earlier commands
        // of the same batch never conflict with later ones.
        for item in &encoded {
            let Some(guard) = &item.command.guard else {
                continue;
            };
            let key = item.command.aggregate.key();
            let actual = state
                .heads
                .get(&key)
                .map(|head| head.latest_of(&guard.event_types))
                .unwrap_or(0);
            if actual > guard.expected {
                tracing::warn!(
                    aggregate = %key,
                    expected = guard.expected,
                    actual,
                    "sequence guard violated"
                );
                return Err(GatewayError::Conflict {
                    aggregate: key.to_string(),
                    expected: guard.expected,
                    actual,
                });
            }
        }

        // Stage ledger mutations in batch order on top of the committed set.
        let mut added: HashSet<LedgerKey> = HashSet::new();
        let mut removed: HashSet<LedgerKey> = HashSet::new();
        for item in &encoded {
            let instance_id = &item.command.aggregate.instance_id;
            for constraint in item.command.unique_constraints() {
                let key: LedgerKey = (instance_id.clone(), constraint.namespace, constraint.key);
                match constraint.action {
                    UniqueAction::Add => {
                        let taken = added.contains(&key)
                            || (state.ledger.contains(&key) && !removed.contains(&key));
                        if taken {
                            tracing::debug!(
                                namespace = key.1,
                                key = %key.2,
                                "unique constraint violated"
                            );
                            return Err(GatewayError::UniqueViolation {
                                namespace: key.1.to_string(),
                                key: key.2,
                                message: constraint.error_message.to_string(),
                            });
                        }
                        removed.remove(&key);
                        added.insert(key);
                    }
                    UniqueAction::Remove => {
                        if !added.remove(&key) {
                            removed.insert(key);
                        }
                    }
                }
            }
        }

        // Everything checked: commit.
        let now = self.clock.now();
        let mut next_sequence: HashMap<AggregateKey, u64> = HashMap::new();
        let mut events = Vec::with_capacity(encoded.len());
        for item in encoded {
            let key = item.command.aggregate.key();
            let sequence = next_sequence
                .entry(key.clone())
                .or_insert_with(|| state.heads.get(&key).map_or(0, |h| h.sequence));
            *sequence += 1;

            let record = StoredRecord {
                aggregate: item.command.aggregate,
                event_type: item.event_type,
                data: item.data,
                sequence: *sequence,
                position: state.records.len() as u64 + 1,
                created_at: item.command.created_at.unwrap_or(now),
                creator: item.command.creator,
                correlation_id: item.command.correlation_id,
            };
            let head = state.heads.entry(key).or_default();
            head.sequence = record.sequence;
            head.latest_by_type
                .insert(record.event_type.clone(), record.sequence);

            events.push(record.decode());
            state.records.push(record);
        }
        for key in removed {
            state.ledger.remove(&key);
        }
        state.ledger.extend(added);

        tracing::debug!(count = events.len(), "events appended");
        Ok(events)
    }
}
