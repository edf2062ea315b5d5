//! Request context and pending commands handed to the append gateway.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::event::{Aggregate, EventPayload};
use crate::unique::UniqueConstraint;

/// Creator recorded on events when the context carries no actor.
pub const SYSTEM_ACTOR: &str = "system";

/// Cross-cutting, request-scoped data passed alongside a command.
///
/// Carries the tenant scope, audit trail, correlation, and the cooperative
/// cancellation deadline. It is threaded through every `filter` and `push`
/// call, and its lifecycle is that of one inbound request.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_iam::CommandContext;
///
/// let ctx = CommandContext::new("instance-1")
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(ctx.instance_id, "instance-1");
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert!(!ctx.is_expired());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Tenant (instance) every read and write is scoped to.
    pub instance_id: String,
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Point in time after which storage operations must not start.
    pub deadline: Option<Instant>,
}

impl CommandContext {
    /// Create a context scoped to one instance.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the command (e.g. a user ID or service name).
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the actor set.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Any value convertible to `String` used to correlate this
    ///   command with other operations across aggregates or services.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the correlation ID set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left until the deadline, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The actor to record as event creator.
    pub fn creator(&self) -> &str {
        self.actor.as_deref().unwrap_or(SYSTEM_ACTOR)
    }

    /// Whether the actor acts on itself (self-service).
    pub fn is_self(&self, target_id: &str) -> bool {
        self.actor.as_deref() == Some(target_id)
    }
}

/// Optimistic-concurrency token attached to a [`Command`].
///
/// The push fails with a conflict if, at commit time, the command's
/// aggregate holds any event newer than `expected` whose type is listed in
/// `event_types`. An empty `event_types` list watches every event type, so
/// `SequenceGuard::new_aggregate()` asserts that the aggregate has no events
/// at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGuard {
    /// Highest sequence the deciding write model folded in.
    pub expected: u64,
    /// Event types the deciding write model depends on.
    pub event_types: Vec<String>,
}

impl SequenceGuard {
    /// Guard against the given sequence, restricted to `event_types`.
    pub fn new(expected: u64, event_types: Vec<String>) -> Self {
        Self {
            expected,
            event_types,
        }
    }

    /// Guard asserting the aggregate does not exist yet.
    pub fn new_aggregate() -> Self {
        Self::new(0, Vec::new())
    }

    /// Whether a committed event violates this guard.
    pub fn is_violated_by(&self, event_type: &str, sequence: u64) -> bool {
        sequence > self.expected
            && (self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type))
    }
}

/// An event not yet appended.
///
/// Uniqueness-ledger instructions are not stored on the command; they are
/// derived from the payload (see [`Command::unique_constraints`]) so an
/// event that claims or releases a key can never be pushed without its
/// ledger delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Target aggregate identity.
    pub aggregate: Aggregate,
    /// Typed event payload.
    pub payload: EventPayload,
    /// Actor recorded on the appended event.
    pub creator: String,
    /// Correlation ID recorded on the appended event.
    pub correlation_id: Option<String>,
    /// Time the command was decided at. Gateways record it as the event's
    /// creation time; without it they use their own clock.
    pub created_at: Option<DateTime<Utc>>,
    /// Optional optimistic-concurrency check.
    pub guard: Option<SequenceGuard>,
}

impl Command {
    /// Create an unguarded command with the system creator.
    ///
    /// The orchestrator stamps `creator`, `correlation_id` and `created_at`
    /// from the request context and its clock before pushing.
    pub fn new(aggregate: Aggregate, payload: impl Into<EventPayload>) -> Self {
        Self {
            aggregate,
            payload: payload.into(),
            creator: SYSTEM_ACTOR.to_string(),
            correlation_id: None,
            created_at: None,
            guard: None,
        }
    }

    /// Attach an optimistic-concurrency guard.
    pub fn guarded(mut self, guard: SequenceGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Event type of the payload.
    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    /// Uniqueness-ledger mutations staged with this command, in order.
    pub fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        self.payload.unique_constraints(&self.aggregate)
    }

    pub(crate) fn stamp(&mut self, ctx: &CommandContext, now: DateTime<Utc>) {
        self.creator = ctx.creator().to_string();
        self.correlation_id = ctx.correlation_id.clone();
        self.created_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_no_optional_fields_set() {
        let ctx = CommandContext::new("inst-1");
        assert_eq!(ctx.instance_id, "inst-1");
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.deadline, None);
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::new("inst-1")
            .with_actor(String::from("admin"))
            .with_correlation_id("req-abc")
            .with_timeout(Duration::from_secs(60));

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert!(ctx.deadline.is_some());
        assert!(!ctx.is_expired());
    }

    #[test]
    fn past_deadline_is_expired() {
        let ctx = CommandContext::new("inst-1").with_deadline(Instant::now());
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn creator_falls_back_to_system() {
        assert_eq!(CommandContext::new("i").creator(), SYSTEM_ACTOR);
        assert_eq!(CommandContext::new("i").with_actor("u-1").creator(), "u-1");
    }

    #[test]
    fn self_service_requires_matching_actor() {
        let ctx = CommandContext::new("i").with_actor("u-1");
        assert!(ctx.is_self("u-1"));
        assert!(!ctx.is_self("u-2"));
        assert!(!CommandContext::new("i").is_self("u-1"));
    }

    #[test]
    fn new_aggregate_guard_rejects_any_event() {
        let guard = SequenceGuard::new_aggregate();
        assert!(guard.is_violated_by("user.human.added", 1));
        assert!(guard.is_violated_by("anything", 1));
    }

    #[test]
    fn typed_guard_ignores_unwatched_event_types() {
        let guard = SequenceGuard::new(3, vec!["user.human.email.changed".to_string()]);
        assert!(!guard.is_violated_by("user.metadata.set", 9));
        assert!(!guard.is_violated_by("user.human.email.changed", 3));
        assert!(guard.is_violated_by("user.human.email.changed", 4));
    }
}
