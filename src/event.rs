//! Aggregate identity, stored events, and the closed payload union.
//!
//! Events are persisted as `(event_type, data)` pairs and decoded exactly
//! once, at the append gateway boundary, into [`EventPayload`]. Reducers
//! then match exhaustively on typed variants and skip
//! [`EventPayload::Unknown`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;
use crate::payload::instance::InstanceEvent;
use crate::payload::metadata::MetadataChange;
use crate::payload::org::OrgEvent;
use crate::payload::project::ProjectEvent;
use crate::payload::user::UserEvent;
use crate::unique::UniqueConstraint;

/// Closed set of aggregate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Instance,
    Org,
    User,
    Project,
}

impl AggregateType {
    /// Stable string form used in logs and keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Instance => "instance",
            AggregateType::Org => "org",
            AggregateType::User => "user",
            AggregateType::Project => "project",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one aggregate plus its current resource owner.
///
/// The resource owner is not part of the identity: it is attached to each
/// event and may differ between events of the same aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aggregate {
    /// Tenant the aggregate lives in.
    pub instance_id: String,
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Aggregate ID, unique per instance and type.
    pub id: String,
    /// Owning organization (or the instance itself for instance aggregates).
    pub resource_owner: String,
}

impl Aggregate {
    /// Build a well-formed aggregate identity.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidArgument`] if the instance ID, the
    /// aggregate ID, or the resource owner is empty.
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_type: AggregateType,
        id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Result<Self, CommandError> {
        let aggregate = Self {
            instance_id: instance_id.into(),
            aggregate_type,
            id: id.into(),
            resource_owner: resource_owner.into(),
        };
        aggregate.check().map_err(CommandError::InvalidArgument)?;
        Ok(aggregate)
    }

    /// Identity key, without the resource owner.
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            instance_id: self.instance_id.clone(),
            aggregate_type: self.aggregate_type,
            id: self.id.clone(),
        }
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.instance_id.trim().is_empty() {
            return Err("aggregate instance id must not be empty".to_string());
        }
        if self.id.trim().is_empty() {
            return Err(format!("{} aggregate id must not be empty", self.aggregate_type));
        }
        if self.resource_owner.trim().is_empty() {
            return Err(format!(
                "{} aggregate {} has no resource owner",
                self.aggregate_type, self.id
            ));
        }
        Ok(())
    }
}

/// `(instance, type, id)`: the unit of ordering and concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub id: String,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.id)
    }
}

/// A committed, immutable fact.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Aggregate the event belongs to, with the resource owner at the time
    /// of the event.
    pub aggregate: Aggregate,
    /// Decoded payload.
    pub payload: EventPayload,
    /// Per-aggregate sequence, starting at 1, strictly increasing, gap-free.
    pub sequence: u64,
    /// Global commit position, used only to order filter results.
    pub position: u64,
    /// Commit timestamp assigned by the gateway.
    pub created_at: DateTime<Utc>,
    /// Actor that caused the event.
    pub creator: String,
    /// Correlation ID of the originating request, if any.
    pub correlation_id: Option<String>,
}

impl Event {
    /// Dotted event type.
    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }
}

/// Typed payload of an event, keyed by `(aggregate type, event type)`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Instance(InstanceEvent),
    Org(OrgEvent),
    User(UserEvent),
    Project(ProjectEvent),
    /// An event type this build does not know. Reducers skip it.
    Unknown { event_type: String, data: Value },
}

impl From<InstanceEvent> for EventPayload {
    fn from(event: InstanceEvent) -> Self {
        EventPayload::Instance(event)
    }
}

impl From<OrgEvent> for EventPayload {
    fn from(event: OrgEvent) -> Self {
        EventPayload::Org(event)
    }
}

impl From<UserEvent> for EventPayload {
    fn from(event: UserEvent) -> Self {
        EventPayload::User(event)
    }
}

impl From<ProjectEvent> for EventPayload {
    fn from(event: ProjectEvent) -> Self {
        EventPayload::Project(event)
    }
}

impl EventPayload {
    /// Dotted event type.
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::Instance(e) => e.event_type(),
            EventPayload::Org(e) => e.event_type(),
            EventPayload::User(e) => e.event_type(),
            EventPayload::Project(e) => e.event_type(),
            EventPayload::Unknown { event_type, .. } => event_type,
        }
    }

    /// Aggregate type this payload belongs to; `None` for unknown payloads.
    pub fn aggregate_type(&self) -> Option<AggregateType> {
        match self {
            EventPayload::Instance(_) => Some(AggregateType::Instance),
            EventPayload::Org(_) => Some(AggregateType::Org),
            EventPayload::User(_) => Some(AggregateType::User),
            EventPayload::Project(_) => Some(AggregateType::Project),
            EventPayload::Unknown { .. } => None,
        }
    }

    /// Encode into the stored `(event_type, data)` pair.
    ///
    /// The payload enums use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`). The `"type"` field
    /// becomes the stored event type and `"data"` the stored payload; unit
    /// variants have no `"data"` and encode as `null`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn encode(&self) -> serde_json::Result<(String, Value)> {
        let value = match self {
            EventPayload::Instance(e) => serde_json::to_value(e)?,
            EventPayload::Org(e) => serde_json::to_value(e)?,
            EventPayload::User(e) => serde_json::to_value(e)?,
            EventPayload::Project(e) => serde_json::to_value(e)?,
            EventPayload::Unknown { event_type, data } => {
                return Ok((event_type.clone(), data.clone()));
            }
        };
        let Value::Object(mut obj) = value else {
            return Err(serde::ser::Error::custom(
                "adjacently tagged payload must serialize to a JSON object",
            ));
        };
        let event_type = match obj.remove("type") {
            Some(Value::String(t)) => t,
            _ => {
                return Err(serde::ser::Error::custom(
                    "adjacently tagged payload must have a string 'type' field",
                ));
            }
        };
        let data = obj.remove("data").unwrap_or(Value::Null);
        Ok((event_type, data))
    }

    /// Decode a stored `(event_type, data)` pair for the given aggregate type.
    ///
    /// Event types that are unknown to the aggregate type, or whose data no
    /// longer matches the variant shape, decode to
    /// [`EventPayload::Unknown`] instead of failing.
    pub fn decode(aggregate_type: AggregateType, event_type: &str, data: Value) -> Self {
        let decoded = match aggregate_type {
            AggregateType::Instance => decode_tagged(event_type, &data).map(EventPayload::Instance),
            AggregateType::Org => decode_tagged(event_type, &data).map(EventPayload::Org),
            AggregateType::User => decode_tagged(event_type, &data).map(EventPayload::User),
            AggregateType::Project => decode_tagged(event_type, &data).map(EventPayload::Project),
        };
        decoded.unwrap_or_else(|| {
            tracing::debug!(
                aggregate_type = %aggregate_type,
                event_type,
                "decoded event as unknown"
            );
            EventPayload::Unknown {
                event_type: event_type.to_string(),
                data,
            }
        })
    }

    /// Uniqueness-ledger mutations implied by this payload.
    pub fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        match self {
            EventPayload::Org(e) => e.unique_constraints(aggregate),
            EventPayload::User(e) => e.unique_constraints(aggregate),
            EventPayload::Project(e) => e.unique_constraints(aggregate),
            EventPayload::Instance(_) | EventPayload::Unknown { .. } => Vec::new(),
        }
    }

    /// Structural validation performed by the gateway before any write.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated field. Unknown payloads
    /// are always rejected: only typed events may be appended.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EventPayload::Instance(e) => e.validate(),
            EventPayload::Org(e) => e.validate(),
            EventPayload::User(e) => e.validate(),
            EventPayload::Project(e) => e.validate(),
            EventPayload::Unknown { event_type, .. } => {
                Err(format!("cannot append unknown event type {event_type}"))
            }
        }
    }

    /// Aggregate-independent metadata view, if this is a metadata event.
    pub fn metadata_change(&self) -> Option<MetadataChange<'_>> {
        match self {
            EventPayload::User(UserEvent::MetadataSet(s))
            | EventPayload::Org(OrgEvent::MetadataSet(s))
            | EventPayload::Project(ProjectEvent::MetadataSet(s)) => Some(MetadataChange::Set {
                key: &s.key,
                value: &s.value,
            }),
            EventPayload::User(UserEvent::MetadataRemoved(r))
            | EventPayload::Org(OrgEvent::MetadataRemoved(r))
            | EventPayload::Project(ProjectEvent::MetadataRemoved(r)) => {
                Some(MetadataChange::Removed { key: &r.key })
            }
            EventPayload::User(UserEvent::MetadataRemovedAll)
            | EventPayload::Org(OrgEvent::MetadataRemovedAll)
            | EventPayload::Project(ProjectEvent::MetadataRemovedAll) => {
                Some(MetadataChange::RemovedAll)
            }
            _ => None,
        }
    }
}

fn decode_tagged<T: DeserializeOwned>(event_type: &str, data: &Value) -> Option<T> {
    // Rebuild the adjacently tagged form. Unit variants carry no "data".
    let tagged = if data.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": data })
    };
    serde_json::from_value(tagged).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::metadata::MetadataSet;
    use crate::unique::{self, UniqueAction};

    fn user_aggregate() -> Aggregate {
        Aggregate::new("inst-1", AggregateType::User, "u-1", "org-1")
            .expect("aggregate should be well-formed")
    }

    fn org_aggregate() -> Aggregate {
        Aggregate::new("inst-1", AggregateType::Org, "org-1", "org-1")
            .expect("aggregate should be well-formed")
    }

    #[test]
    fn aggregate_requires_identity_fields() {
        assert!(Aggregate::new("", AggregateType::User, "u-1", "org-1").is_err());
        assert!(Aggregate::new("i", AggregateType::User, " ", "org-1").is_err());
        assert!(Aggregate::new("i", AggregateType::User, "u-1", "").is_err());
    }

    #[test]
    fn aggregate_key_display_is_type_slash_id() {
        assert_eq!(user_aggregate().key().to_string(), "user/u-1");
    }

    #[test]
    fn encode_unit_variant_has_null_data() {
        let (event_type, data) = EventPayload::from(UserEvent::EmailVerified)
            .encode()
            .expect("encode should succeed");
        assert_eq!(event_type, "user.human.email.verified");
        assert!(data.is_null());
    }

    #[test]
    fn encode_then_decode_preserves_struct_variant() {
        let payload = EventPayload::from(UserEvent::EmailChanged {
            email: "a@b.com".into(),
        });
        let (event_type, data) = payload.encode().expect("encode should succeed");
        assert_eq!(event_type, UserEvent::EMAIL_CHANGED);
        assert_eq!(data["email"], "a@b.com");

        let decoded = EventPayload::decode(AggregateType::User, &event_type, data);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_unit_variant_from_null() {
        let decoded = EventPayload::decode(AggregateType::User, UserEvent::LOCKED, Value::Null);
        assert_eq!(decoded, EventPayload::User(UserEvent::Locked));
    }

    #[test]
    fn decode_unknown_type_yields_unknown() {
        let decoded = EventPayload::decode(
            AggregateType::User,
            "user.human.avatar.added",
            serde_json::json!({"key": "x"}),
        );
        assert!(matches!(decoded, EventPayload::Unknown { .. }));
        assert_eq!(decoded.event_type(), "user.human.avatar.added");
        assert_eq!(decoded.aggregate_type(), None);
    }

    #[test]
    fn decode_checks_aggregate_type() {
        // An org event type stored on a user aggregate is not an org event.
        let decoded = EventPayload::decode(
            AggregateType::User,
            OrgEvent::ADDED,
            serde_json::json!({"name": "acme"}),
        );
        assert!(matches!(decoded, EventPayload::Unknown { .. }));
    }

    #[test]
    fn decode_malformed_data_yields_unknown() {
        let decoded = EventPayload::decode(
            AggregateType::Org,
            OrgEvent::ADDED,
            serde_json::json!({"unexpected": 1}),
        );
        assert!(matches!(decoded, EventPayload::Unknown { .. }));
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let payloads: Vec<EventPayload> = vec![
            UserEvent::Locked.into(),
            UserEvent::EmailVerificationFailed.into(),
            UserEvent::UsernameChanged {
                old_username: "a".into(),
                username: "b".into(),
            }
            .into(),
            UserEvent::MetadataRemovedAll.into(),
            OrgEvent::LoginPolicyIdpRemoved {
                idp_config_id: "idp-1".into(),
            }
            .into(),
            OrgEvent::DomainRemoved {
                domain: "acme.com".into(),
                was_verified: false,
            }
            .into(),
            ProjectEvent::Added { name: "p".into() }.into(),
        ];
        for payload in payloads {
            let (tag, _) = payload.encode().expect("encode should succeed");
            assert_eq!(tag, payload.event_type());
        }
    }

    #[test]
    fn username_change_releases_then_claims() {
        let payload = EventPayload::from(UserEvent::UsernameChanged {
            old_username: "alice".into(),
            username: "alicia".into(),
        });
        let constraints = payload.unique_constraints(&user_aggregate());
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].action, UniqueAction::Remove);
        assert_eq!(constraints[0].key, "org-1:alice");
        assert_eq!(constraints[1].action, UniqueAction::Add);
        assert_eq!(constraints[1].namespace, unique::USERNAMES);
        assert_eq!(constraints[1].key, "org-1:alicia");
    }

    #[test]
    fn unverified_domain_removal_releases_nothing() {
        let payload = EventPayload::from(OrgEvent::DomainRemoved {
            domain: "acme.com".into(),
            was_verified: false,
        });
        assert!(payload.unique_constraints(&org_aggregate()).is_empty());
    }

    #[test]
    fn unknown_payload_fails_validation() {
        let payload = EventPayload::Unknown {
            event_type: "x".into(),
            data: Value::Null,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn metadata_change_is_aggregate_independent() {
        let set = MetadataSet {
            key: "k".into(),
            value: b"v".to_vec(),
        };
        let user = EventPayload::from(UserEvent::MetadataSet(set.clone()));
        let org = EventPayload::from(OrgEvent::MetadataSet(set));
        assert_eq!(user.metadata_change(), org.metadata_change());
        assert_eq!(
            EventPayload::from(ProjectEvent::MetadataRemovedAll).metadata_change(),
            Some(MetadataChange::RemovedAll)
        );
        assert_eq!(
            EventPayload::from(UserEvent::Locked).metadata_change(),
            None
        );
    }
}
