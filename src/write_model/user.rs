//! The human user write model.
//!
//! Tracks the user's lifecycle together with every pending verification code
//! and its failure count; the code commands decide from this state alone.

use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::{QueryClause, SearchQuery};
use crate::payload::user::{ExternalLink, UserEvent};
use crate::secret::PendingCode;

use super::{ModelBase, WriteModel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserState {
    #[default]
    Unspecified,
    Active,
    Locked,
    Removed,
}

impl UserState {
    pub fn exists(self) -> bool {
        matches!(self, UserState::Active | UserState::Locked)
    }
}

/// A verifiable contact channel (email or phone).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactState {
    pub address: String,
    pub verified: bool,
    pub code: Option<PendingCode>,
    pub failed_attempts: u32,
}

impl ContactState {
    fn new(address: String) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    fn change(&mut self, address: String) {
        self.address = address;
        self.verified = false;
        self.code = None;
    }

    fn verified(&mut self) {
        self.verified = true;
        self.code = None;
        self.failed_attempts = 0;
    }
}

/// Full state of a human user, minus metadata.
#[derive(Debug, Clone)]
pub struct HumanWriteModel {
    base: ModelBase,
    pub state: UserState,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: ContactState,
    pub phone: Option<ContactState>,
    pub password_set: bool,
    pub password_code: Option<PendingCode>,
    pub password_failed_attempts: u32,
    /// Set once the user proved control of its account: an init code was
    /// checked, the email verified, or a password set.
    pub initialized: bool,
    pub init_code: Option<PendingCode>,
    pub init_failed_attempts: u32,
    pub external_links: Vec<ExternalLink>,
}

impl HumanWriteModel {
    /// An empty `resource_owner` loads the user regardless of its owner.
    pub fn new(
        instance_id: impl Into<String>,
        user_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            base: ModelBase::new(instance_id, AggregateType::User, user_id, resource_owner),
            state: UserState::Unspecified,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: ContactState::default(),
            phone: None,
            password_set: false,
            password_code: None,
            password_failed_attempts: 0,
            initialized: false,
            init_code: None,
            init_failed_attempts: 0,
            external_links: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.state.exists()
    }

    pub fn user_id(&self) -> &str {
        &self.base.aggregate_id
    }

    pub fn resource_owner(&self) -> &str {
        &self.base.resource_owner
    }

    fn mark_initialized(&mut self) {
        self.initialized = true;
        self.init_code = None;
        self.init_failed_attempts = 0;
    }

    pub fn has_link(&self, idp_config_id: &str, external_user_id: &str) -> bool {
        self.external_links
            .iter()
            .any(|l| l.idp_config_id == idp_config_id && l.external_user_id == external_user_id)
    }
}

impl WriteModel for HumanWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::User)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(UserEvent::LIFECYCLE_TYPES),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::User(payload) = &event.payload else {
            return;
        };
        match payload {
            UserEvent::HumanAdded {
                username,
                first_name,
                last_name,
                email,
                phone,
                ..
            } => {
                self.state = UserState::Active;
                self.username = username.clone();
                self.first_name = first_name.clone();
                self.last_name = last_name.clone();
                self.email = ContactState::new(email.clone());
                self.phone = phone.clone().map(ContactState::new);
            }
            UserEvent::UsernameChanged { username, .. } => self.username = username.clone(),
            UserEvent::Locked => self.state = UserState::Locked,
            UserEvent::Unlocked => {
                self.state = UserState::Active;
                self.email.failed_attempts = 0;
                if let Some(phone) = &mut self.phone {
                    phone.failed_attempts = 0;
                }
                self.password_failed_attempts = 0;
                self.init_failed_attempts = 0;
            }
            UserEvent::Removed { .. } => {
                self.state = UserState::Removed;
                self.external_links.clear();
            }

            UserEvent::EmailChanged { email } => self.email.change(email.clone()),
            UserEvent::EmailCodeAdded { code, expiry, .. } => {
                self.email.code = Some(PendingCode {
                    code: code.clone(),
                    created_at: event.created_at,
                    expiry: *expiry,
                });
            }
            UserEvent::EmailVerified => {
                self.email.verified();
                self.mark_initialized();
            }
            UserEvent::EmailVerificationFailed => self.email.failed_attempts += 1,

            UserEvent::PhoneChanged { phone } => match &mut self.phone {
                Some(current) => current.change(phone.clone()),
                None => self.phone = Some(ContactState::new(phone.clone())),
            },
            UserEvent::PhoneCodeAdded { code, expiry, .. } => {
                if let Some(phone) = &mut self.phone {
                    phone.code = Some(PendingCode {
                        code: code.clone(),
                        created_at: event.created_at,
                        expiry: *expiry,
                    });
                }
            }
            UserEvent::PhoneVerified => {
                if let Some(phone) = &mut self.phone {
                    phone.verified();
                }
            }
            UserEvent::PhoneVerificationFailed => {
                if let Some(phone) = &mut self.phone {
                    phone.failed_attempts += 1;
                }
            }
            UserEvent::PhoneRemoved => self.phone = None,

            UserEvent::PasswordCodeAdded { code, expiry, .. } => {
                self.password_code = Some(PendingCode {
                    code: code.clone(),
                    created_at: event.created_at,
                    expiry: *expiry,
                });
            }
            UserEvent::PasswordCodeCheckFailed => self.password_failed_attempts += 1,
            UserEvent::PasswordChanged { .. } => {
                self.password_set = true;
                self.password_code = None;
                self.password_failed_attempts = 0;
                self.mark_initialized();
            }

            UserEvent::InitCodeAdded { code, expiry, .. } => {
                self.init_code = Some(PendingCode {
                    code: code.clone(),
                    created_at: event.created_at,
                    expiry: *expiry,
                });
            }
            UserEvent::InitializedCheckSucceeded => self.mark_initialized(),
            UserEvent::InitializedCheckFailed => self.init_failed_attempts += 1,

            UserEvent::ExternalIdpAdded {
                idp_config_id,
                external_user_id,
                ..
            } => self.external_links.push(ExternalLink {
                idp_config_id: idp_config_id.clone(),
                external_user_id: external_user_id.clone(),
            }),
            UserEvent::ExternalIdpRemoved {
                idp_config_id,
                external_user_id,
            }
            | UserEvent::ExternalIdpCascadeRemoved {
                idp_config_id,
                external_user_id,
            } => self.external_links.retain(|l| {
                l.idp_config_id != *idp_config_id || l.external_user_id != *external_user_id
            }),

            UserEvent::MetadataSet(_)
            | UserEvent::MetadataRemoved(_)
            | UserEvent::MetadataRemovedAll => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::crypto::{AES_256_GCM, CryptoValue};
    use crate::event::Event;
    use crate::write_model::test_support::event;

    fn code(byte: u8) -> CryptoValue {
        CryptoValue {
            algorithm: AES_256_GCM.into(),
            key_id: "k-1".into(),
            crypted: vec![byte; 16],
        }
    }

    fn added() -> UserEvent {
        UserEvent::HumanAdded {
            username: "ada".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            display_name: "Ada Lovelace".into(),
            preferred_language: None,
            email: "a@b.com".into(),
            phone: Some("+41791234567".into()),
        }
    }

    fn reduce(events: &[Event]) -> HumanWriteModel {
        let mut model = HumanWriteModel::new("inst-1", "u-1", "org-1");
        model.append_events(events);
        model.reduce().expect("reduce should succeed");
        model
    }

    fn user_events(payloads: Vec<UserEvent>) -> Vec<Event> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| event(AggregateType::User, "u-1", "org-1", i as u64 + 1, p))
            .collect()
    }

    #[test]
    fn unknown_user_does_not_exist() {
        let model = reduce(&[]);
        assert!(!model.exists());
        assert_eq!(model.processed_sequence(), 0);
    }

    #[test]
    fn added_user_has_unverified_contacts() {
        let model = reduce(&user_events(vec![added()]));
        assert!(model.exists());
        assert_eq!(model.username, "ada");
        assert_eq!(model.email.address, "a@b.com");
        assert!(!model.email.verified);
        assert_eq!(
            model.phone.as_ref().map(|p| p.address.as_str()),
            Some("+41791234567")
        );
    }

    #[test]
    fn code_added_records_event_time_and_expiry() {
        let events = user_events(vec![
            added(),
            UserEvent::EmailCodeAdded {
                code: code(1),
                expiry: Duration::from_secs(3600),
                code_returned: false,
            },
        ]);
        let model = reduce(&events);
        let pending = model.email.code.expect("code should be pending");
        assert_eq!(pending.created_at, events[1].created_at);
        assert_eq!(pending.expiry, Duration::from_secs(3600));
    }

    #[test]
    fn reissued_code_supersedes_previous() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::EmailCodeAdded {
                code: code(1),
                expiry: Duration::from_secs(60),
                code_returned: false,
            },
            UserEvent::EmailCodeAdded {
                code: code(2),
                expiry: Duration::from_secs(60),
                code_returned: false,
            },
        ]));
        assert_eq!(model.email.code.map(|c| c.code), Some(code(2)));
    }

    #[test]
    fn failures_count_until_verified() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::EmailVerificationFailed,
            UserEvent::EmailVerificationFailed,
        ]));
        assert_eq!(model.email.failed_attempts, 2);

        let model = reduce(&user_events(vec![
            added(),
            UserEvent::EmailVerificationFailed,
            UserEvent::EmailVerified,
        ]));
        assert_eq!(model.email.failed_attempts, 0);
        assert!(model.email.verified);
        assert!(model.email.code.is_none());
    }

    #[test]
    fn email_change_keeps_failure_count() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::EmailVerificationFailed,
            UserEvent::EmailChanged {
                email: "new@b.com".into(),
            },
        ]));
        assert_eq!(model.email.failed_attempts, 1);
        assert!(!model.email.verified);
    }

    #[test]
    fn unlock_resets_all_counters() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::EmailVerificationFailed,
            UserEvent::PhoneVerificationFailed,
            UserEvent::PasswordCodeCheckFailed,
            UserEvent::Locked,
            UserEvent::Unlocked,
        ]));
        assert_eq!(model.state, UserState::Active);
        assert_eq!(model.email.failed_attempts, 0);
        assert_eq!(model.phone.map(|p| p.failed_attempts), Some(0));
        assert_eq!(model.password_failed_attempts, 0);
    }

    #[test]
    fn init_code_is_settled_by_verified_email() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::InitCodeAdded {
                code: code(3),
                expiry: Duration::from_secs(60),
                code_returned: false,
            },
            UserEvent::InitializedCheckFailed,
        ]));
        assert!(!model.initialized);
        assert!(model.init_code.is_some());
        assert_eq!(model.init_failed_attempts, 1);

        let model = reduce(&user_events(vec![
            added(),
            UserEvent::InitCodeAdded {
                code: code(3),
                expiry: Duration::from_secs(60),
                code_returned: false,
            },
            UserEvent::InitializedCheckFailed,
            UserEvent::EmailVerified,
        ]));
        assert!(model.initialized);
        assert!(model.init_code.is_none());
        assert_eq!(model.init_failed_attempts, 0);
    }

    #[test]
    fn removed_is_terminal_but_later_events_still_apply() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::Removed {
                username: "ada".into(),
                external_links: Vec::new(),
            },
        ]));
        assert_eq!(model.state, UserState::Removed);
        assert!(!model.exists());

        let model = reduce(&user_events(vec![
            added(),
            UserEvent::Removed {
                username: "ada".into(),
                external_links: Vec::new(),
            },
            UserEvent::Locked,
        ]));
        assert_eq!(model.state, UserState::Locked);
    }

    #[test]
    fn phone_removed_clears_channel() {
        let model = reduce(&user_events(vec![added(), UserEvent::PhoneRemoved]));
        assert!(model.phone.is_none());
    }

    #[test]
    fn links_follow_add_and_cascade_remove() {
        let model = reduce(&user_events(vec![
            added(),
            UserEvent::ExternalIdpAdded {
                idp_config_id: "idp-1".into(),
                external_user_id: "ext-1".into(),
                display_name: "ada@idp".into(),
            },
            UserEvent::ExternalIdpAdded {
                idp_config_id: "idp-2".into(),
                external_user_id: "ext-1".into(),
                display_name: "ada@idp2".into(),
            },
            UserEvent::ExternalIdpCascadeRemoved {
                idp_config_id: "idp-1".into(),
                external_user_id: "ext-1".into(),
            },
        ]));
        assert!(!model.has_link("idp-1", "ext-1"));
        assert!(model.has_link("idp-2", "ext-1"));
    }

    fn arb_user_event() -> impl Strategy<Value = UserEvent> {
        prop_oneof![
            Just(UserEvent::Locked),
            Just(UserEvent::Unlocked),
            Just(UserEvent::EmailVerified),
            Just(UserEvent::EmailVerificationFailed),
            Just(UserEvent::PhoneVerificationFailed),
            Just(UserEvent::PhoneRemoved),
            Just(UserEvent::PasswordCodeCheckFailed),
            "[a-z]{1,8}".prop_map(|local| UserEvent::EmailChanged {
                email: format!("{local}@example.com"),
            }),
            "[0-9]{6,10}".prop_map(|digits| UserEvent::PhoneChanged {
                phone: format!("+{digits}"),
            }),
            any::<u8>().prop_map(|b| UserEvent::EmailCodeAdded {
                code: code(b),
                expiry: Duration::from_secs(60),
                code_returned: false,
            }),
        ]
    }

    type Snapshot = (UserState, String, ContactState, Option<ContactState>, u32, u64);

    fn state_of(model: &HumanWriteModel) -> Snapshot {
        (
            model.state,
            model.username.clone(),
            model.email.clone(),
            model.phone.clone(),
            model.password_failed_attempts,
            model.processed_sequence(),
        )
    }

    proptest! {
        #[test]
        fn reduction_is_deterministic(payloads in prop::collection::vec(arb_user_event(), 0..24)) {
            let mut all = vec![added()];
            all.extend(payloads);
            let events = user_events(all);
            prop_assert_eq!(state_of(&reduce(&events)), state_of(&reduce(&events)));
        }

        #[test]
        fn prefix_then_suffix_equals_one_pass(
            payloads in prop::collection::vec(arb_user_event(), 0..24),
            split in 0usize..25,
        ) {
            let mut all = vec![added()];
            all.extend(payloads);
            let events = user_events(all);
            let split = split.min(events.len());

            let mut stepwise = HumanWriteModel::new("inst-1", "u-1", "org-1");
            stepwise.append_events(&events[..split]);
            stepwise.reduce().expect("reduce should succeed");
            // Replaying the full history on top must not double-apply the prefix.
            stepwise.append_events(&events);
            stepwise.reduce().expect("reduce should succeed");

            prop_assert_eq!(state_of(&stepwise), state_of(&reduce(&events)));
        }
    }
}
