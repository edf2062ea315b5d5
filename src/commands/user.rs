//! Human users: creation, renaming, locking and removal, plus the helpers
//! shared by the other user command modules.

use async_trait::async_trait;

use crate::command::{Command, SequenceGuard};
use crate::error::CommandError;
use crate::event::{Aggregate, AggregateType};
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::{SecretGeneratorType, VerifyOutcome};
use crate::services::permissions;
use crate::write_model::{HumanWriteModel, OrgWriteModel, UserState, WriteModel};

use super::{aggregate, require};

/// Create a human user in an organization.
///
/// Unverified contacts get a verification code; the plain code is only
/// part of the output when the matching `return_*_code` flag is set.
#[derive(Debug, Clone, Default)]
pub struct AddHuman {
    pub org_id: String,
    /// Generated if absent.
    pub user_id: Option<String>,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    /// Defaults to "first last".
    pub display_name: Option<String>,
    pub preferred_language: Option<String>,
    pub email: String,
    pub email_verified: bool,
    pub return_email_code: bool,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub return_phone_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedHuman {
    pub user_id: String,
    pub email_code: Option<String>,
    pub phone_code: Option<String>,
}

impl Validation for AddHuman {
    type Output = AddedHuman;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.username = self.username.trim().to_string();
        require("username", &self.username)?;
        if self.username.chars().any(char::is_whitespace) {
            return Err(CommandError::invalid("username must not contain whitespace"));
        }
        require("first_name", &self.first_name)?;
        require("last_name", &self.last_name)?;
        self.email = normalize_email(&self.email)?;
        self.phone = self.phone.as_deref().map(canonical_phone).transpose()?;
        if let Some(user_id) = &self.user_id {
            require("user_id", user_id)?;
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddHuman {
    type Output = AddedHuman;

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<AddedHuman>, CommandError> {
        let user_id = match &self.user_id {
            Some(id) => id.clone(),
            None => env.next_id()?,
        };
        env.check_permission(permissions::USER_WRITE, &self.org_id, &user_id)?;

        let org = env
            .filter
            .load(OrgWriteModel::new(env.filter.instance_id(), self.org_id.as_str()))
            .await?;
        if !org.exists() {
            return Err(CommandError::precondition("organization not found"));
        }
        let existing = env
            .filter
            .load(HumanWriteModel::new(env.filter.instance_id(), user_id.as_str(), ""))
            .await?;
        if existing.processed_sequence() > 0 {
            return Err(CommandError::already_exists("user already exists"));
        }

        let agg = aggregate(env, AggregateType::User, &user_id, &self.org_id)?;
        let display_name = self
            .display_name
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("{} {}", self.first_name.trim(), self.last_name.trim()));
        let mut commands = vec![
            Command::new(
                agg.clone(),
                UserEvent::HumanAdded {
                    username: self.username.clone(),
                    first_name: self.first_name.trim().to_string(),
                    last_name: self.last_name.trim().to_string(),
                    display_name,
                    preferred_language: self.preferred_language.clone(),
                    email: self.email.clone(),
                    phone: self.phone.clone(),
                },
            )
            .guarded(SequenceGuard::new_aggregate()),
        ];

        let mut output = AddedHuman {
            user_id,
            email_code: None,
            phone_code: None,
        };
        if self.email_verified {
            commands.push(Command::new(agg.clone(), UserEvent::EmailVerified));
        } else {
            let code = env.issue_code(SecretGeneratorType::VerifyEmailCode).await?;
            commands.push(Command::new(
                agg.clone(),
                UserEvent::EmailCodeAdded {
                    code: code.crypted,
                    expiry: code.expiry,
                    code_returned: self.return_email_code,
                },
            ));
            if self.return_email_code {
                output.email_code = Some(code.plain);
            }
        }
        if self.phone.is_some() {
            if self.phone_verified {
                commands.push(Command::new(agg.clone(), UserEvent::PhoneVerified));
            } else {
                let code = env.issue_code(SecretGeneratorType::VerifyPhoneCode).await?;
                commands.push(Command::new(
                    agg,
                    UserEvent::PhoneCodeAdded {
                        code: code.crypted,
                        expiry: code.expiry,
                        code_returned: self.return_phone_code,
                    },
                ));
                if self.return_phone_code {
                    output.phone_code = Some(code.plain);
                }
            }
        }
        Ok(Prepared::new(commands, output))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeUsername {
    pub user_id: String,
    pub username: String,
}

impl Validation for ChangeUsername {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.username = self.username.trim().to_string();
        require("username", &self.username)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeUsername {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.username == self.username {
            return Err(CommandError::precondition("username not changed"));
        }
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::UsernameChanged {
                old_username: user.username.clone(),
                username: self.username.clone(),
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockUser {
    pub user_id: String,
}

impl Validation for LockUser {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for LockUser {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.state == UserState::Locked {
            return Err(CommandError::precondition("user already locked"));
        }
        let command =
            Command::new(user_aggregate(env, &user)?, UserEvent::Locked).guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Unlock a user. Also resets every failed-attempt counter.
#[derive(Debug, Clone, Default)]
pub struct UnlockUser {
    pub user_id: String,
}

impl Validation for UnlockUser {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for UnlockUser {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.state != UserState::Locked {
            return Err(CommandError::precondition("user not locked"));
        }
        let command =
            Command::new(user_aggregate(env, &user)?, UserEvent::Unlocked).guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Remove a user, releasing its username and external identities.
#[derive(Debug, Clone, Default)]
pub struct RemoveUser {
    pub user_id: String,
}

impl Validation for RemoveUser {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveUser {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_permission(permissions::USER_DELETE, user.resource_owner(), &self.user_id)?;
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::Removed {
                username: user.username.clone(),
                external_links: user.external_links.clone(),
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Load a user that must exist, whatever org owns it.
pub(super) async fn load_user(
    env: &Env<'_>,
    user_id: &str,
) -> Result<HumanWriteModel, CommandError> {
    let user = env
        .filter
        .load(HumanWriteModel::new(env.filter.instance_id(), user_id, ""))
        .await?;
    if !user.exists() {
        return Err(CommandError::not_found("user not found"));
    }
    Ok(user)
}

pub(super) fn user_aggregate(
    env: &Env<'_>,
    user: &HumanWriteModel,
) -> Result<Aggregate, CommandError> {
    aggregate(env, AggregateType::User, user.user_id(), user.resource_owner())
}

/// Turn a verification outcome into the commands to push.
///
/// A wrong code records `failed` (and locks the user once the failure
/// ceiling is reached), then rejects; the other non-valid outcomes fail
/// without writing.
pub(super) fn verification_result(
    env: &Env<'_>,
    user: &HumanWriteModel,
    outcome: VerifyOutcome,
    failed_attempts: u32,
    verified: Vec<UserEvent>,
    failed: UserEvent,
) -> Result<Prepared<()>, CommandError> {
    let agg = user_aggregate(env, user)?;
    let guard = user.guard();
    match outcome {
        VerifyOutcome::Valid => Ok(Prepared::new(
            verified
                .into_iter()
                .map(|event| Command::new(agg.clone(), event).guarded(guard.clone()))
                .collect(),
            (),
        )),
        VerifyOutcome::InvalidCode => {
            tracing::warn!(
                user_id = %user.user_id(),
                failed_attempts = failed_attempts + 1,
                "code verification failed"
            );
            let mut commands = vec![Command::new(agg.clone(), failed).guarded(guard.clone())];
            if env.reaches_ceiling(failed_attempts) && user.state != UserState::Locked {
                commands.push(Command::new(agg, UserEvent::Locked).guarded(guard));
            }
            Ok(Prepared::rejected(
                commands,
                (),
                CommandError::invalid("code is invalid"),
            ))
        }
        VerifyOutcome::Expired => Err(CommandError::precondition("code expired")),
        VerifyOutcome::Locked => Err(CommandError::precondition(
            "too many failed attempts, user is locked",
        )),
        VerifyOutcome::NoCodePending => Err(CommandError::precondition("no code pending")),
    }
}

pub(super) fn normalize_email(email: &str) -> Result<String, CommandError> {
    let email = email.trim();
    require("email", email)?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email.to_string()),
        _ => Err(CommandError::invalid("email is malformed")),
    }
}

/// Canonical `+digits` form of a phone number.
///
/// Accepts separators (space, dash, dot, parentheses) and a `00` prefix in
/// place of `+`.
pub(super) fn canonical_phone(phone: &str) -> Result<String, CommandError> {
    let phone = phone.trim();
    require("phone", phone)?;
    let (prefixed, rest) = if let Some(rest) = phone.strip_prefix('+') {
        (true, rest)
    } else if let Some(rest) = phone.strip_prefix("00") {
        (true, rest)
    } else {
        (false, phone)
    };
    if !prefixed {
        return Err(CommandError::invalid(
            "phone must be in international format",
        ));
    }
    let mut digits = String::with_capacity(rest.len() + 1);
    digits.push('+');
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return Err(CommandError::invalid("phone contains invalid characters")),
        }
    }
    if !(7..=15).contains(&(digits.len() - 1)) {
        return Err(CommandError::invalid("phone has an invalid length"));
    }
    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{Harness, human};
    use crate::event::EventPayload;
    use crate::unique;

    #[test]
    fn phone_is_canonicalized() {
        assert_eq!(
            canonical_phone(" +41 (79) 123-45.67 ").expect("valid phone"),
            "+41791234567"
        );
        assert_eq!(
            canonical_phone("0041791234567").expect("valid phone"),
            "+41791234567"
        );
        assert!(canonical_phone("0791234567").is_err());
        assert!(canonical_phone("+41 79 abc").is_err());
        assert!(canonical_phone("+1234").is_err());
    }

    #[test]
    fn add_human_validation_catches_bad_input() {
        let mut cmd = human("org-1", "ada");
        cmd.email = "not-an-email".into();
        assert!(matches!(cmd.validate(), Err(CommandError::InvalidArgument(_))));
        assert!(human("org-1", "a da").validate().is_err());
        assert!(human("", "ada").validate().is_err());
    }

    #[tokio::test]
    async fn add_human_emits_added_and_code() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let mut cmd = human(&org, "ada");
        cmd.return_email_code = true;
        cmd.phone = Some("+41 79 123 45 67".into());
        cmd.phone_verified = true;
        let outcome = h
            .commands
            .execute(&h.ctx, cmd)
            .await
            .expect("add human should succeed");
        let user_id = outcome.output.user_id.clone();
        assert_eq!(outcome.output.email_code.as_ref().map(String::len), Some(6));
        assert_eq!(outcome.output.phone_code, None);
        assert_eq!(outcome.details.resource_owner, org);

        let events = h.events_of(AggregateType::User, &user_id).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                UserEvent::HUMAN_ADDED,
                UserEvent::EMAIL_CODE_ADDED,
                UserEvent::PHONE_VERIFIED
            ]
        );
        match &events[0].payload {
            EventPayload::User(UserEvent::HumanAdded {
                phone, display_name, ..
            }) => {
                assert_eq!(phone.as_deref(), Some("+41791234567"));
                assert_eq!(display_name, "Ada Lovelace");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(
            h.store
                .has_unique("inst-1", unique::USERNAMES, &format!("{org}:ada"))
                .await
        );
    }

    #[tokio::test]
    async fn add_human_requires_existing_org() {
        let h = Harness::new();
        let result = h.commands.execute(&h.ctx, human("missing", "ada")).await;
        assert!(matches!(result, Err(CommandError::PreconditionFailed(_))));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn add_human_with_taken_id_is_rejected() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let mut cmd = human(&org, "other");
        cmd.user_id = Some(user_id);
        assert!(matches!(
            h.commands.execute(&h.ctx, cmd).await,
            Err(CommandError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn change_username_detects_noop_and_renames() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;

        let same = ChangeUsername {
            user_id: user_id.clone(),
            username: "ada".into(),
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, same).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        h.commands
            .execute(
                &h.ctx,
                ChangeUsername {
                    user_id,
                    username: "lovelace".into(),
                },
            )
            .await
            .expect("rename should succeed");
        assert!(!h.store.has_unique("inst-1", unique::USERNAMES, &format!("{org}:ada")).await);
        assert!(
            h.store
                .has_unique("inst-1", unique::USERNAMES, &format!("{org}:lovelace"))
                .await
        );
    }

    #[tokio::test]
    async fn lock_unlock_preconditions() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;

        let unlock = UnlockUser {
            user_id: user_id.clone(),
        };
        let lock = LockUser { user_id };
        assert!(matches!(
            h.commands.execute(&h.ctx, unlock.clone()).await,
            Err(CommandError::PreconditionFailed(_))
        ));
        h.commands
            .execute(&h.ctx, lock.clone())
            .await
            .expect("lock should succeed");
        assert!(matches!(
            h.commands.execute(&h.ctx, lock).await,
            Err(CommandError::PreconditionFailed(_))
        ));
        h.commands
            .execute(&h.ctx, unlock)
            .await
            .expect("unlock should succeed");
    }

    #[tokio::test]
    async fn remove_user_releases_username() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        h.commands
            .execute(
                &h.ctx,
                RemoveUser {
                    user_id: user_id.clone(),
                },
            )
            .await
            .expect("remove should succeed");
        assert!(!h.store.has_unique("inst-1", unique::USERNAMES, &format!("{org}:ada")).await);
        assert!(matches!(
            h.commands.execute(&h.ctx, RemoveUser { user_id }).await,
            Err(CommandError::NotFound(_))
        ));
        h.add_user(&org, "ada").await;
    }

    #[tokio::test]
    async fn permission_is_checked_except_for_self_service() {
        use std::sync::Arc;

        use crate::testing::DenyAll;

        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let mut services = h.commands.services().clone();
        services.permissions = Arc::new(DenyAll);
        let store = h.commands.store().clone();

        let result = crate::preparation::execute(
            store.as_ref(),
            &services,
            &h.ctx,
            LockUser {
                user_id: user_id.clone(),
            },
        )
        .await;
        assert!(matches!(result, Err(CommandError::PermissionDenied(_))));

        let own = h.ctx.clone().with_actor(user_id.clone());
        crate::preparation::execute(
            store.as_ref(),
            &services,
            &own,
            ChangeUsername {
                user_id,
                username: "ada2".into(),
            },
        )
        .await
        .expect("self-service should succeed");
    }
}
