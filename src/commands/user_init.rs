//! Account initialization: a user that has neither verified its email nor
//! set a password proves control of the account with an init code.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::{SecretGeneratorType, VerifyOutcome};
use crate::services::permissions;
use crate::write_model::WriteModel;

use super::require;
use super::user::{load_user, normalize_email, user_aggregate, verification_result};

/// Issue a fresh init code, optionally moving the user to a new email
/// first. Outputs the code if `return_code` is set.
#[derive(Debug, Clone, Default)]
pub struct ResendInitCode {
    pub user_id: String,
    pub email: Option<String>,
    pub return_code: bool,
}

impl Validation for ResendInitCode {
    type Output = Option<String>;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.email = self.email.as_deref().map(normalize_email).transpose()?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ResendInitCode {
    type Output = Option<String>;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<Option<String>>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.initialized {
            return Err(CommandError::precondition("user already initialized"));
        }
        let agg = user_aggregate(env, &user)?;
        let guard = user.guard();
        let mut commands = Vec::new();
        if let Some(email) = self.email.as_ref().filter(|e| **e != user.email.address) {
            let changed = UserEvent::EmailChanged {
                email: email.clone(),
            };
            commands.push(Command::new(agg.clone(), changed).guarded(guard.clone()));
        }
        let code = env.issue_code(SecretGeneratorType::InitCode).await?;
        commands.push(
            Command::new(
                agg,
                UserEvent::InitCodeAdded {
                    code: code.crypted,
                    expiry: code.expiry,
                    code_returned: self.return_code,
                },
            )
            .guarded(guard),
        );
        Ok(Prepared::new(commands, self.return_code.then_some(code.plain)))
    }
}

/// Check an init code. A correct code also verifies the email and, when
/// given, sets the password.
///
/// The code is the credential; no permission check is made.
#[derive(Clone, Default)]
pub struct VerifyInitCode {
    pub user_id: String,
    pub code: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for VerifyInitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyInitCode")
            .field("user_id", &self.user_id)
            .field("password", &self.password.is_some())
            .finish_non_exhaustive()
    }
}

impl Validation for VerifyInitCode {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.code = self.code.trim().to_string();
        require("code", &self.code)?;
        if self.password.as_deref() == Some("") {
            return Err(CommandError::invalid("password must not be empty"));
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for VerifyInitCode {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        if user.initialized {
            return Err(CommandError::precondition("user already initialized"));
        }
        let outcome =
            env.verify_code(user.init_code.as_ref(), user.init_failed_attempts, &self.code)?;
        let mut verified = Vec::new();
        if outcome == VerifyOutcome::Valid {
            verified.push(UserEvent::InitializedCheckSucceeded);
            if !user.email.verified {
                verified.push(UserEvent::EmailVerified);
            }
            if let Some(password) = &self.password {
                let hasher = env.services.password_hasher.as_ref().ok_or_else(|| {
                    CommandError::Internal("no password hasher configured".to_string())
                })?;
                verified.push(UserEvent::PasswordChanged {
                    encoded_hash: hasher.hash(password)?,
                    change_required: false,
                });
            }
        }
        verification_result(
            env,
            &user,
            outcome,
            user.init_failed_attempts,
            verified,
            UserEvent::InitializedCheckFailed,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::commands::test_support::Harness;
    use crate::config::CommandsConfig;
    use crate::event::{AggregateType, EventPayload};
    use crate::preparation::Filter;
    use crate::write_model::{HumanWriteModel, UserState};

    async fn model(h: &Harness, user_id: &str) -> HumanWriteModel {
        Filter::new(h.store.as_ref(), &h.ctx)
            .load(HumanWriteModel::new("inst-1", user_id, ""))
            .await
            .expect("load should succeed")
    }

    async fn init_code(h: &Harness, user_id: &str) -> String {
        h.commands
            .execute(
                &h.ctx,
                ResendInitCode {
                    user_id: user_id.into(),
                    return_code: true,
                    ..ResendInitCode::default()
                },
            )
            .await
            .expect("resend init code should succeed")
            .output
            .expect("code should be returned")
    }

    fn verify(user_id: &str, code: &str) -> VerifyInitCode {
        VerifyInitCode {
            user_id: user_id.into(),
            code: code.into(),
            password: None,
        }
    }

    #[tokio::test]
    async fn init_code_with_password_initializes_user() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let code = init_code(&h, &user_id).await;

        h.commands
            .execute(
                &h.ctx,
                VerifyInitCode {
                    password: Some("correct horse".into()),
                    ..verify(&user_id, &code)
                },
            )
            .await
            .expect("verify init code should succeed");

        let user = model(&h, &user_id).await;
        assert!(user.initialized);
        assert!(user.email.verified);
        assert!(user.password_set);
        let events = h.events_of(AggregateType::User, &user_id).await;
        match &events.last().expect("events").payload {
            EventPayload::User(UserEvent::PasswordChanged { encoded_hash, .. }) => {
                assert_eq!(encoded_hash, "plain$correct horse");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let again = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(matches!(again, Err(CommandError::PreconditionFailed(_))));
        let resend = ResendInitCode {
            user_id,
            ..ResendInitCode::default()
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, resend).await,
            Err(CommandError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn resend_with_new_email_changes_it_first() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        h.commands
            .execute(
                &h.ctx,
                ResendInitCode {
                    user_id: user_id.clone(),
                    email: Some("Ada@Example.com".into()),
                    return_code: false,
                },
            )
            .await
            .expect("resend init code should succeed");

        let types = h.event_types_of(AggregateType::User, &user_id).await;
        assert_eq!(
            types[types.len() - 2..],
            [UserEvent::EMAIL_CHANGED, UserEvent::INIT_CODE_ADDED]
        );
        assert!(model(&h, &user_id).await.init_code.is_some());
    }

    #[tokio::test]
    async fn expired_init_code_is_rejected_without_events() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let code = init_code(&h, &user_id).await;
        let before = h.store.len().await;

        h.clock.advance(TimeDelta::hours(72) + TimeDelta::seconds(1));
        let result = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(
            matches!(result, Err(CommandError::PreconditionFailed(msg)) if msg.contains("expired"))
        );
        assert_eq!(h.store.len().await, before);
    }

    #[tokio::test]
    async fn failed_init_checks_lock_at_ceiling() {
        let h = Harness::with_config(CommandsConfig {
            max_code_attempts: 2,
            ..CommandsConfig::default()
        });
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let code = init_code(&h, &user_id).await;

        for _ in 0..2 {
            let result = h.commands.execute(&h.ctx, verify(&user_id, "WRONG1")).await;
            assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        }
        let user = model(&h, &user_id).await;
        assert_eq!(user.state, UserState::Locked);
        assert_eq!(user.init_failed_attempts, 2);
        assert!(!user.initialized);

        let result = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(matches!(result, Err(CommandError::PreconditionFailed(_))));
    }
}
