//! Password reset with a one-time code.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::{SecretGeneratorType, VerifyOutcome};
use crate::services::permissions;
use crate::write_model::WriteModel;

use super::require;
use super::user::{load_user, user_aggregate, verification_result};

/// Issue a password reset code. Outputs the code if `return_code` is set;
/// otherwise it is only delivered through the event.
#[derive(Debug, Clone, Default)]
pub struct RequestPasswordReset {
    pub user_id: String,
    pub return_code: bool,
}

impl Validation for RequestPasswordReset {
    type Output = Option<String>;
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RequestPasswordReset {
    type Output = Option<String>;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<Option<String>>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(
            permissions::USER_CREDENTIAL_WRITE,
            user.resource_owner(),
            &self.user_id,
        )?;
        let code = env.issue_code(SecretGeneratorType::PasswordResetCode).await?;
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::PasswordCodeAdded {
                code: code.crypted,
                expiry: code.expiry,
                code_returned: self.return_code,
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], self.return_code.then_some(code.plain)))
    }
}

/// Set a new password with a reset code.
///
/// The code is the credential; no permission check is made.
#[derive(Clone, Default)]
pub struct SetPasswordWithCode {
    pub user_id: String,
    pub code: String,
    pub password: String,
}

impl std::fmt::Debug for SetPasswordWithCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetPasswordWithCode")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Validation for SetPasswordWithCode {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.code = self.code.trim().to_string();
        require("code", &self.code)?;
        if self.password.is_empty() {
            return Err(CommandError::invalid("password must not be empty"));
        }
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for SetPasswordWithCode {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let hasher = env
            .services
            .password_hasher
            .as_ref()
            .ok_or_else(|| CommandError::Internal("no password hasher configured".to_string()))?;
        let user = load_user(env, &self.user_id).await?;
        let outcome = env.verify_code(
            user.password_code.as_ref(),
            user.password_failed_attempts,
            &self.code,
        )?;
        // Hash only once the code is known to be good.
        let mut verified = Vec::new();
        if outcome == VerifyOutcome::Valid {
            verified.push(UserEvent::PasswordChanged {
                encoded_hash: hasher.hash(&self.password)?,
                change_required: false,
            });
        }
        verification_result(
            env,
            &user,
            outcome,
            user.password_failed_attempts,
            verified,
            UserEvent::PasswordCodeCheckFailed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::Harness;
    use crate::event::{AggregateType, EventPayload};

    async fn reset_code(h: &Harness, user_id: &str) -> String {
        h.commands
            .execute(
                &h.ctx,
                RequestPasswordReset {
                    user_id: user_id.into(),
                    return_code: true,
                },
            )
            .await
            .expect("reset request should succeed")
            .output
            .expect("code should be returned")
    }

    #[tokio::test]
    async fn reset_with_code_sets_hash() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let code = reset_code(&h, &user_id).await;

        h.commands
            .execute(
                &h.ctx,
                SetPasswordWithCode {
                    user_id: user_id.clone(),
                    code: code.clone(),
                    password: "correct horse".into(),
                },
            )
            .await
            .expect("set password should succeed");

        let events = h.events_of(AggregateType::User, &user_id).await;
        match &events.last().expect("events").payload {
            EventPayload::User(UserEvent::PasswordChanged { encoded_hash, .. }) => {
                assert_eq!(encoded_hash, "plain$correct horse");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let replay = h
            .commands
            .execute(
                &h.ctx,
                SetPasswordWithCode {
                    user_id,
                    code,
                    password: "again".into(),
                },
            )
            .await;
        assert!(matches!(replay, Err(CommandError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn wrong_reset_code_records_check_failure() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        reset_code(&h, &user_id).await;

        let result = h
            .commands
            .execute(
                &h.ctx,
                SetPasswordWithCode {
                    user_id: user_id.clone(),
                    code: "WRONG1".into(),
                    password: "pw".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        assert_eq!(
            h.event_types_of(AggregateType::User, &user_id).await.last().map(String::as_str),
            Some(UserEvent::PASSWORD_CODE_CHECK_FAILED)
        );
    }

    #[test]
    fn debug_hides_secrets() {
        let cmd = SetPasswordWithCode {
            user_id: "u-1".into(),
            code: "ABC123".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{cmd:?}");
        assert!(rendered.contains("u-1"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("ABC123"));
    }
}
