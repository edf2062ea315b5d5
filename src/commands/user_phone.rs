//! Phone change, verification and removal.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::SecretGeneratorType;
use crate::services::permissions;
use crate::write_model::WriteModel;

use super::require;
use super::user::{canonical_phone, load_user, user_aggregate, verification_result};

/// Set or change the phone of a user. Outputs the new code if
/// `return_code` is set and the number is not marked verified.
#[derive(Debug, Clone, Default)]
pub struct ChangePhone {
    pub user_id: String,
    pub phone: String,
    pub verified: bool,
    pub return_code: bool,
}

impl Validation for ChangePhone {
    type Output = Option<String>;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.phone = canonical_phone(&self.phone)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangePhone {
    type Output = Option<String>;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<Option<String>>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        let unchanged = user
            .phone
            .as_ref()
            .is_some_and(|p| p.address == self.phone && (p.verified || !self.verified));
        if unchanged {
            return Err(CommandError::precondition("phone not changed"));
        }
        let agg = user_aggregate(env, &user)?;
        let guard = user.guard();
        let mut commands = Vec::with_capacity(2);
        if user.phone.as_ref().is_none_or(|p| p.address != self.phone) {
            commands.push(
                Command::new(
                    agg.clone(),
                    UserEvent::PhoneChanged {
                        phone: self.phone.clone(),
                    },
                )
                .guarded(guard.clone()),
            );
        }
        if self.verified {
            commands.push(Command::new(agg, UserEvent::PhoneVerified).guarded(guard));
            return Ok(Prepared::new(commands, None));
        }
        let code = env.issue_code(SecretGeneratorType::VerifyPhoneCode).await?;
        commands.push(
            Command::new(
                agg,
                UserEvent::PhoneCodeAdded {
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

/// Check a phone verification code.
#[derive(Debug, Clone, Default)]
pub struct VerifyPhone {
    pub user_id: String,
    pub code: String,
}

impl Validation for VerifyPhone {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.code = self.code.trim().to_string();
        require("code", &self.code)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for VerifyPhone {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        let Some(phone) = &user.phone else {
            return Err(CommandError::not_found("phone not found"));
        };
        if phone.verified {
            return Err(CommandError::precondition("phone already verified"));
        }
        let outcome = env.verify_code(phone.code.as_ref(), phone.failed_attempts, &self.code)?;
        verification_result(
            env,
            &user,
            outcome,
            phone.failed_attempts,
            vec![UserEvent::PhoneVerified],
            UserEvent::PhoneVerificationFailed,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemovePhone {
    pub user_id: String,
}

impl Validation for RemovePhone {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemovePhone {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.phone.is_none() {
            return Err(CommandError::not_found("phone not found"));
        }
        let command = Command::new(user_aggregate(env, &user)?, UserEvent::PhoneRemoved)
            .guarded(user.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::Harness;

    fn change(user_id: &str, phone: &str) -> ChangePhone {
        ChangePhone {
            user_id: user_id.into(),
            phone: phone.into(),
            return_code: true,
            ..ChangePhone::default()
        }
    }

    #[tokio::test]
    async fn phone_lifecycle() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;

        assert!(matches!(
            h.commands
                .execute(
                    &h.ctx,
                    VerifyPhone {
                        user_id: user_id.clone(),
                        code: "123456".into(),
                    },
                )
                .await,
            Err(CommandError::NotFound(_))
        ));

        let code = h
            .commands
            .execute(&h.ctx, change(&user_id, "+41 79 123 45 67"))
            .await
            .expect("change should succeed")
            .output
            .expect("code should be returned");

        // same number, different formatting
        assert!(matches!(
            h.commands.execute(&h.ctx, change(&user_id, "0041791234567")).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        h.commands
            .execute(
                &h.ctx,
                VerifyPhone {
                    user_id: user_id.clone(),
                    code,
                },
            )
            .await
            .expect("verify should succeed");

        h.commands
            .execute(
                &h.ctx,
                RemovePhone {
                    user_id: user_id.clone(),
                },
            )
            .await
            .expect("remove should succeed");
        assert!(matches!(
            h.commands.execute(&h.ctx, RemovePhone { user_id }).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wrong_phone_code_is_rejected_after_push() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        h.commands
            .execute(&h.ctx, change(&user_id, "+41791234567"))
            .await
            .expect("change should succeed");
        let before = h.store.len().await;
        let result = h
            .commands
            .execute(
                &h.ctx,
                VerifyPhone {
                    user_id,
                    code: "nope".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        assert_eq!(h.store.len().await, before + 1);
    }
}
