//! Email change and verification.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::payload::user::UserEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::SecretGeneratorType;
use crate::services::permissions;
use crate::write_model::WriteModel;

use super::require;
use super::user::{load_user, normalize_email, user_aggregate, verification_result};

/// Change the email of a user. Outputs the new code if `return_code` is
/// set and the address is not marked verified.
#[derive(Debug, Clone, Default)]
pub struct ChangeEmail {
    pub user_id: String,
    pub email: String,
    pub verified: bool,
    pub return_code: bool,
}

impl Validation for ChangeEmail {
    type Output = Option<String>;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        self.email = normalize_email(&self.email)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeEmail {
    type Output = Option<String>;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<Option<String>>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.email.address == self.email && (user.email.verified || !self.verified) {
            return Err(CommandError::precondition("email not changed"));
        }
        let agg = user_aggregate(env, &user)?;
        let guard = user.guard();
        let mut commands = Vec::with_capacity(2);
        if user.email.address != self.email {
            commands.push(
                Command::new(
                    agg.clone(),
                    UserEvent::EmailChanged {
                        email: self.email.clone(),
                    },
                )
                .guarded(guard.clone()),
            );
        }
        if self.verified {
            commands.push(Command::new(agg, UserEvent::EmailVerified).guarded(guard));
            return Ok(Prepared::new(commands, None));
        }
        let code = env.issue_code(SecretGeneratorType::VerifyEmailCode).await?;
        commands.push(
            Command::new(
                agg,
                UserEvent::EmailCodeAdded {
                    code: code.crypted,
                    expiry: code.expiry,
                    code_returned: self.return_code,
                },
            )
            .guarded(guard),
        );
        let output = self.return_code.then_some(code.plain);
        Ok(Prepared::new(commands, output))
    }
}

/// Replace the pending email code with a fresh one.
#[derive(Debug, Clone, Default)]
pub struct ResendEmailCode {
    pub user_id: String,
    pub return_code: bool,
}

impl Validation for ResendEmailCode {
    type Output = Option<String>;
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        require("user_id", &self.user_id)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ResendEmailCode {
    type Output = Option<String>;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<Option<String>>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.email.verified {
            return Err(CommandError::precondition("email already verified"));
        }
        if user.email.code.is_none() {
            return Err(CommandError::precondition("no code pending"));
        }
        let code = env.issue_code(SecretGeneratorType::VerifyEmailCode).await?;
        let command = Command::new(
            user_aggregate(env, &user)?,
            UserEvent::EmailCodeAdded {
                code: code.crypted,
                expiry: code.expiry,
                code_returned: self.return_code,
            },
        )
        .guarded(user.guard());
        Ok(Prepared::new(vec![command], self.return_code.then_some(code.plain)))
    }
}

/// Check an email verification code.
#[derive(Debug, Clone, Default)]
pub struct VerifyEmail {
    pub user_id: String,
    pub code: String,
}

impl Validation for VerifyEmail {
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
impl CreateCommands for VerifyEmail {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let user = load_user(env, &self.user_id).await?;
        env.check_user_permission(permissions::USER_WRITE, user.resource_owner(), &self.user_id)?;
        if user.email.verified {
            return Err(CommandError::precondition("email already verified"));
        }
        let outcome = env.verify_code(
            user.email.code.as_ref(),
            user.email.failed_attempts,
            &self.code,
        )?;
        verification_result(
            env,
            &user,
            outcome,
            user.email.failed_attempts,
            vec![UserEvent::EmailVerified],
            UserEvent::EmailVerificationFailed,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::commands::AddHuman;
    use crate::commands::test_support::{Harness, human};
    use crate::config::CommandsConfig;
    use crate::event::AggregateType;
    use crate::services::Clock;
    use crate::write_model::{HumanWriteModel, UserState};

    async fn user_with_code(h: &Harness) -> (String, String) {
        let org = h.add_org("Acme").await;
        let cmd = AddHuman {
            return_email_code: true,
            ..human(&org, "ada")
        };
        let added = h
            .commands
            .execute(&h.ctx, cmd)
            .await
            .expect("add human should succeed")
            .output;
        let code = added.email_code.expect("code should be returned");
        (added.user_id, code)
    }

    async fn model(h: &Harness, user_id: &str) -> HumanWriteModel {
        let ctx = h.ctx.clone();
        let filter = crate::preparation::Filter::new(h.store.as_ref(), &ctx);
        filter
            .load(HumanWriteModel::new("inst-1", user_id, ""))
            .await
            .expect("load should succeed")
    }

    fn verify(user_id: &str, code: &str) -> VerifyEmail {
        VerifyEmail {
            user_id: user_id.into(),
            code: code.into(),
        }
    }

    #[tokio::test]
    async fn wrong_code_records_failure_and_rejects() {
        let h = Harness::new();
        let (user_id, _) = user_with_code(&h).await;

        let result = h.commands.execute(&h.ctx, verify(&user_id, "WRONG1")).await;
        assert!(matches!(result, Err(CommandError::InvalidArgument(_))));

        let user = model(&h, &user_id).await;
        assert_eq!(user.email.failed_attempts, 1);
        assert!(!user.email.verified);
        assert_eq!(
            h.event_types_of(AggregateType::User, &user_id).await.last().map(String::as_str),
            Some(UserEvent::EMAIL_VERIFICATION_FAILED)
        );
    }

    #[tokio::test]
    async fn correct_code_verifies_once() {
        let h = Harness::new();
        let (user_id, code) = user_with_code(&h).await;

        h.commands
            .execute(&h.ctx, verify(&user_id, &code))
            .await
            .expect("verify should succeed");
        assert!(model(&h, &user_id).await.email.verified);

        let replay = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(matches!(replay, Err(CommandError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn expired_code_is_rejected_without_events() {
        let h = Harness::new();
        let (user_id, code) = user_with_code(&h).await;
        let before = h.store.len().await;

        h.clock.advance(TimeDelta::hours(1) + TimeDelta::seconds(1));
        let result = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(
            matches!(result, Err(CommandError::PreconditionFailed(msg)) if msg.contains("expired"))
        );
        assert_eq!(h.store.len().await, before);
    }

    #[tokio::test]
    async fn ceiling_locks_the_user() {
        let h = Harness::with_config(CommandsConfig {
            max_code_attempts: 3,
            ..CommandsConfig::default()
        });
        let (user_id, code) = user_with_code(&h).await;

        for _ in 0..3 {
            let result = h.commands.execute(&h.ctx, verify(&user_id, "WRONG1")).await;
            assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        }
        let user = model(&h, &user_id).await;
        assert_eq!(user.state, UserState::Locked);
        assert_eq!(user.email.failed_attempts, 3);

        let result = h.commands.execute(&h.ctx, verify(&user_id, &code)).await;
        assert!(matches!(result, Err(CommandError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn change_email_noop_and_resend() {
        let h = Harness::new();
        let (user_id, _) = user_with_code(&h).await;

        let same = ChangeEmail {
            user_id: user_id.clone(),
            email: " a@b.com ".into(),
            ..ChangeEmail::default()
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, same).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        let resent = h
            .commands
            .execute(
                &h.ctx,
                ResendEmailCode {
                    user_id: user_id.clone(),
                    return_code: true,
                },
            )
            .await
            .expect("resend should succeed")
            .output
            .expect("code should be returned");
        h.commands
            .execute(&h.ctx, verify(&user_id, &resent))
            .await
            .expect("resent code should verify");

        assert!(matches!(
            h.commands
                .execute(
                    &h.ctx,
                    ResendEmailCode {
                        user_id: user_id.clone(),
                        return_code: false,
                    },
                )
                .await,
            Err(CommandError::PreconditionFailed(_))
        ));

        let changed = h
            .commands
            .execute(
                &h.ctx,
                ChangeEmail {
                    user_id: user_id.clone(),
                    email: "ada@example.org".into(),
                    return_code: true,
                    ..ChangeEmail::default()
                },
            )
            .await
            .expect("change should succeed");
        assert!(changed.output.is_some());
        let user = model(&h, &user_id).await;
        assert_eq!(user.email.address, "ada@example.org");
        assert!(!user.email.verified);
    }

    #[tokio::test]
    async fn change_email_to_verified_skips_code() {
        let h = Harness::new();
        let org = h.add_org("Acme").await;
        let user_id = h.add_user(&org, "ada").await;
        let outcome = h
            .commands
            .execute(
                &h.ctx,
                ChangeEmail {
                    user_id: user_id.clone(),
                    email: "ada@example.org".into(),
                    verified: true,
                    return_code: true,
                },
            )
            .await
            .expect("change should succeed");
        assert_eq!(outcome.output, None);
        let types = h.event_types_of(AggregateType::User, &user_id).await;
        assert_eq!(
            &types[types.len() - 2..],
            &[UserEvent::EMAIL_CHANGED, UserEvent::EMAIL_VERIFIED]
        );
    }

    #[tokio::test]
    async fn expiry_follows_the_command_clock_not_the_store_clock() {
        use std::sync::Arc;

        use crate::command::CommandContext;
        use crate::commands::{AddOrg, Commands};
        use crate::eventstore::{EventStore, InMemoryEventStore, QueryClause, SearchQuery};
        use crate::testing::{FixedClock, SequentialIds, test_encryption};

        // The store stamps with the wall clock; commands run years earlier.
        let clock = Arc::new(FixedClock::epoch());
        let store = Arc::new(InMemoryEventStore::new());
        let commands = Commands::builder()
            .event_store(store.clone())
            .id_generator(Arc::new(SequentialIds::new("id")))
            .clock(clock.clone())
            .code_encryption(Arc::new(test_encryption().expect("key should be accepted")))
            .build()
            .expect("builder should succeed");
        let ctx = CommandContext::new("inst-1").with_actor("admin");
        let org = commands
            .execute(
                &ctx,
                AddOrg {
                    name: "Acme".into(),
                    ..AddOrg::default()
                },
            )
            .await
            .expect("add org should succeed")
            .output;
        let added = commands
            .execute(
                &ctx,
                AddHuman {
                    return_email_code: true,
                    ..human(&org, "ada")
                },
            )
            .await
            .expect("add human should succeed")
            .output;
        let code = added.email_code.expect("code should be returned");

        let events = store
            .filter(
                &ctx,
                &SearchQuery::new("inst-1").clause(
                    QueryClause::new(AggregateType::User).aggregate_id(added.user_id.as_str()),
                ),
            )
            .await
            .expect("filter should succeed");
        assert!(events.iter().all(|e| e.created_at == clock.now()));

        clock.advance(TimeDelta::hours(2));
        let result = commands.execute(&ctx, verify(&added.user_id, &code)).await;
        assert!(
            matches!(result, Err(CommandError::PreconditionFailed(msg)) if msg.contains("expired"))
        );
    }
}
