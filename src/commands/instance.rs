//! Instance-wide secret generator configuration.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::instance::InstanceEvent;
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::{SecretGeneratorConfig, SecretGeneratorType};
use crate::services::permissions;
use crate::write_model::{SecretGeneratorWriteModel, WriteModel};

use super::aggregate;

/// Load the generator model after the instance-wide permission check.
async fn load_generator(
    env: &Env<'_>,
    generator_type: SecretGeneratorType,
) -> Result<SecretGeneratorWriteModel, CommandError> {
    let instance_id = env.filter.instance_id();
    env.check_permission(permissions::IAM_WRITE, instance_id, instance_id)?;
    env.filter
        .load(SecretGeneratorWriteModel::new(instance_id, generator_type))
        .await
}

fn instance_command(env: &Env<'_>, event: InstanceEvent) -> Result<Command, CommandError> {
    let instance_id = env.filter.instance_id();
    Ok(Command::new(
        aggregate(env, AggregateType::Instance, instance_id, instance_id)?,
        event,
    ))
}

/// Configure a secret generator for the instance, overriding the
/// platform default.
#[derive(Debug, Clone)]
pub struct AddSecretGenerator {
    pub generator_type: SecretGeneratorType,
    pub config: SecretGeneratorConfig,
}

impl Validation for AddSecretGenerator {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        self.config.validate()?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for AddSecretGenerator {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let generator = load_generator(env, self.generator_type).await?;
        if generator.exists() {
            return Err(CommandError::already_exists("secret generator already configured"));
        }
        let command = instance_command(
            env,
            InstanceEvent::SecretGeneratorAdded {
                generator_type: self.generator_type,
                config: self.config.clone(),
            },
        )?
        .guarded(generator.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeSecretGenerator {
    pub generator_type: SecretGeneratorType,
    pub config: SecretGeneratorConfig,
}

impl Validation for ChangeSecretGenerator {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        self.config.validate()?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ChangeSecretGenerator {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let generator = load_generator(env, self.generator_type).await?;
        let Some(current) = &generator.config else {
            return Err(CommandError::not_found("secret generator not configured"));
        };
        if *current == self.config {
            return Err(CommandError::precondition("secret generator not changed"));
        }
        let command = instance_command(
            env,
            InstanceEvent::SecretGeneratorChanged {
                generator_type: self.generator_type,
                config: self.config.clone(),
            },
        )?
        .guarded(generator.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Drop the instance configuration; codes fall back to the platform
/// default again.
#[derive(Debug, Clone)]
pub struct RemoveSecretGenerator {
    pub generator_type: SecretGeneratorType,
}

impl Validation for RemoveSecretGenerator {
    type Output = ();
    type Prepared = Self;

    fn validate(self) -> Result<Self, CommandError> {
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for RemoveSecretGenerator {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let generator = load_generator(env, self.generator_type).await?;
        if !generator.exists() {
            return Err(CommandError::not_found("secret generator not configured"));
        }
        let command = instance_command(
            env,
            InstanceEvent::SecretGeneratorRemoved {
                generator_type: self.generator_type,
            },
        )?
        .guarded(generator.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::commands::AddHuman;
    use crate::commands::test_support::{Harness, human};

    fn digits(length: u32) -> SecretGeneratorConfig {
        SecretGeneratorConfig::new(length, Duration::from_secs(600), false, false, true, false)
    }

    #[tokio::test]
    async fn generator_lifecycle() {
        let h = Harness::new();
        let add = AddSecretGenerator {
            generator_type: SecretGeneratorType::VerifyEmailCode,
            config: digits(8),
        };
        h.commands
            .execute(&h.ctx, add.clone())
            .await
            .expect("add should succeed");
        assert!(matches!(
            h.commands.execute(&h.ctx, add).await,
            Err(CommandError::AlreadyExists(_))
        ));

        let same = ChangeSecretGenerator {
            generator_type: SecretGeneratorType::VerifyEmailCode,
            config: digits(8),
        };
        assert!(matches!(
            h.commands.execute(&h.ctx, same).await,
            Err(CommandError::PreconditionFailed(_))
        ));

        let remove = RemoveSecretGenerator {
            generator_type: SecretGeneratorType::VerifyEmailCode,
        };
        h.commands
            .execute(&h.ctx, remove.clone())
            .await
            .expect("remove should succeed");
        assert!(matches!(
            h.commands.execute(&h.ctx, remove).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn instance_generator_shapes_issued_codes() {
        let h = Harness::new();
        h.commands
            .execute(
                &h.ctx,
                AddSecretGenerator {
                    generator_type: SecretGeneratorType::VerifyEmailCode,
                    config: digits(8),
                },
            )
            .await
            .expect("add should succeed");
        let org = h.add_org("Acme").await;
        let cmd = AddHuman {
            return_email_code: true,
            ..human(&org, "ada")
        };
        let code = h
            .commands
            .execute(&h.ctx, cmd)
            .await
            .expect("add human should succeed")
            .output
            .email_code
            .expect("code should be returned");
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn invalid_config_fails_validation() {
        let add = AddSecretGenerator {
            generator_type: SecretGeneratorType::OtpSms,
            config: SecretGeneratorConfig::new(0, Duration::ZERO, false, false, true, false),
        };
        assert!(matches!(add.validate(), Err(CommandError::InvalidArgument(_))));
    }
}
