//! Runtime configuration for the command layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::secret::{SecretGeneratorConfig, SecretGeneratorType};

/// Default number of times the whole pipeline is retried after a
/// sequence conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 1;

/// Default number of consecutive failed code checks before the owning user
/// is locked.
pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 5;

/// Tunables for [`Commands`](crate::Commands).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use eventfold_iam::CommandsConfig;
///
/// let config: CommandsConfig =
///     serde_json::from_str(r#"{"max_code_attempts": 3}"#).expect("valid config");
/// assert_eq!(config.max_code_attempts, 3);
/// assert_eq!(config.max_conflict_retries, 1);
/// assert!(config.validate_org_domains);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Pipeline restarts after a sequence conflict before giving up.
    pub max_conflict_retries: u32,
    /// Failure ceiling for code verification; zero disables locking.
    pub max_code_attempts: u32,
    /// Whether newly added org domains must be verified explicitly.
    pub validate_org_domains: bool,
    /// Platform-wide overrides of the built-in generator defaults. Instance
    /// configuration in the event log still takes precedence.
    pub secret_generators: HashMap<SecretGeneratorType, SecretGeneratorConfig>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
            validate_org_domains: true,
            secret_generators: HashMap::new(),
        }
    }
}

impl CommandsConfig {
    /// Fallback generator configuration for `generator_type`.
    pub fn generator_default(&self, generator_type: SecretGeneratorType) -> SecretGeneratorConfig {
        self.secret_generators
            .get(&generator_type)
            .cloned()
            .unwrap_or_else(|| generator_type.default_config())
    }

    /// Check every generator override.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidArgument`] naming the first override
    /// that cannot produce a secret.
    pub fn validate(&self) -> Result<(), CommandError> {
        let mut overrides: Vec<_> = self.secret_generators.iter().collect();
        overrides.sort_by_key(|(generator_type, _)| **generator_type);
        for (generator_type, config) in overrides {
            config.validate().map_err(|err| match err {
                CommandError::InvalidArgument(msg) => {
                    CommandError::invalid(format!("generator {generator_type:?}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn overrides_take_precedence_over_builtin_defaults() {
        let mut config = CommandsConfig::default();
        let custom =
            SecretGeneratorConfig::new(4, Duration::from_secs(30), false, false, true, false);
        config
            .secret_generators
            .insert(SecretGeneratorType::VerifyEmailCode, custom.clone());

        assert_eq!(
            config.generator_default(SecretGeneratorType::VerifyEmailCode),
            custom
        );
        assert_eq!(
            config.generator_default(SecretGeneratorType::OtpSms),
            SecretGeneratorType::OtpSms.default_config()
        );
    }

    #[test]
    fn unusable_override_fails_validation() {
        assert!(CommandsConfig::default().validate().is_ok());

        let mut config = CommandsConfig::default();
        config.secret_generators.insert(
            SecretGeneratorType::InitCode,
            SecretGeneratorConfig::new(0, Duration::from_secs(60), false, true, true, false),
        );
        let err = config.validate().expect_err("zero length should be rejected");
        assert!(matches!(&err, CommandError::InvalidArgument(msg) if msg.contains("InitCode")));
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = CommandsConfig {
            max_conflict_retries: 3,
            ..CommandsConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize should succeed");
        let back: CommandsConfig = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, config);
    }
}
