//! Events recorded on `instance` aggregates.
//!
//! Only tenant-wide configuration lives here; generator settings are read
//! back through the same filter as any other state.

use serde::{Deserialize, Serialize};

use crate::secret::{SecretGeneratorConfig, SecretGeneratorType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InstanceEvent {
    #[serde(rename = "instance.secret.generator.added")]
    SecretGeneratorAdded {
        generator_type: SecretGeneratorType,
        config: SecretGeneratorConfig,
    },
    #[serde(rename = "instance.secret.generator.changed")]
    SecretGeneratorChanged {
        generator_type: SecretGeneratorType,
        config: SecretGeneratorConfig,
    },
    #[serde(rename = "instance.secret.generator.removed")]
    SecretGeneratorRemoved { generator_type: SecretGeneratorType },
}

impl InstanceEvent {
    pub const SECRET_GENERATOR_ADDED: &'static str = "instance.secret.generator.added";
    pub const SECRET_GENERATOR_CHANGED: &'static str = "instance.secret.generator.changed";
    pub const SECRET_GENERATOR_REMOVED: &'static str = "instance.secret.generator.removed";

    pub fn event_type(&self) -> &'static str {
        match self {
            InstanceEvent::SecretGeneratorAdded { .. } => Self::SECRET_GENERATOR_ADDED,
            InstanceEvent::SecretGeneratorChanged { .. } => Self::SECRET_GENERATOR_CHANGED,
            InstanceEvent::SecretGeneratorRemoved { .. } => Self::SECRET_GENERATOR_REMOVED,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            InstanceEvent::SecretGeneratorAdded { config, .. }
            | InstanceEvent::SecretGeneratorChanged { config, .. } => {
                config.validate().map_err(|e| e.to_string())
            }
            InstanceEvent::SecretGeneratorRemoved { .. } => Ok(()),
        }
    }
}
