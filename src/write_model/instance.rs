//! Instance-level write models.

use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::{QueryClause, SearchQuery};
use crate::payload::instance::InstanceEvent;
use crate::secret::{SecretGeneratorConfig, SecretGeneratorType};

use super::{ModelBase, WriteModel};

/// Instance-level configuration of one secret generator.
#[derive(Debug, Clone)]
pub struct SecretGeneratorWriteModel {
    base: ModelBase,
    pub generator_type: SecretGeneratorType,
    /// `None` if the instance never configured this generator or removed it.
    pub config: Option<SecretGeneratorConfig>,
}

impl SecretGeneratorWriteModel {
    pub fn new(instance_id: impl Into<String>, generator_type: SecretGeneratorType) -> Self {
        let instance_id = instance_id.into();
        Self {
            base: ModelBase::new(
                instance_id.clone(),
                AggregateType::Instance,
                instance_id.clone(),
                instance_id,
            ),
            generator_type,
            config: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.config.is_some()
    }
}

impl WriteModel for SecretGeneratorWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Instance)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(&[
                    InstanceEvent::SECRET_GENERATOR_ADDED,
                    InstanceEvent::SECRET_GENERATOR_CHANGED,
                    InstanceEvent::SECRET_GENERATOR_REMOVED,
                ]),
        )
    }

    fn apply(&mut self, event: &Event) {
        let EventPayload::Instance(payload) = &event.payload else {
            return;
        };
        match payload {
            InstanceEvent::SecretGeneratorAdded {
                generator_type,
                config,
            }
            | InstanceEvent::SecretGeneratorChanged {
                generator_type,
                config,
            } if *generator_type == self.generator_type => self.config = Some(config.clone()),
            InstanceEvent::SecretGeneratorRemoved { generator_type }
                if *generator_type == self.generator_type =>
            {
                self.config = None
            }
            _ => {}
        }
    }
}
