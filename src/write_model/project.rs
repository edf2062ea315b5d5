//! Project write model.

use crate::event::{AggregateType, Event, EventPayload};
use crate::eventstore::{QueryClause, SearchQuery};
use crate::payload::project::ProjectEvent;

use super::{ModelBase, WriteModel};

#[derive(Debug, Clone)]
pub struct ProjectWriteModel {
    base: ModelBase,
    pub name: String,
    exists: bool,
}

impl ProjectWriteModel {
    pub fn new(
        instance_id: impl Into<String>,
        project_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            base: ModelBase::new(instance_id, AggregateType::Project, project_id, resource_owner),
            name: String::new(),
            exists: false,
        }
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn resource_owner(&self) -> &str {
        &self.base.resource_owner
    }
}

impl WriteModel for ProjectWriteModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn query(&self) -> SearchQuery {
        self.base.search_query().clause(
            QueryClause::new(AggregateType::Project)
                .aggregate_id(self.base.aggregate_id.clone())
                .event_types(&[ProjectEvent::ADDED, ProjectEvent::REMOVED]),
        )
    }

    fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::Project(ProjectEvent::Added { name }) => {
                self.name = name.clone();
                self.exists = true;
            }
            EventPayload::Project(ProjectEvent::Removed { .. }) => self.exists = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_model::test_support::event;

    #[test]
    fn project_lifecycle() {
        let mut model = ProjectWriteModel::new("inst-1", "p-1", "org-1");
        model.append_events(&[event(
            AggregateType::Project,
            "p-1",
            "org-1",
            1,
            ProjectEvent::Added {
                name: "portal".into(),
            },
        )]);
        model.reduce().expect("reduce should succeed");
        assert!(model.exists());
        assert_eq!(model.name, "portal");

        model.append_events(&[event(
            AggregateType::Project,
            "p-1",
            "org-1",
            2,
            ProjectEvent::Removed {
                name: "portal".into(),
            },
        )]);
        model.reduce().expect("reduce should succeed");
        assert!(!model.exists());
        assert_eq!(model.guard().expected, 2);
    }
}
