//! Seams to the engine's external collaborators.
//!
//! The identity/department directory and the notification sink are owned by
//! other subsystems of the platform; the engine reaches them only through
//! these traits. `StaticDirectory` is a ready in-process implementation for
//! deployments that load the org chart at startup, and for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::WorkflowResult;
use crate::phase::WorkflowPhase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

/// Resolve departments and their members.
///
/// Implementations signal an unreachable backing service with
/// `WorkflowError::DependencyUnavailable`; during task generation that error
/// is fatal and propagates — tasks cannot be created without a valid
/// assignee.
#[async_trait]
pub trait DepartmentDirectory: Send + Sync {
    async fn department_by_name(&self, name: &str) -> WorkflowResult<Option<Department>>;

    /// Active members of a department, in a stable order.
    async fn active_members(&self, department_id: Uuid) -> WorkflowResult<Vec<Member>>;
}

/// Events the engine announces. Delivery is fire-and-forget: a sink failure
/// is logged and swallowed, never blocking the workflow transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    DocumentAwaitingApproval {
        project_id: Uuid,
        document_type: String,
        level: String,
    },
    DocumentApproved {
        project_id: Uuid,
        document_type: String,
    },
    DocumentRejected {
        project_id: Uuid,
        document_type: String,
        level: String,
    },
    PhaseCompleted {
        project_id: Uuid,
        phase: WorkflowPhase,
        next_phase: WorkflowPhase,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: WorkflowEvent) -> anyhow::Result<()>;
}

/// Sink that drops every event. The default when a deployment wires no
/// notification transport.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _event: WorkflowEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-process directory backed by a fixed org chart.
#[derive(Default)]
pub struct StaticDirectory {
    departments: Vec<(Department, Vec<Member>)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a department with its members. Member names are paired with
    /// generated ids; the returned ids are stable for the directory's life.
    pub fn with_department(mut self, name: &str, members: &[(&str, bool)]) -> Self {
        let department = Department {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        let members = members
            .iter()
            .map(|(member_name, is_active)| Member {
                id: Uuid::new_v4(),
                name: member_name.to_string(),
                is_active: *is_active,
            })
            .collect();
        self.departments.push((department, members));
        self
    }
}

#[async_trait]
impl DepartmentDirectory for StaticDirectory {
    async fn department_by_name(&self, name: &str) -> WorkflowResult<Option<Department>> {
        Ok(self
            .departments
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(d, _)| d.clone()))
    }

    async fn active_members(&self, department_id: Uuid) -> WorkflowResult<Vec<Member>> {
        Ok(self
            .departments
            .iter()
            .find(|(d, _)| d.id == department_id)
            .map(|(_, members)| members.iter().filter(|m| m.is_active).cloned().collect())
            .unwrap_or_default())
    }
}
