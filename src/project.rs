//! Project-side workflow state: the trigger record, the approval chain
//! definition, and the append-only history entry shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::phase::{TriggerKind, WorkflowPhase};

/// One step in a project's ordered chain of required sign-offs.
///
/// The chain is defined once per project and shared by every required
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    /// Level identifier, e.g. "hod", "finance", "executive".
    pub level: String,
    /// Department responsible for this sign-off.
    pub department: String,
    /// Designated approver, if the level is pinned to one person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<Uuid>,
}

/// Fixed record of one-way booleans. Each flag flips exactly once, from
/// false to true; there is no API to reset one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTriggers {
    pub inventory_created: bool,
    pub procurement_initiated: bool,
    pub financial_setup: bool,
}

impl WorkflowTriggers {
    pub fn is_set(&self, trigger: TriggerKind) -> bool {
        match trigger {
            TriggerKind::InventoryCreated => self.inventory_created,
            TriggerKind::ProcurementInitiated => self.procurement_initiated,
            TriggerKind::FinancialSetup => self.financial_setup,
        }
    }

    /// Flip a trigger. Returns `false` when the flag was already set — an
    /// idempotent no-op, not an error, to tolerate retries after partial
    /// failures.
    pub fn set(&mut self, trigger: TriggerKind) -> bool {
        let flag = match trigger {
            TriggerKind::InventoryCreated => &mut self.inventory_created,
            TriggerKind::ProcurementInitiated => &mut self.procurement_initiated,
            TriggerKind::FinancialSetup => &mut self.financial_setup,
        };
        if *flag {
            false
        } else {
            *flag = true;
            true
        }
    }
}

/// The engine-owned workflow slice of a project. The rest of the project
/// entity (client, budget, presentation fields) lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectWorkflow {
    pub id: Uuid,
    pub name: String,
    pub workflow_phase: WorkflowPhase,
    /// Coarse transition counter. Monotonically increasing, never decreases.
    pub workflow_step: i64,
    pub triggers: WorkflowTriggers,
    pub approval_chain: Vec<ApprovalLevel>,
    /// Document types that must be submitted and approved before the
    /// documentation phase can exit.
    pub required_documents: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every phase/trigger write.
    pub record_version: i64,
}

impl ProjectWorkflow {
    /// Create a new project workflow in the documentation phase.
    ///
    /// Fails with `Validation` on an empty approval chain, duplicate chain
    /// level ids, or duplicate required document types — a project with a
    /// malformed chain would strand every submitted document.
    pub fn new(
        name: &str,
        approval_chain: Vec<ApprovalLevel>,
        required_documents: Vec<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Self> {
        if approval_chain.is_empty() {
            return Err(WorkflowError::Validation(
                "approval chain must have at least one level".into(),
            ));
        }
        for (i, level) in approval_chain.iter().enumerate() {
            if level.level.trim().is_empty() || level.department.trim().is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "approval chain level {} is missing a level id or department",
                    i
                )));
            }
            if approval_chain[..i].iter().any(|l| l.level == level.level) {
                return Err(WorkflowError::Validation(format!(
                    "duplicate approval chain level '{}'",
                    level.level
                )));
            }
        }
        for (i, doc) in required_documents.iter().enumerate() {
            if doc.trim().is_empty() {
                return Err(WorkflowError::Validation(
                    "required document type must not be empty".into(),
                ));
            }
            if required_documents[..i].contains(doc) {
                return Err(WorkflowError::Validation(format!(
                    "duplicate required document type '{}'",
                    doc
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            workflow_phase: WorkflowPhase::Documentation,
            workflow_step: 1,
            triggers: WorkflowTriggers::default(),
            approval_chain,
            required_documents,
            created_at: now,
            record_version: 0,
        })
    }
}

/// One append-only audit entry. Entries are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub project_id: Uuid,
    pub phase: WorkflowPhase,
    pub action: String,
    pub triggered_by: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        project_id: Uuid,
        phase: WorkflowPhase,
        action: &str,
        triggered_by: &str,
        metadata: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            project_id,
            phase,
            action: action.to_string(),
            triggered_by: triggered_by.to_string(),
            metadata,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<ApprovalLevel> {
        vec![
            ApprovalLevel {
                level: "hod".into(),
                department: "Operations".into(),
                approver: None,
            },
            ApprovalLevel {
                level: "finance".into(),
                department: "Finance & Accounting".into(),
                approver: None,
            },
        ]
    }

    #[test]
    fn test_triggers_flip_once() {
        let mut triggers = WorkflowTriggers::default();
        assert!(!triggers.is_set(TriggerKind::InventoryCreated));

        assert!(triggers.set(TriggerKind::InventoryCreated));
        assert!(triggers.is_set(TriggerKind::InventoryCreated));

        // Second flip is a no-op, not an error.
        assert!(!triggers.set(TriggerKind::InventoryCreated));
        assert!(triggers.is_set(TriggerKind::InventoryCreated));

        assert!(!triggers.is_set(TriggerKind::ProcurementInitiated));
        assert!(!triggers.is_set(TriggerKind::FinancialSetup));
    }

    #[test]
    fn test_new_project_starts_in_documentation() {
        let project =
            ProjectWorkflow::new("Plant expansion", chain(), vec!["boq".into()], Utc::now())
                .unwrap();
        assert_eq!(project.workflow_phase, WorkflowPhase::Documentation);
        assert_eq!(project.workflow_step, 1);
        assert_eq!(project.triggers, WorkflowTriggers::default());
        assert_eq!(project.record_version, 0);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let err = ProjectWorkflow::new("P", vec![], vec![], Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_duplicate_chain_level_rejected() {
        let mut levels = chain();
        levels[1].level = "hod".into();
        let err = ProjectWorkflow::new("P", levels, vec![], Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_duplicate_required_document_rejected() {
        let err = ProjectWorkflow::new(
            "P",
            chain(),
            vec!["boq".into(), "boq".into()],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
