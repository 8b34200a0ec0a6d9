//! The macro-phase state machine.
//!
//! `WorkflowPhase` is a closed enum so every decision point is an exhaustive
//! match — adding a phase is a compile-time-checked change. Transitions are
//! planned by the pure `plan_transition` function; the orchestrator executes
//! the returned effects against the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{WorkflowError, WorkflowResult};

/// A macro stage of project execution, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Documentation,
    Operations,
    Procurement,
    Finance,
    Execution,
    Completed,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documentation => "documentation",
            Self::Operations => "operations",
            Self::Procurement => "procurement",
            Self::Finance => "finance",
            Self::Execution => "execution",
            Self::Completed => "completed",
        }
    }

    /// Position in the forward order, used to decide whether a phase has
    /// already been passed.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Documentation => 0,
            Self::Operations => 1,
            Self::Procurement => 2,
            Self::Finance => 3,
            Self::Execution => 4,
            Self::Completed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The department that owns this phase's task list, if any.
    ///
    /// Task reads and completion actions on an owned phase are restricted to
    /// members of the owning department.
    pub fn owning_department(&self) -> Option<&'static str> {
        match self {
            Self::Operations => Some("Operations"),
            Self::Procurement => Some("Procurement"),
            Self::Finance => Some("Finance & Accounting"),
            Self::Documentation | Self::Execution | Self::Completed => None,
        }
    }

    /// The three phases whose task batches are measured for progress
    /// reporting.
    pub fn measured() -> [WorkflowPhase; 3] {
        [Self::Operations, Self::Procurement, Self::Finance]
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "documentation" => Ok(Self::Documentation),
            "operations" => Ok(Self::Operations),
            "procurement" => Ok(Self::Procurement),
            "finance" => Ok(Self::Finance),
            "execution" => Ok(Self::Execution),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid workflow phase: {}", s)),
        }
    }
}

/// One-way flags recording that a phase-advancing event has occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    InventoryCreated,
    ProcurementInitiated,
    FinancialSetup,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InventoryCreated => "inventory_created",
            Self::ProcurementInitiated => "procurement_initiated",
            Self::FinancialSetup => "financial_setup",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The planned effects of completing a phase. Produced by `plan_transition`,
/// executed by the orchestrator: flip the trigger, advance phase/step, append
/// the history entry, generate the next batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseAdvance {
    pub next_phase: WorkflowPhase,
    pub next_step: i64,
    pub trigger: Option<TriggerKind>,
    pub history_action: &'static str,
    pub generate_for: Option<WorkflowPhase>,
}

/// Plan the forward transition out of `current`.
///
/// Pure `(state, step) -> effects`; no I/O. Fails with `InvalidState` for
/// phases with no forward transition.
pub fn plan_transition(current: WorkflowPhase, step: i64) -> WorkflowResult<PhaseAdvance> {
    match current {
        WorkflowPhase::Documentation => Ok(PhaseAdvance {
            next_phase: WorkflowPhase::Operations,
            next_step: 2,
            trigger: Some(TriggerKind::InventoryCreated),
            history_action: "inventory_creation_triggered",
            generate_for: Some(WorkflowPhase::Operations),
        }),
        WorkflowPhase::Operations => Ok(PhaseAdvance {
            next_phase: WorkflowPhase::Procurement,
            next_step: step + 1,
            trigger: Some(TriggerKind::ProcurementInitiated),
            history_action: "procurement_initiated",
            generate_for: Some(WorkflowPhase::Procurement),
        }),
        WorkflowPhase::Procurement => Ok(PhaseAdvance {
            next_phase: WorkflowPhase::Finance,
            next_step: step + 1,
            trigger: Some(TriggerKind::FinancialSetup),
            history_action: "financial_setup_triggered",
            generate_for: Some(WorkflowPhase::Finance),
        }),
        WorkflowPhase::Finance => Ok(PhaseAdvance {
            next_phase: WorkflowPhase::Execution,
            next_step: step + 1,
            trigger: None,
            history_action: "execution_started",
            generate_for: None,
        }),
        WorkflowPhase::Execution | WorkflowPhase::Completed => Err(WorkflowError::InvalidState(
            format!("phase {} has no automatic forward transition", current),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip_via_str() {
        for phase in [
            WorkflowPhase::Documentation,
            WorkflowPhase::Operations,
            WorkflowPhase::Procurement,
            WorkflowPhase::Finance,
            WorkflowPhase::Execution,
            WorkflowPhase::Completed,
        ] {
            assert_eq!(phase.as_str().parse::<WorkflowPhase>().unwrap(), phase);
        }
        assert!("implementation".parse::<WorkflowPhase>().is_err());
    }

    #[test]
    fn test_ordinals_are_forward_ordered() {
        assert!(WorkflowPhase::Documentation.ordinal() < WorkflowPhase::Operations.ordinal());
        assert!(WorkflowPhase::Operations.ordinal() < WorkflowPhase::Procurement.ordinal());
        assert!(WorkflowPhase::Procurement.ordinal() < WorkflowPhase::Finance.ordinal());
        assert!(WorkflowPhase::Finance.ordinal() < WorkflowPhase::Execution.ordinal());
    }

    #[test]
    fn test_owning_departments() {
        assert_eq!(
            WorkflowPhase::Operations.owning_department(),
            Some("Operations")
        );
        assert_eq!(
            WorkflowPhase::Procurement.owning_department(),
            Some("Procurement")
        );
        assert_eq!(
            WorkflowPhase::Finance.owning_department(),
            Some("Finance & Accounting")
        );
        assert_eq!(WorkflowPhase::Documentation.owning_department(), None);
        assert_eq!(WorkflowPhase::Execution.owning_department(), None);
    }

    #[test]
    fn test_documentation_exit_sets_step_two_and_inventory_trigger() {
        let advance = plan_transition(WorkflowPhase::Documentation, 1).unwrap();
        assert_eq!(advance.next_phase, WorkflowPhase::Operations);
        assert_eq!(advance.next_step, 2);
        assert_eq!(advance.trigger, Some(TriggerKind::InventoryCreated));
        assert_eq!(advance.history_action, "inventory_creation_triggered");
        assert_eq!(advance.generate_for, Some(WorkflowPhase::Operations));
    }

    #[test]
    fn test_operations_exit_increments_step() {
        let advance = plan_transition(WorkflowPhase::Operations, 2).unwrap();
        assert_eq!(advance.next_phase, WorkflowPhase::Procurement);
        assert_eq!(advance.next_step, 3);
        assert_eq!(advance.trigger, Some(TriggerKind::ProcurementInitiated));
        assert_eq!(advance.generate_for, Some(WorkflowPhase::Procurement));
    }

    #[test]
    fn test_finance_exit_generates_nothing() {
        let advance = plan_transition(WorkflowPhase::Finance, 4).unwrap();
        assert_eq!(advance.next_phase, WorkflowPhase::Execution);
        assert_eq!(advance.next_step, 5);
        assert_eq!(advance.trigger, None);
        assert!(advance.generate_for.is_none());
    }

    #[test]
    fn test_execution_has_no_forward_transition() {
        assert!(plan_transition(WorkflowPhase::Execution, 5).is_err());
        assert!(plan_transition(WorkflowPhase::Completed, 6).is_err());
    }
}
