//! Typed error hierarchy for the workflow engine.
//!
//! One enum covers the whole taxonomy the engine's callers match on:
//! not-found classes carry the missing identifier, state-machine refusals
//! carry the offending transition, and `PhaseIncomplete` carries the full
//! list of blocking task ids so callers can render actionable detail.

use thiserror::Error;
use uuid::Uuid;

use crate::phase::WorkflowPhase;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Document '{document_type}' not found on project {project_id}")]
    DocumentNotFound {
        project_id: Uuid,
        document_type: String,
    },

    #[error(
        "Access denied: department '{department}' may not act on {phase} (requires '{required}')"
    )]
    AccessDenied {
        department: String,
        required: String,
        phase: WorkflowPhase,
    },

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Phase {phase} has {count} incomplete task(s)", count = pending.len())]
    PhaseIncomplete {
        phase: WorkflowPhase,
        pending: Vec<Uuid>,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    #[error("Department '{name}' not found")]
    DepartmentNotFound { name: String },

    #[error("Department '{department}' has no active members to assign")]
    NoEligibleAssignee { department: String },

    #[error("Dependency '{dependency}' unavailable: {source}")]
    DependencyUnavailable {
        dependency: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Whether a caller may retry the failed operation with a fresh read.
    ///
    /// Only optimistic-lock conflicts qualify. State-machine refusals
    /// (`InvalidState`, `AccessDenied`) are caller errors and must be
    /// surfaced verbatim, never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<rusqlite::Error> for WorkflowError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(anyhow::Error::new(err))
    }
}
