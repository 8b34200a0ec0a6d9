//! Task records and their status/progress lifecycle.
//!
//! Status moves forward only: pending -> in_progress -> completed. Overdue
//! is an observed condition derived from the due date, never a stored
//! transition target of this engine; cancelled is terminal. Tasks are never
//! deleted — deactivation is the soft-delete path.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::phase::WorkflowPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Overdue,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "overdue" => Ok(Self::Overdue),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub item: String,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChecklistItem {
    pub fn new(item: &str) -> Self {
        Self {
            item: item.to_string(),
            is_completed: false,
            completed_by: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub department: String,
    pub assignee: Uuid,
    /// The macro phase whose batch spawned this task.
    pub workflow_phase: WorkflowPhase,
    /// Ordinal of the task within its phase batch, 1-based.
    pub workflow_step: i64,
    pub status: TaskStatus,
    /// 0-100, derived from the checklist completion ratio.
    pub progress: u8,
    pub checklist: Vec<ChecklistItem>,
    pub due_date: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every write.
    pub record_version: i64,
}

impl Task {
    /// Advance the status by one step, recording actor and timestamps.
    ///
    /// pending -> in_progress (records `started_at`), in_progress ->
    /// completed (records `completed_at`, `completed_by`). Any other source
    /// state refuses with `InvalidState` and leaves the task untouched.
    pub fn advance_status(
        &mut self,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> WorkflowResult<TaskStatus> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::InProgress;
                self.started_at = Some(now);
                Ok(TaskStatus::InProgress)
            }
            TaskStatus::InProgress => {
                self.status = TaskStatus::Completed;
                self.completed_at = Some(now);
                self.completed_by = Some(actor);
                Ok(TaskStatus::Completed)
            }
            TaskStatus::Completed | TaskStatus::Cancelled => Err(WorkflowError::InvalidState(
                format!("task {} is already {}", self.id, self.status),
            )),
            // Overdue is derived from the due date, never written by this
            // engine; a record arriving in that state is foreign data.
            TaskStatus::Overdue => Err(WorkflowError::InvalidState(format!(
                "task {} carries the observed status 'overdue'",
                self.id
            ))),
        }
    }

    /// Set one checklist item's completion and recompute `progress`.
    pub fn set_checklist_item(
        &mut self,
        index: usize,
        completed: bool,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        if self.status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "task {} is {}; its checklist is frozen",
                self.id, self.status
            )));
        }
        let len = self.checklist.len();
        let item = self.checklist.get_mut(index).ok_or_else(|| {
            WorkflowError::Validation(format!(
                "checklist index {} out of range (len {})",
                index, len
            ))
        })?;
        item.is_completed = completed;
        if completed {
            item.completed_by = Some(actor);
            item.completed_at = Some(now);
        } else {
            item.completed_by = None;
            item.completed_at = None;
        }
        self.recompute_progress();
        Ok(())
    }

    /// progress = round(100 * completed / total); 0 for an empty checklist.
    pub fn recompute_progress(&mut self) {
        let total = self.checklist.len();
        if total == 0 {
            self.progress = 0;
            return;
        }
        let done = self.checklist.iter().filter(|i| i.is_completed).count();
        self.progress = ((done as f64 / total as f64) * 100.0).round() as u8;
    }

    /// Observed-overdue check: past due and not yet resolved.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_date < now && matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_task(checklist: Vec<ChecklistItem>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            title: "Create inventory records".into(),
            description: String::new(),
            department: "Operations".into(),
            assignee: Uuid::new_v4(),
            workflow_phase: WorkflowPhase::Operations,
            workflow_step: 1,
            status: TaskStatus::Pending,
            progress: 0,
            checklist,
            due_date: now + Duration::days(3),
            started_at: None,
            completed_at: None,
            completed_by: None,
            is_active: true,
            created_at: now,
            record_version: 0,
        }
    }

    #[test]
    fn test_advance_pending_to_in_progress_to_completed() {
        let mut task = make_task(vec![]);
        let actor = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(task.advance_status(actor, now).unwrap(), TaskStatus::InProgress);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        assert_eq!(task.advance_status(actor, now).unwrap(), TaskStatus::Completed);
        assert_eq!(task.completed_by, Some(actor));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_advance_on_completed_is_invalid_and_side_effect_free() {
        let mut task = make_task(vec![]);
        let actor = Uuid::new_v4();
        let now = Utc::now();
        task.advance_status(actor, now).unwrap();
        task.advance_status(actor, now).unwrap();

        let before = task.clone();
        let err = task.advance_status(actor, now).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
        assert_eq!(task.status, before.status);
        assert_eq!(task.completed_at, before.completed_at);
    }

    #[test]
    fn test_advance_on_cancelled_is_invalid() {
        let mut task = make_task(vec![]);
        task.status = TaskStatus::Cancelled;
        let err = task.advance_status(Uuid::new_v4(), Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
    }

    #[test]
    fn test_progress_is_zero_for_empty_checklist() {
        let mut task = make_task(vec![]);
        task.recompute_progress();
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn test_progress_rounds_completion_ratio() {
        let mut task = make_task(vec![
            ChecklistItem::new("a"),
            ChecklistItem::new("b"),
            ChecklistItem::new("c"),
        ]);
        let actor = Uuid::new_v4();
        let now = Utc::now();

        task.set_checklist_item(0, true, actor, now).unwrap();
        assert_eq!(task.progress, 33);

        task.set_checklist_item(1, true, actor, now).unwrap();
        assert_eq!(task.progress, 67);

        task.set_checklist_item(2, true, actor, now).unwrap();
        assert_eq!(task.progress, 100);

        // Unchecking recomputes downward and clears the completion stamp.
        task.set_checklist_item(1, false, actor, now).unwrap();
        assert_eq!(task.progress, 67);
        assert!(task.checklist[1].completed_by.is_none());
        assert!(task.checklist[1].completed_at.is_none());
    }

    #[test]
    fn test_checklist_index_out_of_range_is_validation() {
        let mut task = make_task(vec![ChecklistItem::new("a")]);
        let err = task
            .set_checklist_item(5, true, Uuid::new_v4(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_is_overdue_only_for_unresolved_past_due() {
        let mut task = make_task(vec![]);
        let now = Utc::now();
        assert!(!task.is_overdue(now));

        task.due_date = now - Duration::days(1);
        assert!(task.is_overdue(now));

        task.status = TaskStatus::Completed;
        assert!(!task.is_overdue(now));
    }
}
