//! Task persistence: atomic batch creation, phase queries, and the
//! single-step completion transition, all under optimistic concurrency.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{
    WorkflowDb, conversion_error, parse_json, parse_opt_timestamp, parse_opt_uuid, parse_phase,
    parse_timestamp, parse_uuid,
};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::phase::WorkflowPhase;
use crate::task::{Task, TaskStatus};

fn parse_status(idx: usize, s: String) -> rusqlite::Result<TaskStatus> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_uuid(0, row.get(0)?)?,
        project_id: parse_uuid(1, row.get(1)?)?,
        title: row.get(2)?,
        description: row.get(3)?,
        department: row.get(4)?,
        assignee: parse_uuid(5, row.get(5)?)?,
        workflow_phase: parse_phase(6, row.get(6)?)?,
        workflow_step: row.get(7)?,
        status: parse_status(8, row.get(8)?)?,
        progress: row.get(9)?,
        checklist: parse_json(10, row.get(10)?)?,
        due_date: parse_timestamp(11, row.get(11)?)?,
        started_at: parse_opt_timestamp(12, row.get(12)?)?,
        completed_at: parse_opt_timestamp(13, row.get(13)?)?,
        completed_by: parse_opt_uuid(14, row.get(14)?)?,
        is_active: row.get(15)?,
        created_at: parse_timestamp(16, row.get(16)?)?,
        record_version: row.get(17)?,
    })
}

const TASK_COLUMNS: &str = "id, project_id, title, description, department, assignee,
     workflow_phase, workflow_step, status, progress, checklist, due_date,
     started_at, completed_at, completed_by, is_active, created_at, record_version";

impl WorkflowDb {
    /// Atomically persist a phase batch. The whole batch is rejected with
    /// `Validation` if any task lacks a project, assignee, or department
    /// reference — a partially persisted batch would corrupt the
    /// phase-completion predicate.
    pub fn create_batch(&self, tasks: &[Task]) -> WorkflowResult<usize> {
        if tasks.is_empty() {
            return Err(WorkflowError::Validation(
                "task batch must not be empty".into(),
            ));
        }
        for task in tasks {
            if task.project_id.is_nil() {
                return Err(WorkflowError::Validation(format!(
                    "task '{}' has no project reference",
                    task.title
                )));
            }
            if task.assignee.is_nil() {
                return Err(WorkflowError::Validation(format!(
                    "task '{}' has no assignee",
                    task.title
                )));
            }
            if task.department.trim().is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "task '{}' has no department reference",
                    task.title
                )));
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        for task in tasks {
            tx.execute(
                "INSERT INTO tasks (id, project_id, title, description, department, assignee,
                                    workflow_phase, workflow_step, status, progress, checklist,
                                    due_date, started_at, completed_at, completed_by,
                                    is_active, created_at, record_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    task.id.to_string(),
                    task.project_id.to_string(),
                    task.title,
                    task.description,
                    task.department,
                    task.assignee.to_string(),
                    task.workflow_phase.as_str(),
                    task.workflow_step,
                    task.status.as_str(),
                    task.progress,
                    serde_json::to_string(&task.checklist)?,
                    task.due_date.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    task.completed_by.map(|u| u.to_string()),
                    task.is_active,
                    task.created_at.to_rfc3339(),
                    task.record_version,
                ],
            )?;
        }
        tx.commit()?;
        Ok(tasks.len())
    }

    pub fn task(&self, id: Uuid) -> WorkflowResult<Task> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id.to_string()],
                task_from_row,
            )
            .optional()?
            .ok_or(WorkflowError::TaskNotFound { id })
    }

    /// Active tasks tagged to a phase, in creation order.
    pub fn tasks_for_phase(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
    ) -> WorkflowResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = ?1 AND workflow_phase = ?2 AND is_active = 1
             ORDER BY created_at, workflow_step"
        ))?;
        let rows = stmt.query_map(params![project_id.to_string(), phase.as_str()], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Persist a mutated task, conditional on the version the caller read.
    pub fn update_task(&self, mut task: Task, expected_version: i64) -> WorkflowResult<Task> {
        task.record_version = expected_version + 1;
        let updated = self.conn.execute(
            "UPDATE tasks SET status = ?1, progress = ?2, checklist = ?3,
                              started_at = ?4, completed_at = ?5, completed_by = ?6,
                              is_active = ?7, record_version = ?8
             WHERE id = ?9 AND record_version = ?10",
            params![
                task.status.as_str(),
                task.progress,
                serde_json::to_string(&task.checklist)?,
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.completed_by.map(|u| u.to_string()),
                task.is_active,
                task.record_version,
                task.id.to_string(),
                expected_version,
            ],
        )?;
        if updated == 0 {
            let _ = self.task(task.id)?;
            return Err(WorkflowError::ConcurrentModification {
                entity: "task",
                id: task.id,
            });
        }
        Ok(task)
    }

    /// Advance a task's status by one step (see `Task::advance_status`).
    pub fn complete_task(
        &self,
        task_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Task> {
        let mut task = self.task(task_id)?;
        let expected = task.record_version;
        task.advance_status(actor, now)?;
        self.update_task(task, expected)
    }

    /// True iff every active task tagged to the phase is completed.
    /// Vacuously true for an empty set.
    pub fn all_completed_for_phase(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
    ) -> WorkflowResult<bool> {
        Ok(self.pending_task_ids(project_id, phase)?.is_empty())
    }

    /// Ids of active tasks in the phase not yet completed, in creation
    /// order. Returned whole so callers can render actionable detail.
    pub fn pending_task_ids(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
    ) -> WorkflowResult<Vec<Uuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tasks
             WHERE project_id = ?1 AND workflow_phase = ?2 AND is_active = 1
               AND status != 'completed'
             ORDER BY created_at, workflow_step",
        )?;
        let rows = stmt.query_map(params![project_id.to_string(), phase.as_str()], |row| {
            parse_uuid(0, row.get(0)?)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Idempotent bulk completion of a phase's remaining open tasks.
    /// Cancelled tasks are terminal and stay untouched.
    pub fn mark_phase_tasks_completed(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> WorkflowResult<usize> {
        let updated = self.conn.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, completed_by = ?2,
                              record_version = record_version + 1
             WHERE project_id = ?3 AND workflow_phase = ?4 AND is_active = 1
               AND status IN ('pending', 'in_progress', 'overdue')",
            params![
                now.to_rfc3339(),
                actor.to_string(),
                project_id.to_string(),
                phase.as_str(),
            ],
        )?;
        Ok(updated)
    }

    /// (total, completed) counts of active tasks in a phase.
    pub fn phase_counts(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
    ) -> WorkflowResult<(usize, usize)> {
        let (total, completed): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)
             FROM tasks
             WHERE project_id = ?1 AND workflow_phase = ?2 AND is_active = 1",
            params![project_id.to_string(), phase.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total as usize, completed as usize))
    }

    /// Unresolved tasks past their due date: the derived overdue view.
    pub fn overdue_tasks(&self, project_id: Uuid, now: DateTime<Utc>) -> WorkflowResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = ?1 AND is_active = 1
               AND status IN ('pending', 'in_progress') AND due_date < ?2
             ORDER BY due_date"
        ))?;
        let rows = stmt.query_map(
            params![project_id.to_string(), now.to_rfc3339()],
            task_from_row,
        )?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Soft-delete: tasks are never removed from the store.
    pub fn deactivate_task(&self, task_id: Uuid) -> WorkflowResult<Task> {
        let mut task = self.task(task_id)?;
        let expected = task.record_version;
        task.is_active = false;
        self.update_task(task, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChecklistItem;
    use chrono::Duration;

    fn make_task(project_id: Uuid, phase: WorkflowPhase, step: i64) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project_id,
            title: format!("Task {}", step),
            description: String::new(),
            department: "Operations".into(),
            assignee: Uuid::new_v4(),
            workflow_phase: phase,
            workflow_step: step,
            status: TaskStatus::Pending,
            progress: 0,
            checklist: vec![ChecklistItem::new("first"), ChecklistItem::new("second")],
            due_date: now + Duration::days(3),
            started_at: None,
            completed_at: None,
            completed_by: None,
            is_active: true,
            created_at: now,
            record_version: 0,
        }
    }

    fn db_with_project() -> (WorkflowDb, Uuid) {
        let db = WorkflowDb::open_in_memory().unwrap();
        let project = crate::project::ProjectWorkflow::new(
            "P",
            vec![crate::project::ApprovalLevel {
                level: "hod".into(),
                department: "Operations".into(),
                approver: None,
            }],
            vec![],
            Utc::now(),
        )
        .unwrap();
        db.insert_project(&project).unwrap();
        (db, project.id)
    }

    #[test]
    fn test_create_batch_and_query_in_creation_order() {
        let (db, project_id) = db_with_project();
        let batch = vec![
            make_task(project_id, WorkflowPhase::Operations, 1),
            make_task(project_id, WorkflowPhase::Operations, 2),
            make_task(project_id, WorkflowPhase::Procurement, 1),
        ];
        assert_eq!(db.create_batch(&batch).unwrap(), 3);

        let ops = db.tasks_for_phase(project_id, WorkflowPhase::Operations).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].workflow_step, 1);
        assert_eq!(ops[1].workflow_step, 2);
    }

    #[test]
    fn test_create_batch_rejects_missing_references() {
        let (db, project_id) = db_with_project();

        let mut no_assignee = make_task(project_id, WorkflowPhase::Operations, 1);
        no_assignee.assignee = Uuid::nil();
        let err = db.create_batch(&[no_assignee]).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let mut no_department = make_task(project_id, WorkflowPhase::Operations, 1);
        no_department.department = "  ".into();
        let err = db.create_batch(&[no_department]).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        // Nothing was persisted by the rejected batches.
        assert!(db.tasks_for_phase(project_id, WorkflowPhase::Operations).unwrap().is_empty());
    }

    #[test]
    fn test_create_batch_is_atomic_on_mid_batch_failure() {
        let (db, project_id) = db_with_project();
        let shared_id = Uuid::new_v4();
        let mut first = make_task(project_id, WorkflowPhase::Operations, 1);
        first.id = shared_id;
        let mut second = make_task(project_id, WorkflowPhase::Operations, 2);
        second.id = shared_id; // primary-key collision inside the batch

        assert!(db.create_batch(&[first, second]).is_err());
        assert!(db.tasks_for_phase(project_id, WorkflowPhase::Operations).unwrap().is_empty());
    }

    #[test]
    fn test_complete_task_walks_the_two_step_transition() {
        let (db, project_id) = db_with_project();
        let task = make_task(project_id, WorkflowPhase::Operations, 1);
        db.create_batch(std::slice::from_ref(&task)).unwrap();
        let actor = Uuid::new_v4();

        let stepped = db.complete_task(task.id, actor, Utc::now()).unwrap();
        assert_eq!(stepped.status, TaskStatus::InProgress);
        assert!(stepped.started_at.is_some());

        let done = db.complete_task(task.id, actor, Utc::now()).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.completed_by, Some(actor));

        let err = db.complete_task(task.id, actor, Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
    }

    #[test]
    fn test_update_task_with_stale_version_conflicts() {
        let (db, project_id) = db_with_project();
        let task = make_task(project_id, WorkflowPhase::Operations, 1);
        db.create_batch(std::slice::from_ref(&task)).unwrap();

        let loaded = db.task(task.id).unwrap();
        db.update_task(loaded.clone(), loaded.record_version).unwrap();

        let err = db.update_task(loaded.clone(), loaded.record_version).unwrap_err();
        assert!(matches!(err, WorkflowError::ConcurrentModification { .. }));
    }

    #[test]
    fn test_phase_completion_predicate_and_pending_ids() {
        let (db, project_id) = db_with_project();
        let first = make_task(project_id, WorkflowPhase::Operations, 1);
        let second = make_task(project_id, WorkflowPhase::Operations, 2);
        db.create_batch(&[first.clone(), second.clone()]).unwrap();
        let actor = Uuid::new_v4();

        assert!(!db.all_completed_for_phase(project_id, WorkflowPhase::Operations).unwrap());

        db.complete_task(first.id, actor, Utc::now()).unwrap();
        db.complete_task(first.id, actor, Utc::now()).unwrap();
        let pending = db.pending_task_ids(project_id, WorkflowPhase::Operations).unwrap();
        assert_eq!(pending, vec![second.id]);

        db.complete_task(second.id, actor, Utc::now()).unwrap();
        db.complete_task(second.id, actor, Utc::now()).unwrap();
        assert!(db.all_completed_for_phase(project_id, WorkflowPhase::Operations).unwrap());

        // Empty phase is vacuously complete.
        assert!(db.all_completed_for_phase(project_id, WorkflowPhase::Finance).unwrap());
    }

    #[test]
    fn test_mark_phase_tasks_completed_is_idempotent_and_skips_cancelled() {
        let (db, project_id) = db_with_project();
        let open = make_task(project_id, WorkflowPhase::Operations, 1);
        let mut cancelled = make_task(project_id, WorkflowPhase::Operations, 2);
        cancelled.status = TaskStatus::Cancelled;
        db.create_batch(&[open.clone(), cancelled.clone()]).unwrap();
        let actor = Uuid::new_v4();

        assert_eq!(
            db.mark_phase_tasks_completed(project_id, WorkflowPhase::Operations, actor, Utc::now())
                .unwrap(),
            1
        );
        assert_eq!(
            db.mark_phase_tasks_completed(project_id, WorkflowPhase::Operations, actor, Utc::now())
                .unwrap(),
            0
        );
        assert_eq!(db.task(cancelled.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_overdue_view_and_deactivation() {
        let (db, project_id) = db_with_project();
        let mut late = make_task(project_id, WorkflowPhase::Operations, 1);
        late.due_date = Utc::now() - Duration::days(2);
        let on_time = make_task(project_id, WorkflowPhase::Operations, 2);
        db.create_batch(&[late.clone(), on_time]).unwrap();

        let overdue = db.overdue_tasks(project_id, Utc::now()).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, late.id);

        let deactivated = db.deactivate_task(late.id).unwrap();
        assert!(!deactivated.is_active);
        assert!(db.overdue_tasks(project_id, Utc::now()).unwrap().is_empty());
        // Soft-deleted, not gone: direct lookup still finds it.
        assert_eq!(db.task(late.id).unwrap().id, late.id);
    }

    #[test]
    fn test_phase_counts() {
        let (db, project_id) = db_with_project();
        let first = make_task(project_id, WorkflowPhase::Finance, 1);
        let second = make_task(project_id, WorkflowPhase::Finance, 2);
        db.create_batch(&[first.clone(), second]).unwrap();
        let actor = Uuid::new_v4();
        db.complete_task(first.id, actor, Utc::now()).unwrap();
        db.complete_task(first.id, actor, Utc::now()).unwrap();

        let (total, completed) = db.phase_counts(project_id, WorkflowPhase::Finance).unwrap();
        assert_eq!((total, completed), (2, 1));
    }
}
