//! Synthesizes the fixed task batch for a phase.
//!
//! Assignees come from the phase's owning department via the directory
//! trait; the batch is built from the phase's templates with policy due
//! offsets. A department that cannot be resolved, or one with no active
//! members, is a hard error — a phase with zero tasks would trivially
//! "complete" and the cascade would run away.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::directory::DepartmentDirectory;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::phase::WorkflowPhase;
use crate::project::ProjectWorkflow;
use crate::task::{ChecklistItem, Task, TaskStatus};
use crate::templates::TemplateSet;

pub struct WorkflowTaskGenerator {
    templates: TemplateSet,
}

impl WorkflowTaskGenerator {
    pub fn new(templates: TemplateSet) -> Self {
        Self { templates }
    }

    /// Build the task batch for `phase`, assigning round-robin across the
    /// owning department's active members. Does not persist; the caller
    /// writes the batch through the store atomically.
    pub async fn generate(
        &self,
        directory: &dyn DepartmentDirectory,
        project: &ProjectWorkflow,
        phase: WorkflowPhase,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<Task>> {
        let department_name = phase.owning_department().ok_or_else(|| {
            WorkflowError::InvalidState(format!("phase {} has no task batch to generate", phase))
        })?;

        let department = directory
            .department_by_name(department_name)
            .await?
            .ok_or_else(|| WorkflowError::DepartmentNotFound {
                name: department_name.to_string(),
            })?;

        let members = directory.active_members(department.id).await?;
        if members.is_empty() {
            return Err(WorkflowError::NoEligibleAssignee {
                department: department_name.to_string(),
            });
        }

        let templates = self.templates.templates_for(phase);
        if templates.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "no task templates configured for phase {}",
                phase
            )));
        }

        tracing::info!(
            project_id = %project.id,
            phase = %phase,
            department = %department_name,
            count = templates.len(),
            "generating phase task batch"
        );

        let tasks = templates
            .iter()
            .enumerate()
            .map(|(i, template)| Task {
                id: Uuid::new_v4(),
                project_id: project.id,
                title: template.title.clone(),
                description: template.description.clone(),
                department: department_name.to_string(),
                assignee: members[i % members.len()].id,
                workflow_phase: phase,
                workflow_step: (i + 1) as i64,
                status: TaskStatus::Pending,
                progress: 0,
                checklist: template
                    .checklist
                    .iter()
                    .map(|item| ChecklistItem::new(item))
                    .collect(),
                due_date: now + Duration::days(template.due_in_days),
                started_at: None,
                completed_at: None,
                completed_by: None,
                is_active: true,
                created_at: now,
                record_version: 0,
            })
            .collect();

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::project::ApprovalLevel;
    use crate::templates::default_templates;

    fn make_project() -> ProjectWorkflow {
        ProjectWorkflow::new(
            "P",
            vec![ApprovalLevel {
                level: "hod".into(),
                department: "Operations".into(),
                approver: None,
            }],
            vec![],
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_builds_one_task_per_template() {
        let directory = StaticDirectory::new().with_department("Operations", &[("Asha", true)]);
        let generator = WorkflowTaskGenerator::new(default_templates());
        let project = make_project();

        let tasks = generator
            .generate(&directory, &project, WorkflowPhase::Operations, Utc::now())
            .await
            .unwrap();

        assert_eq!(
            tasks.len(),
            default_templates().templates_for(WorkflowPhase::Operations).len()
        );
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.workflow_phase, WorkflowPhase::Operations);
            assert_eq!(task.workflow_step, (i + 1) as i64);
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.department, "Operations");
            assert!(task.due_date > task.created_at);
        }
    }

    #[tokio::test]
    async fn test_assignees_rotate_round_robin() {
        let directory = StaticDirectory::new()
            .with_department("Procurement", &[("Chidi", true), ("Efe", true)]);
        let generator = WorkflowTaskGenerator::new(default_templates());
        let project = make_project();

        let tasks = generator
            .generate(&directory, &project, WorkflowPhase::Procurement, Utc::now())
            .await
            .unwrap();

        assert!(tasks.len() >= 3);
        assert_eq!(tasks[0].assignee, tasks[2].assignee);
        assert_ne!(tasks[0].assignee, tasks[1].assignee);
    }

    #[tokio::test]
    async fn test_unknown_department_is_surfaced() {
        let directory = StaticDirectory::new(); // empty org chart
        let generator = WorkflowTaskGenerator::new(default_templates());
        let project = make_project();

        let err = generator
            .generate(&directory, &project, WorkflowPhase::Operations, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DepartmentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_department_without_active_members_is_surfaced() {
        let directory = StaticDirectory::new()
            .with_department("Finance & Accounting", &[("Dana", false)]);
        let generator = WorkflowTaskGenerator::new(default_templates());
        let project = make_project();

        let err = generator
            .generate(&directory, &project, WorkflowPhase::Finance, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoEligibleAssignee { .. }));
    }

    #[tokio::test]
    async fn test_phase_without_owned_batch_is_invalid() {
        let directory = StaticDirectory::new().with_department("Operations", &[("Asha", true)]);
        let generator = WorkflowTaskGenerator::new(default_templates());
        let project = make_project();

        let err = generator
            .generate(&directory, &project, WorkflowPhase::Documentation, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
    }
}
