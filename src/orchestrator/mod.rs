//! The phase transition orchestrator.
//!
//! `WorkflowService` is the engine's public surface: it drives documents
//! through their approval chains, detects phase completion, flips the
//! one-way triggers, and cascades task generation into the next phase.
//! Transitions are planned by the pure `phase::plan_transition` and executed
//! here against the store under optimistic concurrency; lock conflicts are
//! retried exactly once with a fresh read.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::approval::{ChainOutcome, DocumentApprovalRecord, DocumentMeta};
use crate::directory::{DepartmentDirectory, NotificationSink, WorkflowEvent};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::generator::WorkflowTaskGenerator;
use crate::phase::{WorkflowPhase, plan_transition};
use crate::project::{ApprovalLevel, HistoryEntry, ProjectWorkflow, WorkflowTriggers};
use crate::store::DbHandle;
use crate::task::Task;
use crate::templates::TemplateSet;

/// The acting user, as resolved by the caller's auth layer. The engine only
/// checks department membership and designated-approver identity.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
    pub department: String,
}

impl Actor {
    pub fn new(name: &str, department: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            department: department.to_string(),
        }
    }
}

// ── View types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTaskList {
    pub phase: WorkflowPhase,
    pub tasks: Vec<Task>,
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
}

/// Result of a phase advance (or the no-op re-run of one).
#[derive(Debug, Clone, Serialize)]
pub struct PhaseAdvanceOutcome {
    pub project_id: Uuid,
    pub phase: WorkflowPhase,
    pub workflow_step: i64,
    pub triggers: WorkflowTriggers,
    /// Tasks newly created for the next phase. Zero on a repeat call.
    pub generated_tasks: usize,
    /// True when the call found the phase already advanced and did nothing.
    pub already_complete: bool,
}

#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task: Task,
    /// Set when this completion closed out the last task of its phase.
    pub phase_advance: Option<PhaseAdvanceOutcome>,
}

#[derive(Debug, Clone)]
pub struct ApprovalAction {
    pub document: DocumentApprovalRecord,
    pub outcome: ChainOutcome,
    /// Set when this approval completed the last required chain and the
    /// project left the documentation phase.
    pub phase_advance: Option<PhaseAdvanceOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseProgress {
    pub phase: WorkflowPhase,
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowProgress {
    pub phases: Vec<PhaseProgress>,
    /// Average across the three measured phases.
    pub overall_percentage: f64,
}

/// Partitioned view of a project's required documents.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentReview {
    pub approved: Vec<String>,
    pub pending: Vec<String>,
    pub rejected: Vec<String>,
    pub all_required_approved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub project: ProjectWorkflow,
    pub documents: DocumentReview,
}

// ── Service ───────────────────────────────────────────────────────────────

pub struct WorkflowService {
    db: DbHandle,
    directory: Arc<dyn DepartmentDirectory>,
    notifier: Arc<dyn NotificationSink>,
    generator: WorkflowTaskGenerator,
}

impl WorkflowService {
    pub fn new(
        db: DbHandle,
        directory: Arc<dyn DepartmentDirectory>,
        notifier: Arc<dyn NotificationSink>,
        templates: TemplateSet,
    ) -> Self {
        Self {
            db,
            directory,
            notifier,
            generator: WorkflowTaskGenerator::new(templates),
        }
    }

    // ── Project lifecycle ─────────────────────────────────────────────────

    /// Register a project workflow: documentation phase, step 1, all
    /// triggers down.
    pub async fn register_project(
        &self,
        name: &str,
        approval_chain: Vec<ApprovalLevel>,
        required_documents: Vec<String>,
        actor: &Actor,
    ) -> WorkflowResult<ProjectWorkflow> {
        let project = ProjectWorkflow::new(name, approval_chain, required_documents, Utc::now())?;
        let stored = project.clone();
        self.db.call(move |db| db.insert_project(&stored)).await?;

        self.append_history(
            project.id,
            WorkflowPhase::Documentation,
            "project_registered",
            &actor.id.to_string(),
            serde_json::json!({ "name": project.name }),
        )
        .await?;

        tracing::info!(project_id = %project.id, name = %project.name, "project registered");
        Ok(project)
    }

    pub async fn project(&self, project_id: Uuid) -> WorkflowResult<ProjectWorkflow> {
        self.db.call(move |db| db.project(project_id)).await
    }

    pub async fn workflow_state(&self, project_id: Uuid) -> WorkflowResult<WorkflowSnapshot> {
        let project = self.project(project_id).await?;
        let documents = self.document_review(project_id).await?;
        Ok(WorkflowSnapshot { project, documents })
    }

    pub async fn workflow_history(&self, project_id: Uuid) -> WorkflowResult<Vec<HistoryEntry>> {
        let _ = self.project(project_id).await?;
        self.db.call(move |db| db.history(project_id)).await
    }

    // ── Document approval chain ───────────────────────────────────────────

    /// Submit a document into the project's approval chain. A document type
    /// may be resubmitted only after a rejection, which replaces the
    /// terminal record with a fresh chain.
    pub async fn submit_document(
        &self,
        project_id: Uuid,
        document_type: &str,
        document_id: Uuid,
        meta: &DocumentMeta,
        actor: &Actor,
    ) -> WorkflowResult<DocumentApprovalRecord> {
        let project = self.project(project_id).await?;
        let is_required = project
            .required_documents
            .iter()
            .any(|d| d == document_type);
        let record = DocumentApprovalRecord::submit(
            project_id,
            document_type,
            document_id,
            &project.approval_chain,
            meta,
            actor.id,
            is_required,
            Utc::now(),
        )?;

        let doc_type = document_type.to_string();
        let existing = self
            .db
            .call(move |db| db.document(project_id, &doc_type))
            .await;
        let stored = match existing {
            Ok(previous) => {
                if !matches!(
                    previous.approval_status,
                    crate::approval::ApprovalStatus::Rejected
                ) {
                    return Err(WorkflowError::InvalidState(format!(
                        "document '{}' is already {} on project {}",
                        document_type,
                        previous.approval_status.as_str(),
                        project_id
                    )));
                }
                let expected = previous.record_version;
                self.db
                    .call(move |db| db.replace_document(record, expected))
                    .await?
            }
            Err(WorkflowError::DocumentNotFound { .. }) => {
                let inserted = record.clone();
                self.db.call(move |db| db.insert_document(&inserted)).await?;
                record
            }
            Err(err) => return Err(err),
        };

        self.append_history(
            project_id,
            project.workflow_phase,
            "document_submitted",
            &actor.id.to_string(),
            serde_json::json!({ "document_type": document_type }),
        )
        .await?;
        self.notify_best_effort(WorkflowEvent::DocumentAwaitingApproval {
            project_id,
            document_type: document_type.to_string(),
            level: stored.current_level_id().to_string(),
        })
        .await;

        Ok(stored)
    }

    /// Approve at the given chain level. Completing the last required chain
    /// advances the project out of documentation and generates the
    /// operations batch.
    pub async fn approve_document(
        &self,
        project_id: Uuid,
        document_type: &str,
        level: &str,
        actor: &Actor,
        comments: Option<String>,
    ) -> WorkflowResult<ApprovalAction> {
        let project = self.project(project_id).await?;
        authorize_level(&project, level, actor)?;

        let approver = actor.id;
        let level_owned = level.to_string();
        let comments_owned = comments.clone();
        let (document, outcome) = self
            .mutate_document(project_id, document_type, move |record| {
                record.approve(&level_owned, approver, comments_owned.clone(), Utc::now())
            })
            .await?;

        self.append_history(
            project_id,
            project.workflow_phase,
            "document_approved",
            &actor.id.to_string(),
            serde_json::json!({ "document_type": document_type, "level": level }),
        )
        .await?;

        match &outcome {
            ChainOutcome::ChainApproved => {
                self.notify_best_effort(WorkflowEvent::DocumentApproved {
                    project_id,
                    document_type: document_type.to_string(),
                })
                .await;
            }
            ChainOutcome::AdvancedTo { level } => {
                self.notify_best_effort(WorkflowEvent::DocumentAwaitingApproval {
                    project_id,
                    document_type: document_type.to_string(),
                    level: level.clone(),
                })
                .await;
            }
            ChainOutcome::ChainRejected { .. } => {}
        }

        let phase_advance = if matches!(outcome, ChainOutcome::ChainApproved)
            && self.document_review(project_id).await?.all_required_approved
        {
            Some(
                self.complete_phase_inner(project_id, WorkflowPhase::Documentation, "auto", actor.id)
                    .await?,
            )
        } else {
            None
        };

        Ok(ApprovalAction {
            document,
            outcome,
            phase_advance,
        })
    }

    /// Reject at the given chain level. Terminal for the document's chain.
    pub async fn reject_document(
        &self,
        project_id: Uuid,
        document_type: &str,
        level: &str,
        actor: &Actor,
        comments: Option<String>,
    ) -> WorkflowResult<ApprovalAction> {
        let project = self.project(project_id).await?;
        authorize_level(&project, level, actor)?;

        let approver = actor.id;
        let level_owned = level.to_string();
        let comments_owned = comments.clone();
        let (document, outcome) = self
            .mutate_document(project_id, document_type, move |record| {
                record.reject(&level_owned, approver, comments_owned.clone(), Utc::now())
            })
            .await?;

        self.append_history(
            project_id,
            project.workflow_phase,
            "document_rejected",
            &actor.id.to_string(),
            serde_json::json!({ "document_type": document_type, "level": level }),
        )
        .await?;
        self.notify_best_effort(WorkflowEvent::DocumentRejected {
            project_id,
            document_type: document_type.to_string(),
            level: level.to_string(),
        })
        .await;

        Ok(ApprovalAction {
            document,
            outcome,
            phase_advance: None,
        })
    }

    /// Swap the document content while its chain is in flight. Resets only
    /// the current level's entry; approvals already granted stand.
    pub async fn update_document_during_approval(
        &self,
        project_id: Uuid,
        document_type: &str,
        level: &str,
        new_document_id: Uuid,
        meta: &DocumentMeta,
        actor: &Actor,
        comments: Option<String>,
    ) -> WorkflowResult<DocumentApprovalRecord> {
        let project = self.project(project_id).await?;

        let doc_type = document_type.to_string();
        let current = self
            .db
            .call(move |db| db.document(project_id, &doc_type))
            .await?;
        // The submitter may revise their own document; anyone else must be
        // authorized for the level being reset.
        if actor.id != current.submitted_by {
            authorize_level(&project, level, actor)?;
        }

        let updater = actor.id;
        let level_owned = level.to_string();
        let comments_owned = comments.clone();
        let meta_owned = meta.clone();
        let (document, version) = self
            .mutate_document(project_id, document_type, move |record| {
                record.supersede_document(
                    &level_owned,
                    new_document_id,
                    updater,
                    comments_owned.clone(),
                    &meta_owned,
                    Utc::now(),
                )
            })
            .await?;

        self.append_history(
            project_id,
            project.workflow_phase,
            "document_updated_during_approval",
            &actor.id.to_string(),
            serde_json::json!({
                "document_type": document_type,
                "level": level,
                "version": version,
            }),
        )
        .await?;
        self.notify_best_effort(WorkflowEvent::DocumentAwaitingApproval {
            project_id,
            document_type: document_type.to_string(),
            level: level.to_string(),
        })
        .await;

        Ok(document)
    }

    /// Partition the project's required documents by chain state.
    ///
    /// A required type with no submission yet counts as pending — the
    /// documentation phase cannot exit until every required record exists
    /// and is approved.
    pub async fn document_review(&self, project_id: Uuid) -> WorkflowResult<DocumentReview> {
        let project = self.project(project_id).await?;
        let records = self
            .db
            .call(move |db| db.documents_for_project(project_id))
            .await?;

        let mut approved = Vec::new();
        let mut pending = Vec::new();
        let mut rejected = Vec::new();
        for doc_type in &project.required_documents {
            match records.iter().find(|r| &r.document_type == doc_type) {
                Some(record) => match record.approval_status {
                    crate::approval::ApprovalStatus::Approved => approved.push(doc_type.clone()),
                    crate::approval::ApprovalStatus::Pending => pending.push(doc_type.clone()),
                    crate::approval::ApprovalStatus::Rejected => rejected.push(doc_type.clone()),
                },
                None => pending.push(doc_type.clone()),
            }
        }
        let all_required_approved =
            pending.is_empty() && rejected.is_empty() && !project.required_documents.is_empty();

        Ok(DocumentReview {
            approved,
            pending,
            rejected,
            all_required_approved,
        })
    }

    // ── Tasks and phase completion ────────────────────────────────────────

    pub async fn tasks_by_phase(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
        actor: &Actor,
    ) -> WorkflowResult<PhaseTaskList> {
        authorize_phase(phase, actor)?;
        let _ = self.project(project_id).await?;
        let tasks = self
            .db
            .call(move |db| db.tasks_for_phase(project_id, phase))
            .await?;
        let total = tasks.len();
        let completed = tasks
            .iter()
            .filter(|t| t.status == crate::task::TaskStatus::Completed)
            .count();
        Ok(PhaseTaskList {
            phase,
            total,
            completed,
            pending: total - completed,
            tasks,
        })
    }

    /// Advance a task's status by one step. Completing the last task of a
    /// phase cascades into `complete_phase`.
    pub async fn complete_task(&self, task_id: Uuid, actor: &Actor) -> WorkflowResult<TaskCompletion> {
        let task = self.db.call(move |db| db.task(task_id)).await?;
        authorize_phase(task.workflow_phase, actor)?;

        let actor_id = actor.id;
        let completed = {
            let first = self
                .db
                .call(move |db| db.complete_task(task_id, actor_id, Utc::now()))
                .await;
            match first {
                Err(err) if err.is_retryable() => {
                    tracing::debug!(task_id = %task_id, "retrying task completion after conflict");
                    self.db
                        .call(move |db| db.complete_task(task_id, actor_id, Utc::now()))
                        .await?
                }
                other => other?,
            }
        };

        let phase_advance = if completed.status == crate::task::TaskStatus::Completed {
            let project_id = completed.project_id;
            let phase = completed.workflow_phase;
            let all_done = self
                .db
                .call(move |db| db.all_completed_for_phase(project_id, phase))
                .await?;
            if all_done {
                Some(
                    self.complete_phase_inner(project_id, phase, &actor.id.to_string(), actor.id)
                        .await?,
                )
            } else {
                None
            }
        } else {
            None
        };

        Ok(TaskCompletion {
            task: completed,
            phase_advance,
        })
    }

    /// Complete a phase and cascade into the next one. Refuses with
    /// `PhaseIncomplete` (carrying every blocking task id) while tasks are
    /// open; a repeat call on an already-advanced phase is a no-op.
    pub async fn complete_phase(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
        actor: &Actor,
    ) -> WorkflowResult<PhaseAdvanceOutcome> {
        authorize_phase(phase, actor)?;
        self.complete_phase_inner(project_id, phase, &actor.id.to_string(), actor.id)
            .await
    }

    /// Regenerate the current phase's task batch if it is missing — the
    /// recovery path after a generation failure left a trigger flipped with
    /// zero tasks. A no-op when tasks already exist.
    pub async fn ensure_phase_tasks(&self, project_id: Uuid) -> WorkflowResult<usize> {
        let project = self.project(project_id).await?;
        let phase = project.workflow_phase;
        if phase.owning_department().is_none() {
            return Ok(0);
        }
        self.ensure_tasks_inner(&project, phase).await
    }

    /// Per-phase task counts plus the overall average across the measured
    /// phases.
    pub async fn workflow_progress(&self, project_id: Uuid) -> WorkflowResult<WorkflowProgress> {
        let _ = self.project(project_id).await?;
        let mut phases = Vec::new();
        for phase in WorkflowPhase::measured() {
            let (total, completed) = self
                .db
                .call(move |db| db.phase_counts(project_id, phase))
                .await?;
            let percentage = if total == 0 {
                0.0
            } else {
                (completed as f64 / total as f64) * 100.0
            };
            phases.push(PhaseProgress {
                phase,
                total,
                completed,
                pending: total - completed,
                percentage,
            });
        }
        let overall_percentage =
            phases.iter().map(|p| p.percentage).sum::<f64>() / phases.len() as f64;
        Ok(WorkflowProgress {
            phases,
            overall_percentage,
        })
    }

    /// Set one checklist item on a task, recomputing its progress.
    pub async fn set_checklist_item(
        &self,
        task_id: Uuid,
        index: usize,
        completed: bool,
        actor: &Actor,
    ) -> WorkflowResult<Task> {
        let task = self.db.call(move |db| db.task(task_id)).await?;
        authorize_phase(task.workflow_phase, actor)?;

        let actor_id = actor.id;
        let apply = move |task: &mut Task| task.set_checklist_item(index, completed, actor_id, Utc::now());
        let first = {
            let mut fresh = task;
            let expected = fresh.record_version;
            apply(&mut fresh)?;
            self.db.call(move |db| db.update_task(fresh, expected)).await
        };
        match first {
            Err(err) if err.is_retryable() => {
                let mut fresh = self.db.call(move |db| db.task(task_id)).await?;
                let expected = fresh.record_version;
                apply(&mut fresh)?;
                self.db.call(move |db| db.update_task(fresh, expected)).await
            }
            other => other,
        }
    }

    /// Soft-deactivate a task. Tasks are never deleted; deactivation is how
    /// a cancelled or stray task is removed from the phase-completion
    /// predicate.
    pub async fn deactivate_task(&self, task_id: Uuid, actor: &Actor) -> WorkflowResult<Task> {
        let task = self.db.call(move |db| db.task(task_id)).await?;
        authorize_phase(task.workflow_phase, actor)?;
        let deactivated = self.db.call(move |db| db.deactivate_task(task_id)).await?;
        self.append_history(
            deactivated.project_id,
            deactivated.workflow_phase,
            "task_deactivated",
            &actor.id.to_string(),
            serde_json::json!({ "task_id": task_id }),
        )
        .await?;
        Ok(deactivated)
    }

    /// Unresolved tasks past their due date, the derived overdue view.
    pub async fn overdue_tasks(&self, project_id: Uuid) -> WorkflowResult<Vec<Task>> {
        let _ = self.project(project_id).await?;
        self.db
            .call(move |db| db.overdue_tasks(project_id, Utc::now()))
            .await
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn complete_phase_inner(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
        triggered_by: &str,
        actor_id: Uuid,
    ) -> WorkflowResult<PhaseAdvanceOutcome> {
        let project = self.project(project_id).await?;

        // Re-running completion on a phase the project already left is a
        // no-op, not an error — retries after partial failure land here.
        if project.workflow_phase.ordinal() > phase.ordinal() {
            return Ok(PhaseAdvanceOutcome {
                project_id,
                phase: project.workflow_phase,
                workflow_step: project.workflow_step,
                triggers: project.triggers,
                generated_tasks: 0,
                already_complete: true,
            });
        }
        if project.workflow_phase != phase {
            return Err(WorkflowError::InvalidState(format!(
                "phase {} is not active on project {} (current: {})",
                phase, project_id, project.workflow_phase
            )));
        }

        // Completion predicate, per phase kind.
        match phase {
            WorkflowPhase::Documentation => {
                let review = self.document_review(project_id).await?;
                if !review.all_required_approved {
                    return Err(WorkflowError::InvalidState(format!(
                        "documentation is incomplete: pending {:?}, rejected {:?}",
                        review.pending, review.rejected
                    )));
                }
            }
            WorkflowPhase::Operations | WorkflowPhase::Procurement | WorkflowPhase::Finance => {
                let pending = self
                    .db
                    .call(move |db| db.pending_task_ids(project_id, phase))
                    .await?;
                if !pending.is_empty() {
                    return Err(WorkflowError::PhaseIncomplete { phase, pending });
                }
                // Idempotent bulk close-out; a no-op here since the
                // predicate held, but it also heals statuses after retries.
                self.db
                    .call(move |db| {
                        db.mark_phase_tasks_completed(project_id, phase, actor_id, Utc::now())
                    })
                    .await?;
            }
            WorkflowPhase::Execution | WorkflowPhase::Completed => {
                // plan_transition refuses below with the precise message.
            }
        }

        let advance = plan_transition(phase, project.workflow_step)?;
        let expected = project.record_version;
        let advance_clone = advance.clone();
        let updated = {
            let first = self
                .db
                .call(move |db| db.advance_project(project_id, expected, &advance_clone))
                .await;
            match first {
                Err(err) if err.is_retryable() => {
                    let fresh = self.project(project_id).await?;
                    if fresh.workflow_phase.ordinal() > phase.ordinal() {
                        // Another writer won the race; their advance stands.
                        return Ok(PhaseAdvanceOutcome {
                            project_id,
                            phase: fresh.workflow_phase,
                            workflow_step: fresh.workflow_step,
                            triggers: fresh.triggers,
                            generated_tasks: 0,
                            already_complete: true,
                        });
                    }
                    let expected = fresh.record_version;
                    let advance_clone = advance.clone();
                    self.db
                        .call(move |db| db.advance_project(project_id, expected, &advance_clone))
                        .await?
                }
                other => other?,
            }
        };

        self.append_history(
            project_id,
            updated.workflow_phase,
            advance.history_action,
            triggered_by,
            serde_json::json!({
                "from": phase.as_str(),
                "to": updated.workflow_phase.as_str(),
                "workflow_step": updated.workflow_step,
            }),
        )
        .await?;

        tracing::info!(
            project_id = %project_id,
            from = %phase,
            to = %updated.workflow_phase,
            step = updated.workflow_step,
            "phase advanced"
        );

        // Generation happens after the flag flip and is never rolled back on
        // failure: the error is surfaced and a retry regenerates the missing
        // batch (see `ensure_phase_tasks`).
        let generated_tasks = match advance.generate_for {
            Some(next) => match self.ensure_tasks_inner(&updated, next).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::error!(
                        project_id = %project_id,
                        phase = %next,
                        error = %err,
                        "phase advanced but task generation failed; trigger stays set"
                    );
                    return Err(err);
                }
            },
            None => 0,
        };

        self.notify_best_effort(WorkflowEvent::PhaseCompleted {
            project_id,
            phase,
            next_phase: updated.workflow_phase,
        })
        .await;

        Ok(PhaseAdvanceOutcome {
            project_id,
            phase: updated.workflow_phase,
            workflow_step: updated.workflow_step,
            triggers: updated.triggers,
            generated_tasks,
            already_complete: false,
        })
    }

    /// Create the phase's batch unless it already exists. Idempotence here
    /// is what makes post-failure generation retries safe.
    async fn ensure_tasks_inner(
        &self,
        project: &ProjectWorkflow,
        phase: WorkflowPhase,
    ) -> WorkflowResult<usize> {
        let project_id = project.id;
        let existing = self
            .db
            .call(move |db| db.tasks_for_phase(project_id, phase))
            .await?;
        if !existing.is_empty() {
            return Ok(0);
        }

        let tasks = self
            .generator
            .generate(self.directory.as_ref(), project, phase, Utc::now())
            .await?;
        let count = tasks.len();
        self.db.call(move |db| db.create_batch(&tasks)).await?;
        Ok(count)
    }

    async fn mutate_document<T, F>(
        &self,
        project_id: Uuid,
        document_type: &str,
        apply: F,
    ) -> WorkflowResult<(DocumentApprovalRecord, T)>
    where
        F: Fn(&mut DocumentApprovalRecord) -> WorkflowResult<T>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let doc_type = document_type.to_string();
            let mut record = self
                .db
                .call(move |db| db.document(project_id, &doc_type))
                .await?;
            let expected = record.record_version;
            let value = apply(&mut record)?;
            match self
                .db
                .call(move |db| db.update_document(record, expected))
                .await
            {
                Ok(stored) => return Ok((stored, value)),
                Err(err) if err.is_retryable() && attempts < 2 => {
                    tracing::debug!(
                        project_id = %project_id,
                        document_type = %document_type,
                        "retrying document mutation after conflict"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn append_history(
        &self,
        project_id: Uuid,
        phase: WorkflowPhase,
        action: &str,
        triggered_by: &str,
        metadata: serde_json::Value,
    ) -> WorkflowResult<()> {
        let entry = HistoryEntry::new(project_id, phase, action, triggered_by, metadata, Utc::now());
        self.db.call(move |db| db.append_history(&entry)).await
    }

    async fn notify_best_effort(&self, event: WorkflowEvent) {
        if let Err(err) = self.notifier.notify(event).await {
            tracing::warn!(error = %err, "notification sink failed; continuing");
        }
    }
}

// ── Authorization gates ───────────────────────────────────────────────────

/// Phase-level gate: an owned phase's task list and completion actions are
/// restricted to the owning department. Unowned phases pass through.
fn authorize_phase(phase: WorkflowPhase, actor: &Actor) -> WorkflowResult<()> {
    if let Some(required) = phase.owning_department() {
        if actor.department != required {
            return Err(WorkflowError::AccessDenied {
                department: actor.department.clone(),
                required: required.to_string(),
                phase,
            });
        }
    }
    Ok(())
}

/// Chain-level gate: a designated approver is checked by identity, otherwise
/// membership in the level's department suffices.
fn authorize_level(project: &ProjectWorkflow, level: &str, actor: &Actor) -> WorkflowResult<()> {
    let definition = project
        .approval_chain
        .iter()
        .find(|l| l.level == level)
        .ok_or_else(|| {
            WorkflowError::Validation(format!(
                "approval level '{}' is not in the project chain",
                level
            ))
        })?;
    let allowed = match definition.approver {
        Some(approver) => actor.id == approver,
        None => actor.department == definition.department,
    };
    if !allowed {
        return Err(WorkflowError::AccessDenied {
            department: actor.department.clone(),
            required: definition.department.clone(),
            phase: project.workflow_phase,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_project() -> ProjectWorkflow {
        ProjectWorkflow::new(
            "P",
            vec![
                ApprovalLevel {
                    level: "hod".into(),
                    department: "Operations".into(),
                    approver: None,
                },
                ApprovalLevel {
                    level: "executive".into(),
                    department: "Executive".into(),
                    approver: Some(Uuid::new_v4()),
                },
            ],
            vec!["boq".into()],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_authorize_phase_enforces_owning_department() {
        let ops = Actor::new("Asha", "Operations");
        let finance = Actor::new("Dana", "Finance & Accounting");

        assert!(authorize_phase(WorkflowPhase::Operations, &ops).is_ok());
        let err = authorize_phase(WorkflowPhase::Operations, &finance).unwrap_err();
        assert!(matches!(err, WorkflowError::AccessDenied { .. }));

        // Unowned phases pass through; their actions carry their own gates.
        assert!(authorize_phase(WorkflowPhase::Documentation, &finance).is_ok());
    }

    #[test]
    fn test_authorize_level_by_department_and_designated_approver() {
        let project = chain_project();

        let ops = Actor::new("Asha", "Operations");
        assert!(authorize_level(&project, "hod", &ops).is_ok());

        let outsider = Actor::new("Dana", "Procurement");
        assert!(matches!(
            authorize_level(&project, "hod", &outsider).unwrap_err(),
            WorkflowError::AccessDenied { .. }
        ));

        // The executive level is pinned to one approver; department alone
        // does not suffice.
        let exec_dept = Actor::new("Femi", "Executive");
        assert!(matches!(
            authorize_level(&project, "executive", &exec_dept).unwrap_err(),
            WorkflowError::AccessDenied { .. }
        ));
        let designated = Actor {
            id: project.approval_chain[1].approver.unwrap(),
            name: "Gbenga".into(),
            department: "Executive".into(),
        };
        assert!(authorize_level(&project, "executive", &designated).is_ok());

        assert!(matches!(
            authorize_level(&project, "unknown", &ops).unwrap_err(),
            WorkflowError::Validation(_)
        ));
    }
}
