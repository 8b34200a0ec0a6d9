//! Project and document persistence: phase/trigger writes are conditional on
//! `record_version`; a zero-row update is disambiguated by a confirming
//! re-read into `NotFound` or `ConcurrentModification`.

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::{WorkflowDb, parse_json, parse_phase, parse_timestamp, parse_uuid};
use crate::approval::DocumentApprovalRecord;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::phase::{PhaseAdvance, TriggerKind};
use crate::project::{ProjectWorkflow, WorkflowTriggers};

impl WorkflowDb {
    pub fn insert_project(&self, project: &ProjectWorkflow) -> WorkflowResult<()> {
        self.conn.execute(
            "INSERT INTO projects (id, name, workflow_phase, workflow_step,
                                   inventory_created, procurement_initiated, financial_setup,
                                   approval_chain, required_documents, record_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                project.id.to_string(),
                project.name,
                project.workflow_phase.as_str(),
                project.workflow_step,
                project.triggers.inventory_created,
                project.triggers.procurement_initiated,
                project.triggers.financial_setup,
                serde_json::to_string(&project.approval_chain)?,
                serde_json::to_string(&project.required_documents)?,
                project.record_version,
                project.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn project(&self, id: Uuid) -> WorkflowResult<ProjectWorkflow> {
        self.conn
            .query_row(
                "SELECT id, name, workflow_phase, workflow_step,
                        inventory_created, procurement_initiated, financial_setup,
                        approval_chain, required_documents, record_version, created_at
                 FROM projects WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(ProjectWorkflow {
                        id: parse_uuid(0, row.get(0)?)?,
                        name: row.get(1)?,
                        workflow_phase: parse_phase(2, row.get(2)?)?,
                        workflow_step: row.get(3)?,
                        triggers: WorkflowTriggers {
                            inventory_created: row.get(4)?,
                            procurement_initiated: row.get(5)?,
                            financial_setup: row.get(6)?,
                        },
                        approval_chain: parse_json(7, row.get(7)?)?,
                        required_documents: parse_json(8, row.get(8)?)?,
                        record_version: row.get(9)?,
                        created_at: parse_timestamp(10, row.get(10)?)?,
                    })
                },
            )
            .optional()?
            .ok_or(WorkflowError::ProjectNotFound { id })
    }

    /// Apply a planned phase advance, conditional on the version the caller
    /// read. The trigger flip rides in the same statement so phase, step,
    /// and flag change atomically.
    pub fn advance_project(
        &self,
        id: Uuid,
        expected_version: i64,
        advance: &PhaseAdvance,
    ) -> WorkflowResult<ProjectWorkflow> {
        let trigger_clause = match advance.trigger {
            Some(TriggerKind::InventoryCreated) => ", inventory_created = 1",
            Some(TriggerKind::ProcurementInitiated) => ", procurement_initiated = 1",
            Some(TriggerKind::FinancialSetup) => ", financial_setup = 1",
            None => "",
        };
        // Column fragment comes from the closed TriggerKind enum, never from
        // caller input.
        let sql = format!(
            "UPDATE projects
             SET workflow_phase = ?1, workflow_step = ?2,
                 record_version = record_version + 1{trigger_clause}
             WHERE id = ?3 AND record_version = ?4 AND workflow_step <= ?2"
        );
        let updated = self.conn.execute(
            &sql,
            params![
                advance.next_phase.as_str(),
                advance.next_step,
                id.to_string(),
                expected_version,
            ],
        )?;
        if updated == 0 {
            // Disambiguate: missing row vs. stale version.
            let _ = self.project(id)?;
            return Err(WorkflowError::ConcurrentModification {
                entity: "project",
                id,
            });
        }
        self.project(id)
    }

    /// Flip a single trigger. Idempotent: returns `false` when the flag was
    /// already set.
    pub fn set_trigger(&self, id: Uuid, trigger: TriggerKind) -> WorkflowResult<bool> {
        let column = match trigger {
            TriggerKind::InventoryCreated => "inventory_created",
            TriggerKind::ProcurementInitiated => "procurement_initiated",
            TriggerKind::FinancialSetup => "financial_setup",
        };
        let sql = format!(
            "UPDATE projects SET {column} = 1, record_version = record_version + 1
             WHERE id = ?1 AND {column} = 0"
        );
        let updated = self.conn.execute(&sql, [id.to_string()])?;
        if updated == 0 {
            // Confirm the project exists; an already-set flag is a no-op.
            let _ = self.project(id)?;
            return Ok(false);
        }
        Ok(true)
    }

    // ── Document approval records ─────────────────────────────────────────

    /// Insert a freshly submitted record. The (project, document_type) key
    /// is unique; a duplicate submission is an `InvalidState` refusal.
    pub fn insert_document(&self, record: &DocumentApprovalRecord) -> WorkflowResult<()> {
        let result = self.conn.execute(
            "INSERT INTO documents (project_id, document_type, record, record_version)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.project_id.to_string(),
                record.document_type,
                serde_json::to_string(record)?,
                record.record_version,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(WorkflowError::InvalidState(format!(
                    "document '{}' is already submitted on project {}",
                    record.document_type, record.project_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn document(
        &self,
        project_id: Uuid,
        document_type: &str,
    ) -> WorkflowResult<DocumentApprovalRecord> {
        self.conn
            .query_row(
                "SELECT record FROM documents WHERE project_id = ?1 AND document_type = ?2",
                params![project_id.to_string(), document_type],
                |row| parse_json::<DocumentApprovalRecord>(0, row.get(0)?),
            )
            .optional()?
            .ok_or_else(|| WorkflowError::DocumentNotFound {
                project_id,
                document_type: document_type.to_string(),
            })
    }

    /// Persist a mutated record, conditional on the version the caller read.
    /// Bumps the version inside the stored JSON and the column together.
    pub fn update_document(
        &self,
        mut record: DocumentApprovalRecord,
        expected_version: i64,
    ) -> WorkflowResult<DocumentApprovalRecord> {
        record.record_version = expected_version + 1;
        let updated = self.conn.execute(
            "UPDATE documents SET record = ?1, record_version = ?2
             WHERE project_id = ?3 AND document_type = ?4 AND record_version = ?5",
            params![
                serde_json::to_string(&record)?,
                record.record_version,
                record.project_id.to_string(),
                record.document_type,
                expected_version,
            ],
        )?;
        if updated == 0 {
            let _ = self.document(record.project_id, &record.document_type)?;
            return Err(WorkflowError::ConcurrentModification {
                entity: "document",
                id: record.document_id,
            });
        }
        Ok(record)
    }

    /// Replace a terminal (rejected) record with a fresh submission, keeping
    /// the optimistic-concurrency lineage on the row.
    pub fn replace_document(
        &self,
        record: DocumentApprovalRecord,
        expected_version: i64,
    ) -> WorkflowResult<DocumentApprovalRecord> {
        self.update_document(record, expected_version)
    }

    pub fn documents_for_project(
        &self,
        project_id: Uuid,
    ) -> WorkflowResult<Vec<DocumentApprovalRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM documents WHERE project_id = ?1 ORDER BY document_type",
        )?;
        let rows = stmt.query_map([project_id.to_string()], |row| {
            parse_json::<DocumentApprovalRecord>(0, row.get(0)?)
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
