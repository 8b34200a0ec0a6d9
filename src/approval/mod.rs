//! The per-document approval state machine.
//!
//! A `DocumentApprovalRecord` drives one document through the project's
//! ordered approval levels. The history vector is created eagerly at
//! submission — one entry per chain level, always — and the current-level
//! pointer only ever moves forward. Rejection is terminal; a mid-approval
//! document swap resets exactly the current level and leaves every other
//! entry untouched.
//!
//! All transitions here are pure; the store persists the mutated record
//! under optimistic concurrency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::project::ApprovalLevel;

pub mod hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// Metadata the engine reads from the external document content store.
/// Only these four fields participate in the change-detection fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One level's slot in a document's approval history. Created eagerly at
/// submission for every chain level; resolved in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelEntry {
    pub level: String,
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<Uuid>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Which document version this level acted on (or is acting on).
    pub document_version: i64,
    /// True when the document was swapped while this level was current.
    pub document_modified: bool,
    pub document_hash: String,
}

/// Append-only version trail. Version 1 is the submission itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub version: i64,
    pub document_id: Uuid,
    pub modified_by: Uuid,
    pub modified_at: DateTime<Utc>,
    /// Chain level that was current when this version was introduced.
    pub approval_level: String,
    pub content_hash: String,
}

/// Outcome of an approve/reject transition, for the orchestrator to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// The chain moved on to the named level.
    AdvancedTo { level: String },
    /// Every level approved; the chain is complete.
    ChainApproved,
    /// Rejected at the named level; the chain is halted permanently.
    ChainRejected { level: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentApprovalRecord {
    pub project_id: Uuid,
    /// Unique per project.
    pub document_type: String,
    /// Reference to the active document content (owned externally).
    pub document_id: Uuid,
    pub approval_status: ApprovalStatus,
    /// Index into the project's approval chain. Advances strictly forward.
    pub current_level: usize,
    pub approval_history: Vec<LevelEntry>,
    pub document_versions: Vec<DocumentVersion>,
    pub is_required: bool,
    pub submitted_by: Uuid,
    pub submitted_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every write.
    pub record_version: i64,
}

impl DocumentApprovalRecord {
    /// Initialize the record at submission time: one pending history entry
    /// per chain level, version 1 in the trail, current level at the head of
    /// the chain.
    pub fn submit(
        project_id: Uuid,
        document_type: &str,
        document_id: Uuid,
        chain: &[ApprovalLevel],
        meta: &DocumentMeta,
        submitted_by: Uuid,
        is_required: bool,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Self> {
        if chain.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "cannot submit '{}': project has no approval chain",
                document_type
            )));
        }
        let content_hash = hash::metadata_fingerprint(meta);
        let approval_history = chain
            .iter()
            .map(|level| LevelEntry {
                level: level.level.clone(),
                department: level.department.clone(),
                approver: None,
                status: ApprovalStatus::Pending,
                approved_at: None,
                comments: None,
                document_version: 1,
                document_modified: false,
                document_hash: content_hash.clone(),
            })
            .collect();

        Ok(Self {
            project_id,
            document_type: document_type.to_string(),
            document_id,
            approval_status: ApprovalStatus::Pending,
            current_level: 0,
            approval_history,
            document_versions: vec![DocumentVersion {
                version: 1,
                document_id,
                modified_by: submitted_by,
                modified_at: now,
                approval_level: chain[0].level.clone(),
                content_hash,
            }],
            is_required,
            submitted_by,
            submitted_at: now,
            record_version: 0,
        })
    }

    pub fn is_chain_complete(&self) -> bool {
        self.approval_status.is_terminal()
    }

    pub fn latest_version(&self) -> i64 {
        self.document_versions.last().map(|v| v.version).unwrap_or(1)
    }

    /// The level id currently awaiting action.
    pub fn current_level_id(&self) -> &str {
        &self.approval_history[self.current_level].level
    }

    /// Approve at `level`. Valid only when `level` is current and its entry
    /// is pending. Advances the pointer, or completes the chain at the last
    /// level.
    pub fn approve(
        &mut self,
        level: &str,
        approver: Uuid,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ChainOutcome> {
        self.check_actionable_at(level)?;
        let version = self.latest_version();
        let entry = &mut self.approval_history[self.current_level];
        if entry.status != ApprovalStatus::Pending {
            return Err(WorkflowError::InvalidState(format!(
                "level '{}' of '{}' is already {}",
                level,
                self.document_type,
                entry.status.as_str()
            )));
        }

        entry.status = ApprovalStatus::Approved;
        entry.approver = Some(approver);
        entry.approved_at = Some(now);
        entry.comments = comments;
        entry.document_version = version;

        if self.current_level + 1 < self.approval_history.len() {
            self.current_level += 1;
            Ok(ChainOutcome::AdvancedTo {
                level: self.current_level_id().to_string(),
            })
        } else {
            self.approval_status = ApprovalStatus::Approved;
            Ok(ChainOutcome::ChainApproved)
        }
    }

    /// Reject at `level`. Valid only at the current level. Terminal: the
    /// pointer freezes and every forward entry stays pending with no action
    /// possible.
    pub fn reject(
        &mut self,
        level: &str,
        approver: Uuid,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ChainOutcome> {
        self.check_actionable_at(level)?;
        let version = self.latest_version();
        let entry = &mut self.approval_history[self.current_level];
        entry.status = ApprovalStatus::Rejected;
        entry.approver = Some(approver);
        entry.approved_at = Some(now);
        entry.comments = comments;
        entry.document_version = version;

        self.approval_status = ApprovalStatus::Rejected;
        Ok(ChainOutcome::ChainRejected {
            level: level.to_string(),
        })
    }

    /// Swap the document mid-approval. Valid only at the current level,
    /// regardless of that level's entry status.
    ///
    /// Appends a version-trail entry with a fresh fingerprint, swaps the
    /// active `document_id`, and resets exactly the current level's entry to
    /// pending with `document_modified = true`. Levels already passed keep
    /// their approvals — they approved an earlier version, which the version
    /// trail records.
    pub fn supersede_document(
        &mut self,
        level: &str,
        new_document_id: Uuid,
        updated_by: Uuid,
        comments: Option<String>,
        meta: &DocumentMeta,
        now: DateTime<Utc>,
    ) -> WorkflowResult<i64> {
        if self.approval_status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "document '{}' is {}; its chain cannot be re-entered",
                self.document_type,
                self.approval_status.as_str()
            )));
        }
        if level != self.current_level_id() {
            return Err(WorkflowError::InvalidState(format!(
                "document '{}' is at level '{}', not '{}'",
                self.document_type,
                self.current_level_id(),
                level
            )));
        }

        let content_hash = hash::metadata_fingerprint(meta);
        let version = self.latest_version() + 1;
        self.document_versions.push(DocumentVersion {
            version,
            document_id: new_document_id,
            modified_by: updated_by,
            modified_at: now,
            approval_level: level.to_string(),
            content_hash: content_hash.clone(),
        });
        self.document_id = new_document_id;

        let entry = &mut self.approval_history[self.current_level];
        entry.status = ApprovalStatus::Pending;
        entry.approver = None;
        entry.approved_at = None;
        entry.comments = comments;
        entry.document_version = version;
        entry.document_modified = true;
        entry.document_hash = content_hash;

        Ok(version)
    }

    fn check_actionable_at(&self, level: &str) -> WorkflowResult<()> {
        if self.approval_status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "document '{}' is already {}",
                self.document_type,
                self.approval_status.as_str()
            )));
        }
        if level != self.current_level_id() {
            return Err(WorkflowError::InvalidState(format!(
                "document '{}' is awaiting level '{}', not '{}'",
                self.document_type,
                self.current_level_id(),
                level
            )));
        }
        Ok(())
    }
}
