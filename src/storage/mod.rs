// Persistence boundary. Every method is one atomic unit: it either fully
// applies or leaves the store untouched.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::documents::{Attachment, Document, DocumentFilter, DocumentType, Sp2d};
use crate::errors::WorkflowResult;
use crate::numbering::{AllocatedNumber, AllocationRequest, NumberSeries, ScopeKey, Template};
use crate::otp::{EmergencyAudit, EmergencyState, OneTimeCode, OtpConsumption, OtpPurpose};
use crate::roles::{Role, RoleAssignment};
use crate::workflows::{AuditRecord, Sp2dStatus, SpmStatus};

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Which number field of an SPM an allocation fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberField {
    Antrian,
    Berkas,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberAssignment {
    pub field: NumberField,
    pub request: AllocationRequest,
}

/// SP2D work done inside an SPM transition commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sp2dChange {
    /// Create the SP2D; its number is minted from `request` in the same
    /// commit.
    Issue {
        sp2d_id: Uuid,
        nilai: i64,
        request: AllocationRequest,
        audit: AuditRecord,
    },
    SetStatus {
        sp2d_id: Uuid,
        expected_version: i64,
        status: Sp2dStatus,
        audit: AuditRecord,
    },
}

/// A fully validated SPM status change, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCommit {
    pub document_id: Uuid,
    pub expected_version: i64,
    pub to: SpmStatus,
    pub submitted_on: Option<NaiveDate>,
    pub archive: bool,
    pub numbers: Vec<NumberAssignment>,
    pub sp2d: Option<Sp2dChange>,
    pub audit: AuditRecord,
    pub consume_otp: Option<OtpConsumption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub document: Document,
    pub sp2d: Option<Sp2d>,
    pub allocated: Vec<AllocatedNumber>,
}

/// New values for an SP2D confirmation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sp2dUpdate {
    pub sp2d_id: Uuid,
    pub expected_version: i64,
    pub status: Sp2dStatus,
    pub nomor_penguji: Option<String>,
    pub bank_reference: Option<String>,
    pub tanggal_cair: Option<NaiveDate>,
    pub audit: AuditRecord,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // Documents

    /// Insert a new draft together with its creation audit row.
    async fn insert_document(&self, doc: &Document, audit: &AuditRecord) -> WorkflowResult<()>;

    async fn get_document(&self, id: Uuid) -> WorkflowResult<Option<Document>>;

    /// Replace the editable content of a draft (compare-and-swap on version).
    async fn update_document(&self, doc: &Document, expected_version: i64) -> WorkflowResult<Document>;

    /// Physically remove a document still in `draft`, with its tax lines.
    async fn delete_draft(&self, id: Uuid, expected_version: i64) -> WorkflowResult<()>;

    async fn add_attachment(&self, id: Uuid, attachment: &Attachment) -> WorkflowResult<()>;

    async fn list_documents(&self, filter: &DocumentFilter) -> WorkflowResult<Vec<Document>>;

    async fn commit_transition(&self, commit: TransitionCommit) -> WorkflowResult<TransitionOutcome>;

    // SP2D

    async fn get_sp2d(&self, id: Uuid) -> WorkflowResult<Option<Sp2d>>;

    async fn sp2d_for_spm(&self, spm_id: Uuid) -> WorkflowResult<Option<Sp2d>>;

    async fn update_sp2d(&self, update: Sp2dUpdate) -> WorkflowResult<Sp2d>;

    // Numbering

    /// Increment-and-fetch for one scope, render, and record in the issued
    /// ledger. Creates the scope row lazily.
    async fn allocate_number(&self, request: &AllocationRequest) -> WorkflowResult<AllocatedNumber>;

    /// Zero the counter and start a new epoch.
    async fn reset_counter(&self, scope: &ScopeKey) -> WorkflowResult<()>;

    async fn counter(&self, scope: &ScopeKey) -> WorkflowResult<Option<u64>>;

    async fn set_number_format(&self, series: NumberSeries, year: i32, template: &Template) -> WorkflowResult<()>;

    async fn number_format(&self, series: NumberSeries, year: i32) -> WorkflowResult<Option<Template>>;

    async fn is_number_issued(&self, scope: &ScopeKey, number: &str) -> WorkflowResult<bool>;

    // Roles

    /// Insert an active assignment. Fails with `SingleHolderConflict` if the
    /// role is single-holder and already actively held.
    async fn insert_role_assignment(&self, assignment: &RoleAssignment) -> WorkflowResult<()>;

    /// Returns false if the user held no active assignment of that role.
    async fn deactivate_role(&self, user_id: &str, role: Role) -> WorkflowResult<bool>;

    async fn active_roles(&self, user_id: &str) -> WorkflowResult<Vec<RoleAssignment>>;

    async fn active_holders(&self, role: Role) -> WorkflowResult<Vec<RoleAssignment>>;

    // Audit

    async fn audit_trail(&self, doc_type: DocumentType, id: Uuid) -> WorkflowResult<Vec<AuditRecord>>;

    // One-time codes and emergency mode

    /// Store a code, replacing any earlier code of the same user and purpose.
    async fn store_otp(&self, otp: &OneTimeCode) -> WorkflowResult<()>;

    async fn find_otp(&self, user_id: &str, purpose: OtpPurpose) -> WorkflowResult<Option<OneTimeCode>>;

    /// Count a wrong guess against the live code and burn it once
    /// `max_attempts` is reached. Returns the new count, or 0 when no live
    /// code exists.
    async fn record_otp_failure(&self, user_id: &str, purpose: OtpPurpose, max_attempts: u32) -> WorkflowResult<u32>;

    async fn emergency_state(&self) -> WorkflowResult<EmergencyState>;

    async fn set_emergency_state(&self, state: &EmergencyState, audit: &EmergencyAudit) -> WorkflowResult<()>;

    async fn emergency_history(&self) -> WorkflowResult<Vec<EmergencyAudit>>;
}
