// SPM workflow engine. Every state change is validated against the
// transition table and then handed to the store as one atomic commit:
// either the whole transition lands or nothing does.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::audit::AuditRecord;
use super::states::{Action, Sp2dStatus, SpmStatus};
use super::transitions::{allowed_actions, find_rule, Effect};
use crate::attachments::FileStorage;
use crate::clock::{local_date, Clock, SystemClock};
use crate::documents::{
    suggested_lines, validate_draft, Attachment, Document, DocumentFilter, DocumentType, DraftContent,
    JenisSpm, Sp2d, TaxLineInput,
};
use crate::errors::{ErrorKind, WorkflowError, WorkflowResult};
use crate::notifications::{NotificationDispatcher, NotificationEvent};
use crate::numbering::{AllocatedNumber, NumberSeries, NumberingAllocator, SeriesTemplates};
use crate::observability::{create_transition_span, workflow_metrics, OperationTimer};
use crate::otp::{GateDecision, IssuedCode, OtpGate, OtpPurpose, OtpSettings};
use crate::roles::{Actor, Role, RoleRegistry};
use crate::storage::{
    NumberAssignment, NumberField, Sp2dChange, Sp2dUpdate, TransitionCommit, WorkflowStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub minimum_nilai: i64,
    /// Office timezone; numbering scopes follow the local calendar.
    pub utc_offset: FixedOffset,
}

/// Western Indonesia Time, UTC+7.
pub const WIB: FixedOffset = match FixedOffset::east_opt(7 * 3600) {
    Some(offset) => offset,
    None => panic!("UTC+7 is a valid offset"),
};

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            minimum_nilai: 1,
            utc_offset: WIB,
        }
    }
}

/// Caller-supplied part of a transition request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionInput {
    /// Version the caller last read; the commit fails if it moved.
    pub expected_version: i64,
    pub note: Option<String>,
    pub otp_code: Option<String>,
}

impl TransitionInput {
    pub fn new(expected_version: i64) -> Self {
        Self {
            expected_version,
            ..Self::default()
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_otp(mut self, code: impl Into<String>) -> Self {
        self.otp_code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub previous: SpmStatus,
    pub document: Document,
    pub sp2d: Option<Sp2d>,
    pub allocated: Vec<AllocatedNumber>,
    /// The one-time-code gate was skipped because emergency mode is on.
    pub emergency_bypass: bool,
}

/// Role expected to act next on a document sitting in `status`.
pub fn reviewer_for(status: SpmStatus) -> Option<Role> {
    match status {
        SpmStatus::Diajukan | SpmStatus::ResepsionisVerifikasi => Some(Role::Resepsionis),
        SpmStatus::PbmdVerifikasi => Some(Role::Pbmd),
        SpmStatus::AkuntansiVerifikasi => Some(Role::Akuntansi),
        SpmStatus::PerbendaharaanVerifikasi => Some(Role::Perbendaharaan),
        SpmStatus::KepalaBkadReview => Some(Role::KepalaBkad),
        _ => None,
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    files: Arc<dyn FileStorage>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    templates: SeriesTemplates,
    otp_settings: OtpSettings,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, files: Arc<dyn FileStorage>) -> Self {
        Self {
            store,
            files,
            dispatcher: NotificationDispatcher::default(),
            clock: Arc::new(SystemClock),
            templates: SeriesTemplates::default(),
            otp_settings: OtpSettings::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_templates(mut self, templates: SeriesTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_otp_settings(mut self, otp_settings: OtpSettings) -> Self {
        self.otp_settings = otp_settings;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn allocator(&self) -> NumberingAllocator {
        NumberingAllocator::new(self.store.clone(), self.templates.clone())
    }

    pub fn roles(&self) -> RoleRegistry {
        RoleRegistry::new(self.store.clone())
    }

    pub fn otp_gate(&self) -> OtpGate {
        OtpGate::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.clock.clone(),
            self.otp_settings,
        )
    }

    /// Resolve a user id into an actor carrying their active roles.
    pub async fn actor(&self, user_id: &str) -> WorkflowResult<Actor> {
        self.roles().actor(user_id).await
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        local_date(now, self.settings.utc_offset)
    }

    async fn load(&self, id: Uuid) -> WorkflowResult<Document> {
        self.store.get_document(id).await?.ok_or(WorkflowError::NotFound {
            doc_type: DocumentType::Spm,
            id,
        })
    }

    async fn load_sp2d(&self, id: Uuid) -> WorkflowResult<Sp2d> {
        self.store.get_sp2d(id).await?.ok_or(WorkflowError::NotFound {
            doc_type: DocumentType::Sp2d,
            id,
        })
    }

    // Drafts

    pub async fn create_draft(&self, actor: &Actor, opd_id: &str, content: DraftContent) -> WorkflowResult<Document> {
        let opd_id = opd_id.trim();
        if opd_id.is_empty() {
            return Err(WorkflowError::validation("opd_id", "spending unit is required"));
        }
        if !actor.can_submit_for(opd_id) {
            return Err(WorkflowError::unauthorized(format!(
                "user `{}` is not a treasury officer of OPD `{opd_id}`",
                actor.user_id
            )));
        }
        let tax_lines = validate_draft(&content, self.settings.minimum_nilai)?;

        let now = self.clock.now();
        let doc = Document {
            id: Uuid::new_v4(),
            doc_type: DocumentType::Spm,
            opd_id: opd_id.to_string(),
            program_id: content.program_id.trim().to_string(),
            kegiatan_id: content.kegiatan_id.trim().to_string(),
            sub_kegiatan_id: content.sub_kegiatan_id.trim().to_string(),
            jenis: content.jenis,
            nilai: content.nilai,
            uraian: content.uraian.trim().to_string(),
            vendor_id: normalized_vendor(content.vendor_id),
            tanggal_pengajuan: None,
            status: SpmStatus::Draft,
            version: 1,
            nomor_antrian: None,
            nomor_berkas: None,
            nomor_sp2d: None,
            tax_lines,
            attachments: Vec::new(),
            archived: false,
            created_by: actor.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        let audit = AuditRecord::spm(doc.id, &actor.user_id, Action::Create, None, SpmStatus::Draft, None, now);
        self.store.insert_document(&doc, &audit).await?;
        info!(document = %doc.id, opd = %doc.opd_id, jenis = %doc.jenis.as_str(), nilai = doc.nilai, "SPM draft created");
        Ok(doc)
    }

    /// Replace the content of a document still in `draft` or `perlu_revisi`.
    pub async fn update_draft(
        &self,
        actor: &Actor,
        id: Uuid,
        expected_version: i64,
        content: DraftContent,
    ) -> WorkflowResult<Document> {
        let doc = self.load(id).await?;
        if !doc.is_editable() {
            return Err(WorkflowError::validation(
                "status",
                format!("a {} document cannot be edited", doc.status),
            ));
        }
        if !actor.can_submit_for(&doc.opd_id) {
            return Err(WorkflowError::unauthorized(format!(
                "user `{}` may not edit SPMs of OPD `{}`",
                actor.user_id, doc.opd_id
            )));
        }
        let tax_lines = validate_draft(&content, self.settings.minimum_nilai)?;

        let updated = Document {
            program_id: content.program_id.trim().to_string(),
            kegiatan_id: content.kegiatan_id.trim().to_string(),
            sub_kegiatan_id: content.sub_kegiatan_id.trim().to_string(),
            jenis: content.jenis,
            nilai: content.nilai,
            uraian: content.uraian.trim().to_string(),
            vendor_id: normalized_vendor(content.vendor_id),
            tax_lines,
            updated_at: self.clock.now(),
            ..doc
        };
        let stored = self
            .store
            .update_document(&updated, expected_version)
            .await
            .inspect_err(record_failure)?;
        info!(document = %id, version = stored.version, "SPM content updated");
        Ok(stored)
    }

    /// Physically delete a draft. Owner or administrator only.
    pub async fn delete_draft(&self, actor: &Actor, id: Uuid, expected_version: i64) -> WorkflowResult<()> {
        let doc = self.load(id).await?;
        if doc.status != SpmStatus::Draft {
            return Err(WorkflowError::validation(
                "status",
                "only drafts can be deleted; archive the document instead",
            ));
        }
        if doc.created_by != actor.user_id && !actor.is_administrator() {
            return Err(WorkflowError::unauthorized("only the author or an administrator may delete a draft"));
        }
        self.store
            .delete_draft(id, expected_version)
            .await
            .inspect_err(record_failure)?;
        info!(document = %id, actor = %actor.user_id, "SPM draft deleted");
        Ok(())
    }

    // Transitions

    /// Apply `action` to document `id` on behalf of `actor`.
    pub async fn transition(
        &self,
        actor: &Actor,
        id: Uuid,
        action: Action,
        input: TransitionInput,
    ) -> WorkflowResult<TransitionResult> {
        let span = create_transition_span(&id.to_string(), action.as_str(), &actor.user_id);
        async {
            let timer = OperationTimer::new("spm_transition");
            let result = self.apply_transition(actor, id, action, input).await;
            timer.finish();
            match &result {
                Ok(outcome) => {
                    workflow_metrics().record_transition();
                    self.notify_after(actor, action, outcome).await;
                }
                Err(e) => {
                    record_failure(e);
                    warn!(error = %e, kind = ?e.kind(), "Transition refused");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn apply_transition(
        &self,
        actor: &Actor,
        id: Uuid,
        action: Action,
        input: TransitionInput,
    ) -> WorkflowResult<TransitionResult> {
        let doc = self.load(id).await?;
        if doc.archived {
            return Err(WorkflowError::validation("status", "archived documents accept no transitions"));
        }
        if doc.version != input.expected_version {
            return Err(WorkflowError::StaleVersion {
                doc_type: DocumentType::Spm,
                id,
                expected: input.expected_version,
            });
        }
        let rule = find_rule(doc.status, action).ok_or_else(|| {
            WorkflowError::validation(
                "action",
                format!(
                    "`{action}` is not allowed from {}; allowed: {:?}",
                    doc.status,
                    allowed_actions(doc.status)
                ),
            )
        })?;
        rule.authorize(actor, &doc)?;
        let mut note = rule.check_note(input.note.as_deref())?;

        if rule.effect == Effect::AllocateIntakeNumbers {
            // Settings may have tightened since the draft was saved.
            validate_draft(&content_of(&doc), self.settings.minimum_nilai)?;
        }

        let decision = match rule.gate {
            Some(purpose) => Some(self.otp_gate().check(actor, purpose, input.otp_code.as_deref()).await?),
            None => None,
        };
        let emergency_bypass = matches!(decision, Some(GateDecision::Bypassed));
        let consume_otp = match decision {
            Some(GateDecision::Verified(consumption)) => Some(consumption),
            _ => None,
        };
        if emergency_bypass {
            note = Some(match note {
                Some(n) => format!("{n} [mode darurat: OTP dilewati]"),
                None => "[mode darurat: OTP dilewati]".to_string(),
            });
        }

        let now = self.clock.now();
        let today = self.today(now);
        let allocator = self.allocator();
        let mut numbers = Vec::new();
        let mut submitted_on = None;
        let mut sp2d = None;

        match rule.effect {
            Effect::None => {}
            Effect::AllocateIntakeNumbers => {
                if doc.tanggal_pengajuan.is_none() {
                    submitted_on = Some(today);
                }
                if doc.nomor_antrian.is_none() {
                    numbers.push(NumberAssignment {
                        field: NumberField::Antrian,
                        request: allocator.request(NumberSeries::Antrian, today, Some(id)),
                    });
                }
                if doc.nomor_berkas.is_none() {
                    numbers.push(NumberAssignment {
                        field: NumberField::Berkas,
                        request: allocator.request(NumberSeries::Berkas, today, Some(id)),
                    });
                }
            }
            Effect::IssueSp2d => {
                if self.store.sp2d_for_spm(id).await?.is_none() {
                    let sp2d_id = Uuid::new_v4();
                    sp2d = Some(Sp2dChange::Issue {
                        sp2d_id,
                        nilai: doc.nilai_bersih(),
                        request: allocator.request(NumberSeries::Sp2d, today, Some(sp2d_id)),
                        audit: AuditRecord::sp2d(
                            sp2d_id,
                            &actor.user_id,
                            Action::IssueSp2d,
                            None,
                            Sp2dStatus::MenungguPersetujuan,
                            None,
                            now,
                        ),
                    });
                }
            }
            Effect::ReleaseSp2d => {
                let existing = self.store.sp2d_for_spm(id).await?.ok_or_else(|| {
                    WorkflowError::Storage(format!("SPM {id} reached head review without an SP2D"))
                })?;
                sp2d = Some(self.sp2d_status_change(&existing, Sp2dStatus::SiapKirim, actor, Action::Approve, None, now));
            }
            Effect::VoidSp2d => {
                if let Some(existing) = self.store.sp2d_for_spm(id).await? {
                    if existing.status != Sp2dStatus::Dibatalkan {
                        sp2d = Some(self.sp2d_status_change(
                            &existing,
                            Sp2dStatus::Dibatalkan,
                            actor,
                            Action::Reject,
                            note.clone(),
                            now,
                        ));
                    }
                }
            }
        }

        let audit = AuditRecord::spm(id, &actor.user_id, action, Some(doc.status), rule.to, note, now);
        let outcome = self
            .store
            .commit_transition(TransitionCommit {
                document_id: id,
                expected_version: input.expected_version,
                to: rule.to,
                submitted_on,
                archive: false,
                numbers,
                sp2d,
                audit,
                consume_otp,
            })
            .await?;

        for number in &outcome.allocated {
            workflow_metrics().record_allocation();
            info!(scope = %number.scope, number = %number.number, "Number allocated in transition");
        }
        info!(
            document = %id,
            from = %doc.status,
            to = %outcome.document.status,
            version = outcome.document.version,
            emergency_bypass,
            "SPM transition committed"
        );

        Ok(TransitionResult {
            previous: doc.status,
            document: outcome.document,
            sp2d: outcome.sp2d,
            allocated: outcome.allocated,
            emergency_bypass,
        })
    }

    fn sp2d_status_change(
        &self,
        sp2d: &Sp2d,
        to: Sp2dStatus,
        actor: &Actor,
        action: Action,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Sp2dChange {
        Sp2dChange::SetStatus {
            sp2d_id: sp2d.id,
            expected_version: sp2d.version,
            status: to,
            audit: AuditRecord::sp2d(sp2d.id, &actor.user_id, action, Some(sp2d.status), to, note, now),
        }
    }

    async fn notify_after(&self, actor: &Actor, action: Action, outcome: &TransitionResult) {
        let doc = &outcome.document;
        if doc.created_by != actor.user_id {
            self.dispatcher
                .notify(
                    &doc.created_by,
                    &NotificationEvent::StatusChanged {
                        document_id: doc.id,
                        from: outcome.previous.to_string(),
                        to: doc.status.to_string(),
                        note: None,
                    },
                )
                .await;
        }
        if let Some(role) = reviewer_for(doc.status) {
            match self.store.active_holders(role).await {
                Ok(holders) => {
                    let event = NotificationEvent::AwaitingReview {
                        document_id: doc.id,
                        stage: doc.status.label().to_string(),
                    };
                    for holder in holders {
                        self.dispatcher.notify(&holder.user_id, &event).await;
                    }
                }
                Err(e) => warn!(role = %role, error = %e, "Could not look up reviewers to notify"),
            }
        }
        if action == Action::Approve {
            if let Some(number) = outcome.allocated.iter().find(|n| n.scope.series == NumberSeries::Sp2d) {
                self.dispatcher
                    .notify(
                        &doc.created_by,
                        &NotificationEvent::Sp2dIssued {
                            spm_id: doc.id,
                            nomor_sp2d: number.number.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Soft-archive a submitted document. Drafts are deleted instead.
    pub async fn archive(
        &self,
        actor: &Actor,
        id: Uuid,
        expected_version: i64,
        note: Option<&str>,
    ) -> WorkflowResult<Document> {
        if !actor.is_administrator() {
            return Err(WorkflowError::unauthorized("only an administrator may archive documents"));
        }
        let doc = self.load(id).await?;
        if doc.status == SpmStatus::Draft {
            return Err(WorkflowError::validation("status", "drafts are deleted, not archived"));
        }
        if doc.archived {
            return Err(WorkflowError::validation("status", "document is already archived"));
        }
        let note = note.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        let now = self.clock.now();
        let outcome = self
            .store
            .commit_transition(TransitionCommit {
                document_id: id,
                expected_version,
                to: doc.status,
                submitted_on: None,
                archive: true,
                numbers: Vec::new(),
                sp2d: None,
                audit: AuditRecord::spm(id, &actor.user_id, Action::Archive, Some(doc.status), doc.status, note, now),
                consume_otp: None,
            })
            .await
            .inspect_err(record_failure)?;
        info!(document = %id, actor = %actor.user_id, "SPM archived");
        Ok(outcome.document)
    }

    /// Store a file for the document and record its reference.
    pub async fn attach(
        &self,
        actor: &Actor,
        id: Uuid,
        file_name: &str,
        content: &[u8],
    ) -> WorkflowResult<Attachment> {
        let doc = self.load(id).await?;
        if doc.archived {
            return Err(WorkflowError::validation("status", "archived documents accept no attachments"));
        }
        if !actor.can_submit_for(&doc.opd_id) {
            return Err(WorkflowError::unauthorized(format!(
                "user `{}` may not attach files to SPMs of OPD `{}`",
                actor.user_id, doc.opd_id
            )));
        }
        let reference = self.files.store(id, file_name, content).await?;
        let attachment = Attachment {
            reference,
            file_name: file_name.trim().to_string(),
            uploaded_by: actor.user_id.clone(),
            uploaded_at: self.clock.now(),
        };
        if let Err(err) = self.store.add_attachment(id, &attachment).await {
            if let Err(cleanup) = self.files.remove(&attachment.reference).await {
                warn!(reference = %attachment.reference, error = %cleanup, "Orphaned attachment left in file storage");
            }
            return Err(err);
        }
        info!(document = %id, reference = %attachment.reference, "Attachment added");
        Ok(attachment)
    }

    pub async fn read_attachment(&self, reference: &str) -> WorkflowResult<Vec<u8>> {
        self.files.retrieve(reference).await
    }

    // SP2D confirmation

    /// `siap_kirim → dikirim_bank`, recording the tester number.
    pub async fn dispatch_sp2d(
        &self,
        actor: &Actor,
        sp2d_id: Uuid,
        expected_version: i64,
        nomor_penguji: &str,
    ) -> WorkflowResult<Sp2d> {
        require_treasury(actor)?;
        let nomor_penguji = nomor_penguji.trim();
        if nomor_penguji.is_empty() {
            return Err(WorkflowError::validation("nomor_penguji", "tester number is required"));
        }
        let sp2d = self.load_sp2d(sp2d_id).await?;
        expect_sp2d_status(&sp2d, Sp2dStatus::SiapKirim, Action::Dispatch)?;

        let now = self.clock.now();
        let updated = self
            .store
            .update_sp2d(Sp2dUpdate {
                sp2d_id,
                expected_version,
                status: Sp2dStatus::DikirimBank,
                nomor_penguji: Some(nomor_penguji.to_string()),
                bank_reference: None,
                tanggal_cair: None,
                audit: AuditRecord::sp2d(
                    sp2d_id,
                    &actor.user_id,
                    Action::Dispatch,
                    Some(sp2d.status),
                    Sp2dStatus::DikirimBank,
                    Some(format!("nomor penguji {nomor_penguji}")),
                    now,
                ),
            })
            .await
            .inspect_err(record_failure)?;
        info!(sp2d = %sp2d_id, nomor = %updated.nomor_sp2d, "SP2D dispatched to bank");
        Ok(updated)
    }

    /// `dikirim_bank → cair`, recording the bank's confirmation.
    pub async fn record_execution(
        &self,
        actor: &Actor,
        sp2d_id: Uuid,
        expected_version: i64,
        bank_reference: &str,
        tanggal_cair: NaiveDate,
    ) -> WorkflowResult<Sp2d> {
        require_treasury(actor)?;
        let bank_reference = bank_reference.trim();
        if bank_reference.is_empty() {
            return Err(WorkflowError::validation("bank_reference", "bank reference is required"));
        }
        let now = self.clock.now();
        if tanggal_cair > self.today(now) {
            return Err(WorkflowError::validation("tanggal_cair", "confirmation date lies in the future"));
        }
        let sp2d = self.load_sp2d(sp2d_id).await?;
        expect_sp2d_status(&sp2d, Sp2dStatus::DikirimBank, Action::RecordExecution)?;

        let updated = self
            .store
            .update_sp2d(Sp2dUpdate {
                sp2d_id,
                expected_version,
                status: Sp2dStatus::Cair,
                nomor_penguji: None,
                bank_reference: Some(bank_reference.to_string()),
                tanggal_cair: Some(tanggal_cair),
                audit: AuditRecord::sp2d(
                    sp2d_id,
                    &actor.user_id,
                    Action::RecordExecution,
                    Some(sp2d.status),
                    Sp2dStatus::Cair,
                    Some(format!("referensi bank {bank_reference}")),
                    now,
                ),
            })
            .await
            .inspect_err(record_failure)?;
        info!(sp2d = %sp2d_id, nomor = %updated.nomor_sp2d, "SP2D disbursed");
        Ok(updated)
    }

    // One-time codes and emergency mode

    pub async fn request_otp(&self, actor: &Actor, purpose: OtpPurpose) -> WorkflowResult<IssuedCode> {
        self.otp_gate().issue(actor, purpose).await
    }

    pub async fn set_emergency(&self, actor: &Actor, active: bool, reason: &str) -> WorkflowResult<()> {
        self.otp_gate().set_emergency(actor, active, reason).await?;
        Ok(())
    }

    // Queries

    pub async fn document(&self, id: Uuid) -> WorkflowResult<Document> {
        self.load(id).await
    }

    pub async fn sp2d(&self, id: Uuid) -> WorkflowResult<Sp2d> {
        self.load_sp2d(id).await
    }

    pub async fn sp2d_for_spm(&self, spm_id: Uuid) -> WorkflowResult<Option<Sp2d>> {
        self.store.sp2d_for_spm(spm_id).await
    }

    /// Audit trail of an SPM and of its SP2D, oldest first.
    pub async fn history(&self, id: Uuid) -> WorkflowResult<Vec<AuditRecord>> {
        let mut trail = self.store.audit_trail(DocumentType::Spm, id).await?;
        if let Some(sp2d) = self.store.sp2d_for_spm(id).await? {
            trail.extend(self.store.audit_trail(DocumentType::Sp2d, sp2d.id).await?);
        }
        trail.sort_by_key(|record| record.at);
        Ok(trail)
    }

    pub async fn list_documents(&self, filter: &DocumentFilter) -> WorkflowResult<Vec<Document>> {
        self.store.list_documents(filter).await
    }

    /// Number of matching documents in each status, in workflow order.
    pub async fn status_summary(&self, filter: &DocumentFilter) -> WorkflowResult<Vec<(SpmStatus, usize)>> {
        let docs = self.store.list_documents(filter).await?;
        Ok(SpmStatus::ALL
            .into_iter()
            .map(|status| (status, docs.iter().filter(|d| d.status == status).count()))
            .collect())
    }

    pub fn suggested_lines(&self, jenis: JenisSpm, nilai: i64) -> Vec<TaxLineInput> {
        suggested_lines(jenis, nilai)
    }

    pub fn allowed_actions(&self, doc: &Document) -> Vec<Action> {
        if doc.archived {
            return Vec::new();
        }
        allowed_actions(doc.status)
    }
}

fn normalized_vendor(vendor: Option<String>) -> Option<String> {
    vendor.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn content_of(doc: &Document) -> DraftContent {
    DraftContent {
        program_id: doc.program_id.clone(),
        kegiatan_id: doc.kegiatan_id.clone(),
        sub_kegiatan_id: doc.sub_kegiatan_id.clone(),
        jenis: doc.jenis,
        nilai: doc.nilai,
        uraian: doc.uraian.clone(),
        vendor_id: doc.vendor_id.clone(),
        tax_lines: doc
            .tax_lines
            .iter()
            .map(|line| TaxLineInput {
                jenis: line.jenis,
                rate_bps: Some(line.rate_bps),
                dasar: line.dasar,
                akun: Some(line.akun.clone()),
            })
            .collect(),
    }
}

fn record_failure(err: &WorkflowError) {
    let metrics = workflow_metrics();
    match err.kind() {
        ErrorKind::Validation | ErrorKind::Authorization => metrics.record_rejection(),
        ErrorKind::Conflict => metrics.record_conflict(),
        ErrorKind::Integrity => metrics.record_integrity_failure(),
        ErrorKind::Upstream | ErrorKind::NotFound | ErrorKind::Storage => {}
    }
}

fn require_treasury(actor: &Actor) -> WorkflowResult<()> {
    if actor.can_act_as(Role::Perbendaharaan) {
        Ok(())
    } else {
        Err(WorkflowError::unauthorized(format!(
            "SP2D confirmation requires role `{}`",
            Role::Perbendaharaan
        )))
    }
}

fn expect_sp2d_status(sp2d: &Sp2d, expected: Sp2dStatus, action: Action) -> WorkflowResult<()> {
    if sp2d.status == expected {
        Ok(())
    } else {
        Err(WorkflowError::validation(
            "status",
            format!("`{action}` needs an SP2D in {expected}, found {}", sp2d.status),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::MockFileStorage;
    use crate::clock::FixedClock;
    use crate::notifications::{Channel, LogChannel};
    use crate::roles::RoleAssignment;
    use crate::storage::{MemoryStore, MockWorkflowStore};
    use chrono::TimeZone;

    struct Harness {
        engine: WorkflowEngine,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap()));
        let engine = WorkflowEngine::new(store.clone(), Arc::new(MockFileStorage::new()))
            .with_clock(clock)
            .with_dispatcher(NotificationDispatcher::new(vec![Arc::new(LogChannel::new(Channel::Email))]));
        Harness { engine, store }
    }

    fn bendahara() -> Actor {
        Actor::new(
            "budi",
            vec![RoleAssignment::new("budi", Role::BendaharaOpd, Some("dinkes".into()), "root")],
        )
    }

    fn content() -> DraftContent {
        DraftContent {
            program_id: "1.02.01".into(),
            kegiatan_id: "1.02.01.2.01".into(),
            sub_kegiatan_id: "1.02.01.2.01.01".into(),
            jenis: JenisSpm::Gu,
            nilai: 5_000_000,
            uraian: "Ganti uang persediaan Juni".into(),
            vendor_id: None,
            tax_lines: Vec::new(),
        }
    }

    async fn emergency_on(h: &Harness) {
        let root = Actor::new("root", vec![RoleAssignment::new("root", Role::Superadmin, None, "bootstrap")]);
        h.engine.set_emergency(&root, true, "uji coba").await.unwrap();
    }

    #[tokio::test]
    async fn submit_allocates_intake_numbers_once() {
        let h = harness();
        emergency_on(&h).await;
        let doc = h.engine.create_draft(&bendahara(), "dinkes", content()).await.unwrap();

        let submitted = h
            .engine
            .transition(&bendahara(), doc.id, Action::Submit, TransitionInput::new(doc.version))
            .await
            .unwrap();
        assert!(submitted.emergency_bypass);
        assert_eq!(submitted.document.status, SpmStatus::Diajukan);
        assert_eq!(submitted.document.nomor_antrian.as_deref(), Some("ANTRIAN/2025/06/001"));
        assert_eq!(submitted.document.nomor_berkas.as_deref(), Some("0001/BERKAS-SPM/2025"));
        assert_eq!(
            submitted.document.tanggal_pengajuan,
            NaiveDate::from_ymd_opt(2025, 6, 2)
        );
        assert_eq!(submitted.allocated.len(), 2);
    }

    #[tokio::test]
    async fn wrong_action_lists_the_allowed_ones() {
        let h = harness();
        let doc = h.engine.create_draft(&bendahara(), "dinkes", content()).await.unwrap();
        let err = h
            .engine
            .transition(&bendahara(), doc.id, Action::Approve, TransitionInput::new(doc.version))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "action"));
        assert!(err.to_string().contains("Submit"));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let h = harness();
        emergency_on(&h).await;
        let doc = h.engine.create_draft(&bendahara(), "dinkes", content()).await.unwrap();
        let err = h
            .engine
            .transition(&bendahara(), doc.id, Action::Submit, TransitionInput::new(doc.version + 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(h.store.get_document(doc.id).await.unwrap().unwrap().status, SpmStatus::Draft);
    }

    #[tokio::test]
    async fn other_opd_cannot_create() {
        let h = harness();
        let err = h
            .engine
            .create_draft(&bendahara(), "dispora", content())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn submitted_documents_are_not_deleted() {
        let h = harness();
        emergency_on(&h).await;
        let doc = h.engine.create_draft(&bendahara(), "dinkes", content()).await.unwrap();
        let submitted = h
            .engine
            .transition(&bendahara(), doc.id, Action::Submit, TransitionInput::new(doc.version))
            .await
            .unwrap();
        let err = h
            .engine
            .delete_draft(&bendahara(), doc.id, submitted.document.version)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn failed_attachment_record_removes_the_stored_blob() {
        let h = harness();
        let doc = h.engine.create_draft(&bendahara(), "dinkes", content()).await.unwrap();

        let mut store = MockWorkflowStore::new();
        let loaded = doc.clone();
        store.expect_get_document().returning(move |_| Ok(Some(loaded.clone())));
        store
            .expect_add_attachment()
            .times(1)
            .returning(|_, _| Err(WorkflowError::Storage("disk full".into())));
        let mut files = MockFileStorage::new();
        files
            .expect_store()
            .times(1)
            .returning(|id, name, _| Ok(format!("{id}/0001-{name}")));
        let expected = format!("{}/0001-kuitansi.pdf", doc.id);
        files
            .expect_remove()
            .withf(move |reference| reference.to_string() == expected)
            .times(1)
            .returning(|_| Ok(()));

        let engine = WorkflowEngine::new(Arc::new(store), Arc::new(files));
        let err = engine
            .attach(&bendahara(), doc.id, "kuitansi.pdf", b"%PDF")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(_)));
    }

    #[test]
    fn every_review_stage_has_a_reviewer() {
        for status in SpmStatus::ALL.into_iter().filter(SpmStatus::is_review_stage) {
            assert!(reviewer_for(status).is_some(), "{status}");
        }
        assert_eq!(reviewer_for(SpmStatus::Disetujui), None);
    }
}
