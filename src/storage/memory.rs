use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    NumberField, Sp2dChange, Sp2dUpdate, TransitionCommit, TransitionOutcome, WorkflowStore,
};
use crate::documents::{Attachment, Document, DocumentFilter, DocumentType, Sp2d};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::numbering::{AllocatedNumber, AllocationRequest, NumberSeries, ScopeKey, Template};
use crate::otp::{EmergencyAudit, EmergencyState, OneTimeCode, OtpConsumption, OtpPurpose};
use crate::roles::{Role, RoleAssignment};
use crate::workflows::{AuditRecord, Sp2dStatus, SpmStatus};

#[derive(Debug, Clone, Copy, Default)]
struct ScopeRow {
    counter: u64,
    epoch: u32,
}

#[derive(Debug, Clone)]
struct IssuedRow {
    scope: ScopeKey,
    epoch: u32,
    number: String,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    sp2d: HashMap<Uuid, Sp2d>,
    scopes: HashMap<ScopeKey, ScopeRow>,
    formats: HashMap<(NumberSeries, i32), Template>,
    issued: Vec<IssuedRow>,
    roles: Vec<RoleAssignment>,
    audit: Vec<AuditRecord>,
    otps: HashMap<(String, OtpPurpose), OneTimeCode>,
    emergency: EmergencyState,
    emergency_audit: Vec<EmergencyAudit>,
}

/// Store kept entirely in process memory. Every operation runs under one
/// async mutex, which also serializes counter increments. Single-step writes
/// check before they mutate; transition commits are applied to a copy and
/// swapped in only on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a scratch copy; keep the copy only if `f` succeeds.
    /// Copying costs O(total state) per call, so only transition commits,
    /// which chain several fallible steps, go through here.
    async fn atomically<T>(&self, f: impl FnOnce(&mut Inner) -> WorkflowResult<T>) -> WorkflowResult<T> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let out = f(&mut next)?;
        *inner = next;
        Ok(out)
    }
}

impl Inner {
    fn allocate(&mut self, request: &AllocationRequest) -> WorkflowResult<AllocatedNumber> {
        let scope = request.scope;
        if !self.scopes.contains_key(&scope) && self.issued.iter().any(|i| i.scope == scope) {
            return Err(WorkflowError::ScopeLost { scope });
        }
        let ScopeRow { counter, epoch } = self.scopes.get(&scope).copied().unwrap_or_default();
        let counter = counter + 1;

        let template = self
            .formats
            .get(&(scope.series, scope.year))
            .cloned()
            .unwrap_or_else(|| request.fallback_template.clone());
        let number = request.render(&template, counter);
        if self
            .issued
            .iter()
            .any(|i| i.scope == scope && i.epoch == epoch && i.number == number)
        {
            return Err(WorkflowError::NumberCollision { scope, number });
        }
        self.scopes.insert(scope, ScopeRow { counter, epoch });
        self.issued.push(IssuedRow {
            scope,
            epoch,
            number: number.clone(),
        });
        Ok(AllocatedNumber {
            scope,
            epoch,
            counter,
            number,
        })
    }

    fn document_mut(&mut self, id: Uuid, expected_version: i64) -> WorkflowResult<&mut Document> {
        let doc = self.documents.get_mut(&id).ok_or(WorkflowError::NotFound {
            doc_type: DocumentType::Spm,
            id,
        })?;
        if doc.version != expected_version {
            return Err(WorkflowError::StaleVersion {
                doc_type: DocumentType::Spm,
                id,
                expected: expected_version,
            });
        }
        Ok(doc)
    }

    fn sp2d_mut(&mut self, id: Uuid, expected_version: i64) -> WorkflowResult<&mut Sp2d> {
        let sp2d = self.sp2d.get_mut(&id).ok_or(WorkflowError::NotFound {
            doc_type: DocumentType::Sp2d,
            id,
        })?;
        if sp2d.version != expected_version {
            return Err(WorkflowError::StaleVersion {
                doc_type: DocumentType::Sp2d,
                id,
                expected: expected_version,
            });
        }
        Ok(sp2d)
    }

    fn consume_otp(&mut self, consumption: &OtpConsumption) -> WorkflowResult<()> {
        let key = (consumption.user_id.clone(), consumption.purpose);
        match self.otps.get_mut(&key) {
            Some(otp)
                if !otp.consumed && otp.code == consumption.code && otp.expires_at > consumption.now =>
            {
                otp.consumed = true;
                Ok(())
            }
            _ => Err(WorkflowError::unauthorized(
                "one-time code is invalid or already used",
            )),
        }
    }

    fn commit(&mut self, commit: TransitionCommit) -> WorkflowResult<TransitionOutcome> {
        let mut doc = self.document_mut(commit.document_id, commit.expected_version)?.clone();

        let mut allocated = Vec::new();
        for assignment in &commit.numbers {
            let number = self.allocate(&assignment.request)?;
            match assignment.field {
                NumberField::Antrian => doc.nomor_antrian = Some(number.number.clone()),
                NumberField::Berkas => doc.nomor_berkas = Some(number.number.clone()),
            }
            allocated.push(number);
        }

        let sp2d = match commit.sp2d {
            Some(Sp2dChange::Issue {
                sp2d_id,
                nilai,
                request,
                audit,
            }) => {
                let number = self.allocate(&request)?;
                let sp2d = Sp2d {
                    id: sp2d_id,
                    spm_id: doc.id,
                    nomor_sp2d: number.number.clone(),
                    nilai,
                    status: Sp2dStatus::MenungguPersetujuan,
                    version: 1,
                    nomor_penguji: None,
                    bank_reference: None,
                    tanggal_cair: None,
                    created_at: audit.at,
                    updated_at: audit.at,
                };
                doc.nomor_sp2d = Some(number.number.clone());
                allocated.push(number);
                self.sp2d.insert(sp2d_id, sp2d.clone());
                self.audit.push(audit);
                Some(sp2d)
            }
            Some(Sp2dChange::SetStatus {
                sp2d_id,
                expected_version,
                status,
                audit,
            }) => {
                let sp2d = self.sp2d_mut(sp2d_id, expected_version)?;
                sp2d.status = status;
                sp2d.version += 1;
                sp2d.updated_at = audit.at;
                let sp2d = sp2d.clone();
                self.audit.push(audit);
                Some(sp2d)
            }
            None => None,
        };

        if let Some(consumption) = &commit.consume_otp {
            self.consume_otp(consumption)?;
        }

        doc.status = commit.to;
        if let Some(date) = commit.submitted_on {
            doc.tanggal_pengajuan = Some(date);
        }
        if commit.archive {
            doc.archived = true;
        }
        doc.version += 1;
        doc.updated_at = commit.audit.at;
        self.audit.push(commit.audit);
        self.documents.insert(doc.id, doc.clone());

        Ok(TransitionOutcome {
            document: doc,
            sp2d,
            allocated,
        })
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_document(&self, doc: &Document, audit: &AuditRecord) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.documents.contains_key(&doc.id) {
            return Err(WorkflowError::Storage(format!("document {} already exists", doc.id)));
        }
        inner.documents.insert(doc.id, doc.clone());
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> WorkflowResult<Option<Document>> {
        Ok(self.inner.lock().await.documents.get(&id).cloned())
    }

    async fn update_document(&self, doc: &Document, expected_version: i64) -> WorkflowResult<Document> {
        let mut inner = self.inner.lock().await;
        let stored = inner.document_mut(doc.id, expected_version)?;
        let mut updated = doc.clone();
        updated.version = stored.version + 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete_draft(&self, id: Uuid, expected_version: i64) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        let doc = inner.document_mut(id, expected_version)?;
        if doc.status != SpmStatus::Draft {
            return Err(WorkflowError::validation(
                "status",
                "only drafts can be deleted; archive the document instead",
            ));
        }
        inner.documents.remove(&id);
        Ok(())
    }

    async fn add_attachment(&self, id: Uuid, attachment: &Attachment) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        let doc = inner.documents.get_mut(&id).ok_or(WorkflowError::NotFound {
            doc_type: DocumentType::Spm,
            id,
        })?;
        doc.attachments.push(attachment.clone());
        Ok(())
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> WorkflowResult<Vec<Document>> {
        let inner = self.inner.lock().await;
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> WorkflowResult<TransitionOutcome> {
        self.atomically(|inner| inner.commit(commit)).await
    }

    async fn get_sp2d(&self, id: Uuid) -> WorkflowResult<Option<Sp2d>> {
        Ok(self.inner.lock().await.sp2d.get(&id).cloned())
    }

    async fn sp2d_for_spm(&self, spm_id: Uuid) -> WorkflowResult<Option<Sp2d>> {
        Ok(self
            .inner
            .lock()
            .await
            .sp2d
            .values()
            .find(|s| s.spm_id == spm_id)
            .cloned())
    }

    async fn update_sp2d(&self, update: Sp2dUpdate) -> WorkflowResult<Sp2d> {
        let mut inner = self.inner.lock().await;
        let sp2d = inner.sp2d_mut(update.sp2d_id, update.expected_version)?;
        sp2d.status = update.status;
        if update.nomor_penguji.is_some() {
            sp2d.nomor_penguji = update.nomor_penguji;
        }
        if update.bank_reference.is_some() {
            sp2d.bank_reference = update.bank_reference;
        }
        if update.tanggal_cair.is_some() {
            sp2d.tanggal_cair = update.tanggal_cair;
        }
        sp2d.version += 1;
        sp2d.updated_at = update.audit.at;
        let sp2d = sp2d.clone();
        inner.audit.push(update.audit);
        Ok(sp2d)
    }

    async fn allocate_number(&self, request: &AllocationRequest) -> WorkflowResult<AllocatedNumber> {
        self.inner.lock().await.allocate(request)
    }

    async fn reset_counter(&self, scope: &ScopeKey) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        let next_epoch = match inner.scopes.get(scope) {
            Some(row) => row.epoch + 1,
            // A missing row with issued numbers is repaired into a fresh epoch.
            None => inner
                .issued
                .iter()
                .filter(|i| i.scope == *scope)
                .map(|i| i.epoch + 1)
                .max()
                .unwrap_or(0),
        };
        inner.scopes.insert(
            *scope,
            ScopeRow {
                counter: 0,
                epoch: next_epoch,
            },
        );
        Ok(())
    }

    async fn counter(&self, scope: &ScopeKey) -> WorkflowResult<Option<u64>> {
        Ok(self.inner.lock().await.scopes.get(scope).map(|r| r.counter))
    }

    async fn set_number_format(&self, series: NumberSeries, year: i32, template: &Template) -> WorkflowResult<()> {
        self.inner
            .lock()
            .await
            .formats
            .insert((series, year), template.clone());
        Ok(())
    }

    async fn number_format(&self, series: NumberSeries, year: i32) -> WorkflowResult<Option<Template>> {
        Ok(self.inner.lock().await.formats.get(&(series, year)).cloned())
    }

    async fn is_number_issued(&self, scope: &ScopeKey, number: &str) -> WorkflowResult<bool> {
        let inner = self.inner.lock().await;
        let epoch = inner.scopes.get(scope).map(|r| r.epoch).unwrap_or(0);
        Ok(inner
            .issued
            .iter()
            .any(|i| i.scope == *scope && i.epoch == epoch && i.number == number))
    }

    async fn insert_role_assignment(&self, assignment: &RoleAssignment) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        if assignment.role.is_single_holder() {
            if let Some(holder) = inner
                .roles
                .iter()
                .find(|r| r.active && r.role == assignment.role)
            {
                return Err(WorkflowError::SingleHolderConflict {
                    role: assignment.role,
                    holder: holder.user_id.clone(),
                });
            }
        }
        if inner.roles.iter().any(|r| {
            r.active
                && r.user_id == assignment.user_id
                && r.role == assignment.role
                && r.opd_id == assignment.opd_id
        }) {
            return Err(WorkflowError::validation(
                "role",
                format!("user `{}` already holds `{}`", assignment.user_id, assignment.role),
            ));
        }
        inner.roles.push(assignment.clone());
        Ok(())
    }

    async fn deactivate_role(&self, user_id: &str, role: Role) -> WorkflowResult<bool> {
        let mut inner = self.inner.lock().await;
        let mut changed = false;
        for assignment in inner
            .roles
            .iter_mut()
            .filter(|r| r.active && r.user_id == user_id && r.role == role)
        {
            assignment.active = false;
            changed = true;
        }
        Ok(changed)
    }

    async fn active_roles(&self, user_id: &str) -> WorkflowResult<Vec<RoleAssignment>> {
        Ok(self
            .inner
            .lock()
            .await
            .roles
            .iter()
            .filter(|r| r.active && r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn active_holders(&self, role: Role) -> WorkflowResult<Vec<RoleAssignment>> {
        Ok(self
            .inner
            .lock()
            .await
            .roles
            .iter()
            .filter(|r| r.active && r.role == role)
            .cloned()
            .collect())
    }

    async fn audit_trail(&self, doc_type: DocumentType, id: Uuid) -> WorkflowResult<Vec<AuditRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .audit
            .iter()
            .filter(|a| a.doc_type == doc_type && a.document_id == id)
            .cloned()
            .collect())
    }

    async fn store_otp(&self, otp: &OneTimeCode) -> WorkflowResult<()> {
        self.inner
            .lock()
            .await
            .otps
            .insert((otp.user_id.clone(), otp.purpose), otp.clone());
        Ok(())
    }

    async fn find_otp(&self, user_id: &str, purpose: OtpPurpose) -> WorkflowResult<Option<OneTimeCode>> {
        Ok(self
            .inner
            .lock()
            .await
            .otps
            .get(&(user_id.to_string(), purpose))
            .cloned())
    }

    async fn record_otp_failure(&self, user_id: &str, purpose: OtpPurpose, max_attempts: u32) -> WorkflowResult<u32> {
        let mut inner = self.inner.lock().await;
        match inner.otps.get_mut(&(user_id.to_string(), purpose)) {
            Some(otp) if !otp.consumed => {
                otp.failed_attempts += 1;
                if otp.failed_attempts >= max_attempts {
                    otp.consumed = true;
                }
                Ok(otp.failed_attempts)
            }
            _ => Ok(0),
        }
    }

    async fn emergency_state(&self) -> WorkflowResult<EmergencyState> {
        Ok(self.inner.lock().await.emergency.clone())
    }

    async fn set_emergency_state(&self, state: &EmergencyState, audit: &EmergencyAudit) -> WorkflowResult<()> {
        let mut inner = self.inner.lock().await;
        inner.emergency = state.clone();
        inner.emergency_audit.push(audit.clone());
        Ok(())
    }

    async fn emergency_history(&self) -> WorkflowResult<Vec<EmergencyAudit>> {
        Ok(self.inner.lock().await.emergency_audit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::JenisSpm;
    use crate::storage::NumberAssignment;
    use crate::workflows::Action;
    use chrono::NaiveDate;

    fn request(series: NumberSeries) -> AllocationRequest {
        let issued_on = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap();
        AllocationRequest {
            scope: series.scope_for(issued_on),
            issued_on,
            fallback_template: series.default_template(),
            document_id: None,
        }
    }

    #[tokio::test]
    async fn lost_scope_row_is_fatal_until_reset() {
        let store = MemoryStore::new();
        let req = request(NumberSeries::Sp2d);
        let first = store.allocate_number(&req).await.unwrap();
        assert_eq!(first.number, "001/SP2D-BKAD/IX/2025");

        store.inner.lock().await.scopes.remove(&req.scope);
        let err = store.allocate_number(&req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ScopeLost { .. }));
        assert!(!err.is_recoverable());

        store.reset_counter(&req.scope).await.unwrap();
        let repaired = store.allocate_number(&req).await.unwrap();
        assert_eq!(repaired.epoch, 1);
        assert_eq!(repaired.counter, 1);
    }

    #[tokio::test]
    async fn collision_is_fatal_and_leaves_counter_untouched() {
        let store = MemoryStore::new();
        let req = request(NumberSeries::Berkas);
        store.allocate_number(&req).await.unwrap();
        // Fixed template: every counter renders the same string.
        store
            .set_number_format(
                NumberSeries::Berkas,
                2025,
                &Template::parse("{COUNTER}").unwrap(),
            )
            .await
            .unwrap();
        store.inner.lock().await.scopes.get_mut(&req.scope).unwrap().counter = 0;
        store.inner.lock().await.issued[0].number = "0001".to_string();

        let err = store.allocate_number(&req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NumberCollision { ref number, .. } if number == "0001"));
        assert_eq!(store.counter(&req.scope).await.unwrap(), Some(0));
    }

    fn draft() -> Document {
        let now = chrono::Utc::now();
        Document {
            id: Uuid::new_v4(),
            doc_type: DocumentType::Spm,
            opd_id: "dinkes".into(),
            program_id: "1.02.01".into(),
            kegiatan_id: "1.02.01.2.01".into(),
            sub_kegiatan_id: "1.02.01.2.01.01".into(),
            jenis: JenisSpm::Gu,
            nilai: 5_000_000,
            uraian: "Ganti uang persediaan".into(),
            vendor_id: None,
            tanggal_pengajuan: None,
            status: SpmStatus::Draft,
            version: 1,
            nomor_antrian: None,
            nomor_berkas: None,
            nomor_sp2d: None,
            tax_lines: Vec::new(),
            attachments: Vec::new(),
            archived: false,
            created_by: "budi".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failed_commit_leaves_numbers_and_audit_untouched() {
        let store = MemoryStore::new();
        let doc = draft();
        let created = AuditRecord::spm(doc.id, "budi", Action::Create, None, SpmStatus::Draft, None, doc.created_at);
        store.insert_document(&doc, &created).await.unwrap();

        let antrian = request(NumberSeries::Antrian);
        let commit = TransitionCommit {
            document_id: doc.id,
            expected_version: 1,
            to: SpmStatus::Diajukan,
            submitted_on: Some(antrian.issued_on),
            archive: false,
            numbers: vec![
                NumberAssignment {
                    field: NumberField::Antrian,
                    request: antrian.clone(),
                },
                NumberAssignment {
                    field: NumberField::Berkas,
                    request: request(NumberSeries::Berkas),
                },
            ],
            sp2d: None,
            audit: AuditRecord::spm(
                doc.id,
                "budi",
                Action::Submit,
                Some(SpmStatus::Draft),
                SpmStatus::Diajukan,
                None,
                doc.created_at,
            ),
            // no code was ever issued, so consumption fails after both allocations
            consume_otp: Some(OtpConsumption {
                user_id: "budi".into(),
                purpose: OtpPurpose::SubmissionFinalization,
                code: "000000".into(),
                now: doc.created_at,
            }),
        };
        let err = store.commit_transition(commit).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));

        assert_eq!(store.counter(&antrian.scope).await.unwrap(), None);
        assert!(store.inner.lock().await.issued.is_empty());
        assert_eq!(store.audit_trail(DocumentType::Spm, doc.id).await.unwrap().len(), 1);
        assert_eq!(store.get_document(doc.id).await.unwrap().unwrap().version, 1);

        // single-step writes still count from where the state was left
        assert_eq!(store.allocate_number(&antrian).await.unwrap().counter, 1);
    }

    #[tokio::test]
    async fn second_single_holder_is_refused() {
        let store = MemoryStore::new();
        store
            .insert_role_assignment(&RoleAssignment::new("sri", Role::KepalaBkad, None, "root"))
            .await
            .unwrap();
        let err = store
            .insert_role_assignment(&RoleAssignment::new("tono", Role::KepalaBkad, None, "root"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::SingleHolderConflict { ref holder, .. } if holder == "sri"));
    }
}
