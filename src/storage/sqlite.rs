use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::{debug, error};
use uuid::Uuid;

use super::{
    NumberField, Sp2dChange, Sp2dUpdate, TransitionCommit, TransitionOutcome, WorkflowStore,
};
use crate::documents::{Attachment, Document, DocumentFilter, DocumentType, Sp2d, TaxLine};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::numbering::{AllocatedNumber, AllocationRequest, NumberSeries, ScopeKey, Template};
use crate::otp::{EmergencyAudit, EmergencyState, OneTimeCode, OtpPurpose};
use crate::roles::{Role, RoleAssignment};
use crate::workflows::{AuditRecord, Sp2dStatus, SpmStatus};

/// SQLite-backed store. Each multi-row write runs in one transaction whose
/// first statement is a write, so SQLite takes the write lock up front and
/// concurrent commits serialize instead of interleaving.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(at: DateTime<Utc>) -> String {
    // Fixed width so timestamps compare correctly as text.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> WorkflowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| WorkflowError::Storage(format!("bad timestamp `{raw}`: {e}")))
}

fn parse_date(raw: &str) -> WorkflowResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| WorkflowError::Storage(format!("bad date `{raw}`: {e}")))
}

fn parse_uuid(raw: &str) -> WorkflowResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| WorkflowError::Storage(format!("bad id `{raw}`: {e}")))
}

fn opt_date(row: &SqliteRow, column: &str) -> WorkflowResult<Option<NaiveDate>> {
    row.try_get::<Option<String>, _>(column)?
        .as_deref()
        .map(parse_date)
        .transpose()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn document_from_row(row: &SqliteRow) -> WorkflowResult<Document> {
    Ok(Document {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        doc_type: row.try_get::<String, _>("doc_type")?.parse()?,
        opd_id: row.try_get("opd_id")?,
        program_id: row.try_get("program_id")?,
        kegiatan_id: row.try_get("kegiatan_id")?,
        sub_kegiatan_id: row.try_get("sub_kegiatan_id")?,
        jenis: row.try_get::<String, _>("jenis")?.parse()?,
        nilai: row.try_get("nilai")?,
        uraian: row.try_get("uraian")?,
        vendor_id: row.try_get("vendor_id")?,
        tanggal_pengajuan: opt_date(row, "tanggal_pengajuan")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        version: row.try_get("version")?,
        nomor_antrian: row.try_get("nomor_antrian")?,
        nomor_berkas: row.try_get("nomor_berkas")?,
        nomor_sp2d: row.try_get("nomor_sp2d")?,
        tax_lines: Vec::new(),
        attachments: Vec::new(),
        archived: row.try_get::<i64, _>("archived")? != 0,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn sp2d_from_row(row: &SqliteRow) -> WorkflowResult<Sp2d> {
    Ok(Sp2d {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        spm_id: parse_uuid(&row.try_get::<String, _>("spm_id")?)?,
        nomor_sp2d: row.try_get("nomor_sp2d")?,
        nilai: row.try_get("nilai")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        version: row.try_get("version")?,
        nomor_penguji: row.try_get("nomor_penguji")?,
        bank_reference: row.try_get("bank_reference")?,
        tanggal_cair: opt_date(row, "tanggal_cair")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn role_from_row(row: &SqliteRow) -> WorkflowResult<RoleAssignment> {
    Ok(RoleAssignment {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: row.try_get("user_id")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        opd_id: row.try_get("opd_id")?,
        active: row.try_get::<i64, _>("active")? != 0,
        assigned_by: row.try_get("assigned_by")?,
        assigned_at: parse_ts(&row.try_get::<String, _>("assigned_at")?)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> WorkflowResult<AuditRecord> {
    Ok(AuditRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        doc_type: row.try_get::<String, _>("doc_type")?.parse()?,
        document_id: parse_uuid(&row.try_get::<String, _>("document_id")?)?,
        actor: row.try_get("actor")?,
        action: row.try_get::<String, _>("action")?.parse()?,
        from_state: row.try_get("from_state")?,
        to_state: row.try_get("to_state")?,
        note: row.try_get("note")?,
        at: parse_ts(&row.try_get::<String, _>("at")?)?,
    })
}

async fn load_document(conn: &mut SqliteConnection, id: Uuid) -> WorkflowResult<Option<Document>> {
    let Some(row) = sqlx::query("SELECT * FROM documents WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let mut doc = document_from_row(&row)?;

    let lines = sqlx::query(
        "SELECT jenis, rate_bps, dasar, jumlah, akun FROM tax_lines WHERE document_id = ?1 ORDER BY position",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    for line in lines {
        doc.tax_lines.push(TaxLine {
            jenis: line.try_get::<String, _>("jenis")?.parse()?,
            rate_bps: line.try_get::<i64, _>("rate_bps")? as u32,
            dasar: line.try_get("dasar")?,
            jumlah: line.try_get("jumlah")?,
            akun: line.try_get("akun")?,
        });
    }

    let attachments = sqlx::query(
        "SELECT reference, file_name, uploaded_by, uploaded_at FROM attachments WHERE document_id = ?1 ORDER BY rowid",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    for row in attachments {
        doc.attachments.push(Attachment {
            reference: row.try_get("reference")?,
            file_name: row.try_get("file_name")?,
            uploaded_by: row.try_get("uploaded_by")?,
            uploaded_at: parse_ts(&row.try_get::<String, _>("uploaded_at")?)?,
        });
    }
    Ok(Some(doc))
}

async fn load_sp2d(conn: &mut SqliteConnection, id: Uuid) -> WorkflowResult<Option<Sp2d>> {
    sqlx::query("SELECT * FROM sp2d WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(sp2d_from_row)
        .transpose()
}

async fn write_tax_lines(conn: &mut SqliteConnection, id: Uuid, lines: &[TaxLine]) -> WorkflowResult<()> {
    sqlx::query("DELETE FROM tax_lines WHERE document_id = ?1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    for (position, line) in lines.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO tax_lines (document_id, position, jenis, rate_bps, dasar, jumlah, akun)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(position as i64)
        .bind(line.jenis.as_str())
        .bind(line.rate_bps as i64)
        .bind(line.dasar)
        .bind(line.jumlah)
        .bind(&line.akun)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_audit(conn: &mut SqliteConnection, audit: &AuditRecord) -> WorkflowResult<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, doc_type, document_id, actor, action, from_state, to_state, note, at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(audit.id.to_string())
    .bind(audit.doc_type.as_str())
    .bind(audit.document_id.to_string())
    .bind(&audit.actor)
    .bind(audit.action.as_str())
    .bind(&audit.from_state)
    .bind(&audit.to_state)
    .bind(&audit.note)
    .bind(ts(audit.at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Tell a missing row apart from a version mismatch after a CAS update
/// touched nothing.
async fn cas_failure(
    conn: &mut SqliteConnection,
    table: &str,
    doc_type: DocumentType,
    id: Uuid,
    expected: i64,
) -> WorkflowResult<WorkflowError> {
    let exists: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"))
        .bind(id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(if exists == 0 {
        WorkflowError::NotFound { doc_type, id }
    } else {
        WorkflowError::StaleVersion {
            doc_type,
            id,
            expected,
        }
    })
}

async fn stored_format(
    conn: &mut SqliteConnection,
    series: NumberSeries,
    year: i32,
) -> WorkflowResult<Option<Template>> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT template FROM number_formats WHERE series = ?1 AND year = ?2")
            .bind(series.as_str())
            .bind(year)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(raw.as_deref().map(Template::parse).transpose()?)
}

/// Increment-and-fetch inside the caller's transaction, then record the
/// rendered number in the issued ledger.
async fn allocate_in(conn: &mut SqliteConnection, request: &AllocationRequest) -> WorkflowResult<AllocatedNumber> {
    let scope = request.scope;
    let key = scope.storage_key();

    let row = sqlx::query(
        r#"
        INSERT INTO numbering_scopes (scope_key, counter, epoch) VALUES (?1, 1, 0)
        ON CONFLICT(scope_key) DO UPDATE SET counter = counter + 1
        RETURNING counter, epoch
        "#,
    )
    .bind(&key)
    .fetch_one(&mut *conn)
    .await?;
    let counter: i64 = row.try_get("counter")?;
    let epoch: i64 = row.try_get("epoch")?;

    // Reset always bumps the epoch, so (1, 0) means the row was just
    // created. Numbers already on the ledger then mean the row was lost.
    if counter == 1 && epoch == 0 {
        let issued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM issued_numbers WHERE scope_key = ?1")
            .bind(&key)
            .fetch_one(&mut *conn)
            .await?;
        if issued > 0 {
            error!(scope = %scope, issued, "Numbering scope row missing while numbers exist");
            return Err(WorkflowError::ScopeLost { scope });
        }
    }

    let template = match stored_format(&mut *conn, scope.series, scope.year).await? {
        Some(template) => template,
        None => request.fallback_template.clone(),
    };
    let number = request.render(&template, counter as u64);

    let inserted = sqlx::query(
        r#"
        INSERT INTO issued_numbers (scope_key, epoch, counter, number, document_id, issued_on)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&key)
    .bind(epoch)
    .bind(counter)
    .bind(&number)
    .bind(request.document_id.map(|id| id.to_string()))
    .bind(request.issued_on.to_string())
    .execute(&mut *conn)
    .await;
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            error!(scope = %scope, number = %number, "Rendered number already issued");
            return Err(WorkflowError::NumberCollision { scope, number });
        }
        Err(e) => return Err(e.into()),
    }

    debug!(scope = %scope, counter, number = %number, "Number allocated");
    Ok(AllocatedNumber {
        scope,
        epoch: epoch as u32,
        counter: counter as u64,
        number,
    })
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn insert_document(&self, doc: &Document, audit: &AuditRecord) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, doc_type, opd_id, program_id, kegiatan_id, sub_kegiatan_id, jenis, nilai,
                uraian, vendor_id, tanggal_pengajuan, status, version, nomor_antrian,
                nomor_berkas, nomor_sp2d, archived, created_by, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
        )
        .bind(doc.id.to_string())
        .bind(doc.doc_type.as_str())
        .bind(&doc.opd_id)
        .bind(&doc.program_id)
        .bind(&doc.kegiatan_id)
        .bind(&doc.sub_kegiatan_id)
        .bind(doc.jenis.as_str())
        .bind(doc.nilai)
        .bind(&doc.uraian)
        .bind(&doc.vendor_id)
        .bind(doc.tanggal_pengajuan.map(|d| d.to_string()))
        .bind(doc.status.as_str())
        .bind(doc.version)
        .bind(&doc.nomor_antrian)
        .bind(&doc.nomor_berkas)
        .bind(&doc.nomor_sp2d)
        .bind(doc.archived)
        .bind(&doc.created_by)
        .bind(ts(doc.created_at))
        .bind(ts(doc.updated_at))
        .execute(&mut *tx)
        .await?;
        write_tax_lines(&mut tx, doc.id, &doc.tax_lines).await?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> WorkflowResult<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        load_document(&mut conn, id).await
    }

    async fn update_document(&self, doc: &Document, expected_version: i64) -> WorkflowResult<Document> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET program_id = ?1, kegiatan_id = ?2, sub_kegiatan_id = ?3, jenis = ?4, nilai = ?5,
                uraian = ?6, vendor_id = ?7, updated_at = ?8, version = version + 1
            WHERE id = ?9 AND version = ?10
            "#,
        )
        .bind(&doc.program_id)
        .bind(&doc.kegiatan_id)
        .bind(&doc.sub_kegiatan_id)
        .bind(doc.jenis.as_str())
        .bind(doc.nilai)
        .bind(&doc.uraian)
        .bind(&doc.vendor_id)
        .bind(ts(doc.updated_at))
        .bind(doc.id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(cas_failure(&mut tx, "documents", DocumentType::Spm, doc.id, expected_version).await?);
        }
        write_tax_lines(&mut tx, doc.id, &doc.tax_lines).await?;
        let stored = load_document(&mut tx, doc.id)
            .await?
            .ok_or(WorkflowError::NotFound {
                doc_type: DocumentType::Spm,
                id: doc.id,
            })?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn delete_draft(&self, id: Uuid, expected_version: i64) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?1 AND version = ?2 AND status = ?3")
            .bind(id.to_string())
            .bind(expected_version)
            .bind(SpmStatus::Draft.as_str())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            let current = load_document(&mut tx, id).await?;
            return Err(match current {
                Some(doc) if doc.version == expected_version => WorkflowError::validation(
                    "status",
                    "only drafts can be deleted; archive the document instead",
                ),
                Some(_) => WorkflowError::StaleVersion {
                    doc_type: DocumentType::Spm,
                    id,
                    expected: expected_version,
                },
                None => WorkflowError::NotFound {
                    doc_type: DocumentType::Spm,
                    id,
                },
            });
        }
        sqlx::query("DELETE FROM tax_lines WHERE document_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM attachments WHERE document_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_attachment(&self, id: Uuid, attachment: &Attachment) -> WorkflowResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO attachments (document_id, reference, file_name, uploaded_by, uploaded_at)
            SELECT id, ?2, ?3, ?4, ?5 FROM documents WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(&attachment.reference)
        .bind(&attachment.file_name)
        .bind(&attachment.uploaded_by)
        .bind(ts(attachment.uploaded_at))
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(WorkflowError::NotFound {
                doc_type: DocumentType::Spm,
                id,
            });
        }
        Ok(())
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> WorkflowResult<Vec<Document>> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR opd_id = ?2)
              AND (?3 IS NULL OR jenis = ?3)
              AND (?4 = 1 OR archived = 0)
            ORDER BY created_at ASC
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.opd_id.as_deref())
        .bind(filter.jenis.map(|j| j.as_str()))
        .bind(filter.include_archived)
        .fetch_all(&mut *conn)
        .await?;

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = load_document(&mut conn, parse_uuid(&id)?).await? {
                if filter.matches(&doc) {
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> WorkflowResult<TransitionOutcome> {
        let id = commit.document_id;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?1,
                version = version + 1,
                updated_at = ?2,
                tanggal_pengajuan = COALESCE(?3, tanggal_pengajuan),
                archived = MAX(archived, ?4)
            WHERE id = ?5 AND version = ?6
            "#,
        )
        .bind(commit.to.as_str())
        .bind(ts(commit.audit.at))
        .bind(commit.submitted_on.map(|d| d.to_string()))
        .bind(commit.archive)
        .bind(id.to_string())
        .bind(commit.expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(cas_failure(&mut tx, "documents", DocumentType::Spm, id, commit.expected_version).await?);
        }

        let mut allocated = Vec::new();
        for assignment in &commit.numbers {
            let number = allocate_in(&mut tx, &assignment.request).await?;
            let column = match assignment.field {
                NumberField::Antrian => "nomor_antrian",
                NumberField::Berkas => "nomor_berkas",
            };
            sqlx::query(&format!("UPDATE documents SET {column} = ?1 WHERE id = ?2"))
                .bind(&number.number)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            allocated.push(number);
        }

        let sp2d_id = match &commit.sp2d {
            Some(Sp2dChange::Issue {
                sp2d_id,
                nilai,
                request,
                audit,
            }) => {
                let number = allocate_in(&mut tx, request).await?;
                sqlx::query(
                    r#"
                    INSERT INTO sp2d (id, spm_id, nomor_sp2d, nilai, status, version, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
                    "#,
                )
                .bind(sp2d_id.to_string())
                .bind(id.to_string())
                .bind(&number.number)
                .bind(nilai)
                .bind(Sp2dStatus::MenungguPersetujuan.as_str())
                .bind(ts(audit.at))
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE documents SET nomor_sp2d = ?1 WHERE id = ?2")
                    .bind(&number.number)
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
                insert_audit(&mut tx, audit).await?;
                allocated.push(number);
                Some(*sp2d_id)
            }
            Some(Sp2dChange::SetStatus {
                sp2d_id,
                expected_version,
                status,
                audit,
            }) => {
                let changed = sqlx::query(
                    "UPDATE sp2d SET status = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3 AND version = ?4",
                )
                .bind(status.as_str())
                .bind(ts(audit.at))
                .bind(sp2d_id.to_string())
                .bind(expected_version)
                .execute(&mut *tx)
                .await?;
                if changed.rows_affected() == 0 {
                    return Err(
                        cas_failure(&mut tx, "sp2d", DocumentType::Sp2d, *sp2d_id, *expected_version).await?,
                    );
                }
                insert_audit(&mut tx, audit).await?;
                Some(*sp2d_id)
            }
            None => None,
        };

        if let Some(otp) = &commit.consume_otp {
            let consumed = sqlx::query(
                r#"
                UPDATE otp_codes SET consumed = 1
                WHERE user_id = ?1 AND purpose = ?2 AND code = ?3 AND consumed = 0 AND expires_at > ?4
                "#,
            )
            .bind(&otp.user_id)
            .bind(otp.purpose.as_str())
            .bind(&otp.code)
            .bind(ts(otp.now))
            .execute(&mut *tx)
            .await?;
            if consumed.rows_affected() != 1 {
                return Err(WorkflowError::unauthorized(
                    "one-time code is invalid or already used",
                ));
            }
        }

        insert_audit(&mut tx, &commit.audit).await?;

        let document = load_document(&mut tx, id)
            .await?
            .ok_or(WorkflowError::NotFound {
                doc_type: DocumentType::Spm,
                id,
            })?;
        let sp2d = match sp2d_id {
            Some(sp2d_id) => load_sp2d(&mut tx, sp2d_id).await?,
            None => None,
        };
        tx.commit().await?;

        Ok(TransitionOutcome {
            document,
            sp2d,
            allocated,
        })
    }

    async fn get_sp2d(&self, id: Uuid) -> WorkflowResult<Option<Sp2d>> {
        let mut conn = self.pool.acquire().await?;
        load_sp2d(&mut conn, id).await
    }

    async fn sp2d_for_spm(&self, spm_id: Uuid) -> WorkflowResult<Option<Sp2d>> {
        sqlx::query("SELECT * FROM sp2d WHERE spm_id = ?1")
            .bind(spm_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(sp2d_from_row)
            .transpose()
    }

    async fn update_sp2d(&self, update: Sp2dUpdate) -> WorkflowResult<Sp2d> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            r#"
            UPDATE sp2d
            SET status = ?1,
                nomor_penguji = COALESCE(?2, nomor_penguji),
                bank_reference = COALESCE(?3, bank_reference),
                tanggal_cair = COALESCE(?4, tanggal_cair),
                version = version + 1,
                updated_at = ?5
            WHERE id = ?6 AND version = ?7
            "#,
        )
        .bind(update.status.as_str())
        .bind(&update.nomor_penguji)
        .bind(&update.bank_reference)
        .bind(update.tanggal_cair.map(|d| d.to_string()))
        .bind(ts(update.audit.at))
        .bind(update.sp2d_id.to_string())
        .bind(update.expected_version)
        .execute(&mut *tx)
        .await?;
        if changed.rows_affected() == 0 {
            return Err(cas_failure(
                &mut tx,
                "sp2d",
                DocumentType::Sp2d,
                update.sp2d_id,
                update.expected_version,
            )
            .await?);
        }
        insert_audit(&mut tx, &update.audit).await?;
        let sp2d = load_sp2d(&mut tx, update.sp2d_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                doc_type: DocumentType::Sp2d,
                id: update.sp2d_id,
            })?;
        tx.commit().await?;
        Ok(sp2d)
    }

    async fn allocate_number(&self, request: &AllocationRequest) -> WorkflowResult<AllocatedNumber> {
        let mut tx = self.pool.begin().await?;
        let number = allocate_in(&mut tx, request).await?;
        tx.commit().await?;
        Ok(number)
    }

    async fn reset_counter(&self, scope: &ScopeKey) -> WorkflowResult<()> {
        let key = scope.storage_key();
        let mut tx = self.pool.begin().await?;
        let reset = sqlx::query("UPDATE numbering_scopes SET counter = 0, epoch = epoch + 1 WHERE scope_key = ?1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        if reset.rows_affected() == 0 {
            // A missing row with issued numbers is repaired into a fresh epoch.
            let epoch: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(epoch) + 1, 0) FROM issued_numbers WHERE scope_key = ?1",
            )
            .bind(&key)
            .fetch_one(&mut *tx)
            .await?;
            sqlx::query("INSERT INTO numbering_scopes (scope_key, counter, epoch) VALUES (?1, 0, ?2)")
                .bind(&key)
                .bind(epoch)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn counter(&self, scope: &ScopeKey) -> WorkflowResult<Option<u64>> {
        let counter: Option<i64> = sqlx::query_scalar("SELECT counter FROM numbering_scopes WHERE scope_key = ?1")
            .bind(scope.storage_key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(counter.map(|c| c as u64))
    }

    async fn set_number_format(&self, series: NumberSeries, year: i32, template: &Template) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO number_formats (series, year, template) VALUES (?1, ?2, ?3)
            ON CONFLICT(series, year) DO UPDATE SET template = excluded.template
            "#,
        )
        .bind(series.as_str())
        .bind(year)
        .bind(template.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn number_format(&self, series: NumberSeries, year: i32) -> WorkflowResult<Option<Template>> {
        let mut conn = self.pool.acquire().await?;
        stored_format(&mut conn, series, year).await
    }

    async fn is_number_issued(&self, scope: &ScopeKey, number: &str) -> WorkflowResult<bool> {
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM issued_numbers
            WHERE scope_key = ?1 AND number = ?2
              AND epoch = COALESCE((SELECT epoch FROM numbering_scopes WHERE scope_key = ?1), 0)
            "#,
        )
        .bind(scope.storage_key())
        .bind(number)
        .fetch_one(&self.pool)
        .await?;
        Ok(found > 0)
    }

    async fn insert_role_assignment(&self, assignment: &RoleAssignment) -> WorkflowResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO role_assignments (id, user_id, role, opd_id, single_holder, active, assigned_by, assigned_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(assignment.id.to_string())
        .bind(&assignment.user_id)
        .bind(assignment.role.as_str())
        .bind(&assignment.opd_id)
        .bind(assignment.role.is_single_holder())
        .bind(assignment.active)
        .bind(&assignment.assigned_by)
        .bind(ts(assignment.assigned_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let holder = self
                    .active_holders(assignment.role)
                    .await?
                    .into_iter()
                    .find(|h| h.user_id != assignment.user_id);
                match holder {
                    Some(holder) if assignment.role.is_single_holder() => {
                        Err(WorkflowError::SingleHolderConflict {
                            role: assignment.role,
                            holder: holder.user_id,
                        })
                    }
                    _ => Err(WorkflowError::validation(
                        "role",
                        format!("user `{}` already holds `{}`", assignment.user_id, assignment.role),
                    )),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate_role(&self, user_id: &str, role: Role) -> WorkflowResult<bool> {
        let changed = sqlx::query(
            "UPDATE role_assignments SET active = 0 WHERE user_id = ?1 AND role = ?2 AND active = 1",
        )
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(changed.rows_affected() > 0)
    }

    async fn active_roles(&self, user_id: &str) -> WorkflowResult<Vec<RoleAssignment>> {
        sqlx::query("SELECT * FROM role_assignments WHERE user_id = ?1 AND active = 1 ORDER BY assigned_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(role_from_row)
            .collect()
    }

    async fn active_holders(&self, role: Role) -> WorkflowResult<Vec<RoleAssignment>> {
        sqlx::query("SELECT * FROM role_assignments WHERE role = ?1 AND active = 1 ORDER BY assigned_at")
            .bind(role.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(role_from_row)
            .collect()
    }

    async fn audit_trail(&self, doc_type: DocumentType, id: Uuid) -> WorkflowResult<Vec<AuditRecord>> {
        sqlx::query("SELECT * FROM audit_log WHERE doc_type = ?1 AND document_id = ?2 ORDER BY seq")
            .bind(doc_type.as_str())
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(audit_from_row)
            .collect()
    }

    async fn store_otp(&self, otp: &OneTimeCode) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO otp_codes (user_id, purpose, code, expires_at, consumed, failed_attempts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, purpose) DO UPDATE SET
                code = excluded.code,
                expires_at = excluded.expires_at,
                consumed = excluded.consumed,
                failed_attempts = excluded.failed_attempts
            "#,
        )
        .bind(&otp.user_id)
        .bind(otp.purpose.as_str())
        .bind(&otp.code)
        .bind(ts(otp.expires_at))
        .bind(otp.consumed)
        .bind(i64::from(otp.failed_attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_otp(&self, user_id: &str, purpose: OtpPurpose) -> WorkflowResult<Option<OneTimeCode>> {
        let Some(row) = sqlx::query("SELECT * FROM otp_codes WHERE user_id = ?1 AND purpose = ?2")
            .bind(user_id)
            .bind(purpose.as_str())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(OneTimeCode {
            user_id: row.try_get("user_id")?,
            purpose: row.try_get::<String, _>("purpose")?.parse()?,
            code: row.try_get("code")?,
            expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
            consumed: row.try_get::<i64, _>("consumed")? != 0,
            failed_attempts: u32::try_from(row.try_get::<i64, _>("failed_attempts")?).unwrap_or(u32::MAX),
        }))
    }

    async fn record_otp_failure(&self, user_id: &str, purpose: OtpPurpose, max_attempts: u32) -> WorkflowResult<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE otp_codes
            SET failed_attempts = failed_attempts + 1,
                consumed = CASE WHEN failed_attempts + 1 >= ?3 THEN 1 ELSE consumed END
            WHERE user_id = ?1 AND purpose = ?2 AND consumed = 0
            RETURNING failed_attempts
            "#,
        )
        .bind(user_id)
        .bind(purpose.as_str())
        .bind(i64::from(max_attempts))
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX)))
    }

    async fn emergency_state(&self) -> WorkflowResult<EmergencyState> {
        let Some(row) = sqlx::query("SELECT * FROM emergency_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(EmergencyState::default());
        };
        Ok(EmergencyState {
            active: row.try_get::<i64, _>("active")? != 0,
            reason: row.try_get("reason")?,
            changed_by: row.try_get("changed_by")?,
            changed_at: row
                .try_get::<Option<String>, _>("changed_at")?
                .as_deref()
                .map(parse_ts)
                .transpose()?,
        })
    }

    async fn set_emergency_state(&self, state: &EmergencyState, audit: &EmergencyAudit) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO emergency_state (id, active, reason, changed_by, changed_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                active = excluded.active,
                reason = excluded.reason,
                changed_by = excluded.changed_by,
                changed_at = excluded.changed_at
            "#,
        )
        .bind(state.active)
        .bind(&state.reason)
        .bind(&state.changed_by)
        .bind(state.changed_at.map(ts))
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO emergency_audit (id, actor, activated, reason, at) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(audit.id.to_string())
            .bind(&audit.actor)
            .bind(audit.activated)
            .bind(&audit.reason)
            .bind(ts(audit.at))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn emergency_history(&self) -> WorkflowResult<Vec<EmergencyAudit>> {
        let rows = sqlx::query("SELECT * FROM emergency_audit ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(EmergencyAudit {
                    id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    actor: row.try_get("actor")?,
                    activated: row.try_get::<i64, _>("activated")? != 0,
                    reason: row.try_get("reason")?,
                    at: parse_ts(&row.try_get::<String, _>("at")?)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn request(series: NumberSeries, y: i32, m: u32, d: u32) -> AllocationRequest {
        let issued_on = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        AllocationRequest {
            scope: series.scope_for(issued_on),
            issued_on,
            fallback_template: series.default_template(),
            document_id: None,
        }
    }

    #[tokio::test]
    async fn counters_increment_and_reset() {
        let store = store().await;
        let req = request(NumberSeries::Antrian, 2025, 6, 2);
        assert_eq!(store.allocate_number(&req).await.unwrap().number, "ANTRIAN/2025/06/001");
        assert_eq!(store.allocate_number(&req).await.unwrap().number, "ANTRIAN/2025/06/002");
        assert!(store.is_number_issued(&req.scope, "ANTRIAN/2025/06/002").await.unwrap());

        store.reset_counter(&req.scope).await.unwrap();
        assert_eq!(store.counter(&req.scope).await.unwrap(), Some(0));
        let again = store.allocate_number(&req).await.unwrap();
        assert_eq!(again.number, "ANTRIAN/2025/06/001");
        assert_eq!(again.epoch, 1);
    }

    #[tokio::test]
    async fn missing_scope_row_is_reported_not_recreated() {
        let store = store().await;
        let req = request(NumberSeries::Sp2d, 2025, 9, 1);
        store.allocate_number(&req).await.unwrap();
        sqlx::query("DELETE FROM numbering_scopes")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.allocate_number(&req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ScopeLost { .. }));
        assert_eq!(store.counter(&req.scope).await.unwrap(), None);
    }

    #[tokio::test]
    async fn collision_rolls_back_the_increment() {
        let store = store().await;
        let req = request(NumberSeries::Berkas, 2025, 3, 1);
        store
            .set_number_format(NumberSeries::Berkas, 2025, &Template::parse("B-{COUNTER}").unwrap())
            .await
            .unwrap();
        store.allocate_number(&req).await.unwrap();
        sqlx::query("UPDATE numbering_scopes SET counter = 0")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.allocate_number(&req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NumberCollision { ref number, .. } if number == "B-0001"));
        assert_eq!(store.counter(&req.scope).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn unique_index_enforces_single_holder() {
        let store = store().await;
        store
            .insert_role_assignment(&RoleAssignment::new("rina", Role::Akuntansi, None, "root"))
            .await
            .unwrap();
        let err = store
            .insert_role_assignment(&RoleAssignment::new("dodi", Role::Akuntansi, None, "root"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::SingleHolderConflict { ref holder, .. } if holder == "rina"));

        let dup = store
            .insert_role_assignment(&RoleAssignment::new("rina", Role::Akuntansi, None, "root"))
            .await
            .unwrap_err();
        assert!(matches!(dup, WorkflowError::Validation { .. }));

        assert!(store.deactivate_role("rina", Role::Akuntansi).await.unwrap());
        store
            .insert_role_assignment(&RoleAssignment::new("dodi", Role::Akuntansi, None, "root"))
            .await
            .unwrap();

        // Multi-holder roles accept several users.
        for user in ["a", "b"] {
            store
                .insert_role_assignment(&RoleAssignment::new(user, Role::BendaharaOpd, Some("dinkes".into()), "root"))
                .await
                .unwrap();
        }
        assert_eq!(store.active_holders(Role::BendaharaOpd).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn emergency_state_round_trips_with_history() {
        let store = store().await;
        assert!(!store.emergency_state().await.unwrap().active);
        let now = Utc::now();
        let state = EmergencyState {
            active: true,
            reason: Some("gateway down".into()),
            changed_by: Some("root".into()),
            changed_at: Some(now),
        };
        let audit = EmergencyAudit {
            id: Uuid::new_v4(),
            actor: "root".into(),
            activated: true,
            reason: "gateway down".into(),
            at: now,
        };
        store.set_emergency_state(&state, &audit).await.unwrap();
        assert!(store.emergency_state().await.unwrap().active);
        assert_eq!(store.emergency_history().await.unwrap().len(), 1);
    }
}
