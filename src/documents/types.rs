use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::tax::{self, JenisPajak, TaxLine, TaxLineInput};
use crate::errors::WorkflowError;
use crate::workflows::{Sp2dStatus, SpmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "SPM")]
    Spm,
    #[serde(rename = "SP2D")]
    Sp2d,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Spm => "SPM",
            DocumentType::Sp2d => "SP2D",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPM" => Ok(DocumentType::Spm),
            "SP2D" => Ok(DocumentType::Sp2d),
            other => Err(WorkflowError::validation(
                "document_type",
                format!("unknown document type `{other}`"),
            )),
        }
    }
}

/// Kind of payment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JenisSpm {
    Up,
    Gu,
    Tu,
    LsGaji,
    LsBarangJasa,
    LsPihakKetiga,
}

impl JenisSpm {
    pub const ALL: [JenisSpm; 6] = [
        JenisSpm::Up,
        JenisSpm::Gu,
        JenisSpm::Tu,
        JenisSpm::LsGaji,
        JenisSpm::LsBarangJasa,
        JenisSpm::LsPihakKetiga,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JenisSpm::Up => "up",
            JenisSpm::Gu => "gu",
            JenisSpm::Tu => "tu",
            JenisSpm::LsGaji => "ls_gaji",
            JenisSpm::LsBarangJasa => "ls_barang_jasa",
            JenisSpm::LsPihakKetiga => "ls_pihak_ketiga",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JenisSpm::Up => "Uang Persediaan",
            JenisSpm::Gu => "Ganti Uang Persediaan",
            JenisSpm::Tu => "Tambahan Uang Persediaan",
            JenisSpm::LsGaji => "LS Gaji dan Tunjangan",
            JenisSpm::LsBarangJasa => "LS Barang dan Jasa",
            JenisSpm::LsPihakKetiga => "LS Pihak Ketiga Lainnya",
        }
    }

    /// LS (langsung) payments go straight to a counterparty.
    pub fn is_ls(&self) -> bool {
        matches!(
            self,
            JenisSpm::LsGaji | JenisSpm::LsBarangJasa | JenisSpm::LsPihakKetiga
        )
    }

    pub fn suggested_taxes(&self) -> &'static [JenisPajak] {
        match self {
            JenisSpm::Up | JenisSpm::Gu | JenisSpm::Tu => &[],
            JenisSpm::LsGaji => &[JenisPajak::Pph21],
            JenisSpm::LsBarangJasa => &[JenisPajak::Ppn, JenisPajak::Pph22],
            JenisSpm::LsPihakKetiga => &[JenisPajak::Ppn, JenisPajak::Pph23],
        }
    }
}

impl fmt::Display for JenisSpm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JenisSpm {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JenisSpm::ALL
            .into_iter()
            .find(|j| j.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("jenis_spm", format!("unknown SPM kind `{s}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub reference: String,
    pub file_name: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Editable part of an SPM, used for both creation and draft updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftContent {
    pub program_id: String,
    pub kegiatan_id: String,
    pub sub_kegiatan_id: String,
    pub jenis: JenisSpm,
    pub nilai: i64,
    pub uraian: String,
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub tax_lines: Vec<TaxLineInput>,
}

/// Payment order (SPM) as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub doc_type: DocumentType,
    pub opd_id: String,
    pub program_id: String,
    pub kegiatan_id: String,
    pub sub_kegiatan_id: String,
    pub jenis: JenisSpm,
    pub nilai: i64,
    pub uraian: String,
    pub vendor_id: Option<String>,
    pub tanggal_pengajuan: Option<NaiveDate>,
    pub status: SpmStatus,
    /// Bumped on every write; transitions compare-and-swap on it.
    pub version: i64,
    pub nomor_antrian: Option<String>,
    pub nomor_berkas: Option<String>,
    pub nomor_sp2d: Option<String>,
    pub tax_lines: Vec<TaxLine>,
    pub attachments: Vec<Attachment>,
    pub archived: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn total_pajak(&self) -> i64 {
        tax::total(&self.tax_lines)
    }

    /// Amount actually paid out once withholding is deducted.
    pub fn nilai_bersih(&self) -> i64 {
        self.nilai.saturating_sub(self.total_pajak())
    }

    pub fn is_editable(&self) -> bool {
        !self.archived && matches!(self.status, SpmStatus::Draft | SpmStatus::PerluRevisi)
    }
}

/// Disbursement order issued for a fully verified SPM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sp2d {
    pub id: Uuid,
    pub spm_id: Uuid,
    pub nomor_sp2d: String,
    pub nilai: i64,
    pub status: Sp2dStatus,
    pub version: i64,
    pub nomor_penguji: Option<String>,
    pub bank_reference: Option<String>,
    pub tanggal_cair: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub status: Option<SpmStatus>,
    pub opd_id: Option<String>,
    pub jenis: Option<JenisSpm>,
    /// Year of submission.
    pub year: Option<i32>,
    pub include_archived: bool,
}

impl DocumentFilter {
    pub fn matches(&self, doc: &Document) -> bool {
        use chrono::Datelike;

        self.status.map_or(true, |s| doc.status == s)
            && self.opd_id.as_deref().map_or(true, |o| doc.opd_id == o)
            && self.jenis.map_or(true, |j| doc.jenis == j)
            && self
                .year
                .map_or(true, |y| doc.tanggal_pengajuan.map(|d| d.year()) == Some(y))
            && (self.include_archived || !doc.archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ls_variants_are_ls() {
        let ls: Vec<_> = JenisSpm::ALL.into_iter().filter(JenisSpm::is_ls).collect();
        assert_eq!(
            ls,
            vec![JenisSpm::LsGaji, JenisSpm::LsBarangJasa, JenisSpm::LsPihakKetiga]
        );
    }

    #[test]
    fn jenis_parses_from_wire_names() {
        assert_eq!("ls_barang_jasa".parse::<JenisSpm>().unwrap(), JenisSpm::LsBarangJasa);
        assert!("ls".parse::<JenisSpm>().is_err());
        assert_eq!(
            serde_json::to_string(&JenisSpm::LsPihakKetiga).unwrap(),
            "\"ls_pihak_ketiga\""
        );
    }

    #[test]
    fn document_type_tags() {
        assert_eq!("sp2d".parse::<DocumentType>().unwrap(), DocumentType::Sp2d);
        assert_eq!(serde_json::to_string(&DocumentType::Spm).unwrap(), "\"SPM\"");
    }
}
