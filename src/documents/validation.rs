use super::tax::{self, TaxLine};
use super::types::DraftContent;
use crate::errors::{WorkflowError, WorkflowResult};

/// Check a draft before it is stored and return its computed tax lines.
/// Nothing is written when this fails.
pub fn validate_draft(content: &DraftContent, minimum_nilai: i64) -> WorkflowResult<Vec<TaxLine>> {
    if content.nilai < minimum_nilai {
        return Err(WorkflowError::validation(
            "nilai",
            format!("amount must be at least Rp {minimum_nilai}"),
        ));
    }
    if content.uraian.trim().is_empty() {
        return Err(WorkflowError::validation("uraian", "description is required"));
    }
    for (field, value) in [
        ("program_id", &content.program_id),
        ("kegiatan_id", &content.kegiatan_id),
        ("sub_kegiatan_id", &content.sub_kegiatan_id),
    ] {
        if value.trim().is_empty() {
            return Err(WorkflowError::validation(field, "budget reference is required"));
        }
    }
    let has_vendor = content
        .vendor_id
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty());
    if content.jenis.is_ls() && !has_vendor {
        return Err(WorkflowError::validation(
            "vendor_id",
            format!("{} requires a vendor", content.jenis.label()),
        ));
    }

    let lines = content
        .tax_lines
        .iter()
        .map(TaxLine::compute)
        .collect::<WorkflowResult<Vec<_>>>()?;
    let withheld = tax::checked_total(&lines)
        .ok_or_else(|| WorkflowError::validation("tax_lines", "withholding total is out of range"))?;
    if withheld > content.nilai {
        return Err(WorkflowError::validation(
            "tax_lines",
            "withholding exceeds the gross amount",
        ));
    }
    Ok(lines)
}
