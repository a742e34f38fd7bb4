use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::JenisSpm;
use crate::errors::{WorkflowError, WorkflowResult};

/// Rates are kept in basis points so amounts stay in whole rupiah.
pub const FULL_RATE_BPS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JenisPajak {
    Pph21,
    Pph22,
    Pph23,
    Pph4Ayat2,
    Ppn,
}

impl JenisPajak {
    pub const ALL: [JenisPajak; 5] = [
        JenisPajak::Pph21,
        JenisPajak::Pph22,
        JenisPajak::Pph23,
        JenisPajak::Pph4Ayat2,
        JenisPajak::Ppn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JenisPajak::Pph21 => "pph21",
            JenisPajak::Pph22 => "pph22",
            JenisPajak::Pph23 => "pph23",
            JenisPajak::Pph4Ayat2 => "pph4_ayat2",
            JenisPajak::Ppn => "ppn",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JenisPajak::Pph21 => "PPh Pasal 21",
            JenisPajak::Pph22 => "PPh Pasal 22",
            JenisPajak::Pph23 => "PPh Pasal 23",
            JenisPajak::Pph4Ayat2 => "PPh Pasal 4 ayat (2)",
            JenisPajak::Ppn => "PPN",
        }
    }

    pub fn default_rate_bps(&self) -> u32 {
        match self {
            JenisPajak::Pph21 => 500,
            JenisPajak::Pph22 => 150,
            JenisPajak::Pph23 => 200,
            JenisPajak::Pph4Ayat2 => 1_000,
            JenisPajak::Ppn => 1_100,
        }
    }

    /// Default ledger account (MAP) the withholding is booked to.
    pub fn default_account(&self) -> &'static str {
        match self {
            JenisPajak::Pph21 => "411121",
            JenisPajak::Pph22 => "411122",
            JenisPajak::Pph23 => "411124",
            JenisPajak::Pph4Ayat2 => "411128",
            JenisPajak::Ppn => "411211",
        }
    }
}

impl fmt::Display for JenisPajak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JenisPajak {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JenisPajak::ALL
            .into_iter()
            .find(|j| j.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("jenis_pajak", format!("unknown tax kind `{s}`")))
    }
}

/// Tax line as entered; rate and account fall back to the defaults of the
/// tax kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLineInput {
    pub jenis: JenisPajak,
    pub rate_bps: Option<u32>,
    pub dasar: i64,
    pub akun: Option<String>,
}

impl TaxLineInput {
    pub fn new(jenis: JenisPajak, dasar: i64) -> Self {
        Self {
            jenis,
            rate_bps: None,
            dasar,
            akun: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLine {
    pub jenis: JenisPajak,
    pub rate_bps: u32,
    pub dasar: i64,
    pub jumlah: i64,
    pub akun: String,
}

impl TaxLine {
    pub fn compute(input: &TaxLineInput) -> WorkflowResult<Self> {
        let rate_bps = input.rate_bps.unwrap_or_else(|| input.jenis.default_rate_bps());
        if rate_bps == 0 || rate_bps > FULL_RATE_BPS {
            return Err(WorkflowError::validation(
                "tax_lines.rate",
                format!("{} rate must be between 0.01% and 100%", input.jenis.label()),
            ));
        }
        if input.dasar <= 0 {
            return Err(WorkflowError::validation(
                "tax_lines.dasar",
                format!("{} tax base must be positive", input.jenis.label()),
            ));
        }
        let akun = input
            .akun
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(input.jenis.default_account())
            .to_string();
        // Withholding is rounded down to the rupiah.
        let jumlah = (i128::from(input.dasar) * i128::from(rate_bps) / i128::from(FULL_RATE_BPS)) as i64;
        Ok(Self {
            jenis: input.jenis,
            rate_bps,
            dasar: input.dasar,
            jumlah,
            akun,
        })
    }
}

/// Sum of the withheld amounts, or `None` when it does not fit in an `i64`.
pub fn checked_total(lines: &[TaxLine]) -> Option<i64> {
    lines.iter().try_fold(0i64, |acc, l| acc.checked_add(l.jumlah))
}

/// Saturating sum, for lines that already passed draft validation.
pub fn total(lines: &[TaxLine]) -> i64 {
    lines.iter().fold(0i64, |acc, l| acc.saturating_add(l.jumlah))
}

/// Tax lines usually withheld for a kind of SPM, based on its gross amount.
pub fn suggested_lines(jenis: JenisSpm, nilai: i64) -> Vec<TaxLineInput> {
    jenis
        .suggested_taxes()
        .iter()
        .map(|pajak| TaxLineInput::new(*pajak, nilai))
        .collect()
}
