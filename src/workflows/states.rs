use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::WorkflowError;

/// Status of an SPM. The set is closed; storage rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpmStatus {
    Draft,
    Diajukan,
    ResepsionisVerifikasi,
    PbmdVerifikasi,
    AkuntansiVerifikasi,
    PerbendaharaanVerifikasi,
    KepalaBkadReview,
    Disetujui,
    PerluRevisi,
    Ditolak,
}

impl SpmStatus {
    pub const ALL: [SpmStatus; 10] = [
        SpmStatus::Draft,
        SpmStatus::Diajukan,
        SpmStatus::ResepsionisVerifikasi,
        SpmStatus::PbmdVerifikasi,
        SpmStatus::AkuntansiVerifikasi,
        SpmStatus::PerbendaharaanVerifikasi,
        SpmStatus::KepalaBkadReview,
        SpmStatus::Disetujui,
        SpmStatus::PerluRevisi,
        SpmStatus::Ditolak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpmStatus::Draft => "draft",
            SpmStatus::Diajukan => "diajukan",
            SpmStatus::ResepsionisVerifikasi => "resepsionis_verifikasi",
            SpmStatus::PbmdVerifikasi => "pbmd_verifikasi",
            SpmStatus::AkuntansiVerifikasi => "akuntansi_verifikasi",
            SpmStatus::PerbendaharaanVerifikasi => "perbendaharaan_verifikasi",
            SpmStatus::KepalaBkadReview => "kepala_bkad_review",
            SpmStatus::Disetujui => "disetujui",
            SpmStatus::PerluRevisi => "perlu_revisi",
            SpmStatus::Ditolak => "ditolak",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpmStatus::Draft => "Draft",
            SpmStatus::Diajukan => "Diajukan",
            SpmStatus::ResepsionisVerifikasi => "Verifikasi Resepsionis",
            SpmStatus::PbmdVerifikasi => "Verifikasi PBMD",
            SpmStatus::AkuntansiVerifikasi => "Verifikasi Akuntansi",
            SpmStatus::PerbendaharaanVerifikasi => "Verifikasi Perbendaharaan",
            SpmStatus::KepalaBkadReview => "Review Kepala BKAD",
            SpmStatus::Disetujui => "Disetujui",
            SpmStatus::PerluRevisi => "Perlu Revisi",
            SpmStatus::Ditolak => "Ditolak",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SpmStatus::Disetujui | SpmStatus::Ditolak)
    }

    /// Stages in which a reviewer may ask for revision or reject.
    pub fn is_review_stage(&self) -> bool {
        matches!(
            self,
            SpmStatus::ResepsionisVerifikasi
                | SpmStatus::PbmdVerifikasi
                | SpmStatus::AkuntansiVerifikasi
                | SpmStatus::PerbendaharaanVerifikasi
                | SpmStatus::KepalaBkadReview
        )
    }
}

impl fmt::Display for SpmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpmStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpmStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("status", format!("unknown SPM status `{s}`")))
    }
}

/// Status of an SP2D from issuance to the bank's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sp2dStatus {
    /// Issued at treasury approval, waiting for the head of agency.
    MenungguPersetujuan,
    /// Approved and queued for dispatch to the paying bank.
    SiapKirim,
    DikirimBank,
    Cair,
    Dibatalkan,
}

impl Sp2dStatus {
    pub const ALL: [Sp2dStatus; 5] = [
        Sp2dStatus::MenungguPersetujuan,
        Sp2dStatus::SiapKirim,
        Sp2dStatus::DikirimBank,
        Sp2dStatus::Cair,
        Sp2dStatus::Dibatalkan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sp2dStatus::MenungguPersetujuan => "menunggu_persetujuan",
            Sp2dStatus::SiapKirim => "siap_kirim",
            Sp2dStatus::DikirimBank => "dikirim_bank",
            Sp2dStatus::Cair => "cair",
            Sp2dStatus::Dibatalkan => "dibatalkan",
        }
    }
}

impl fmt::Display for Sp2dStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sp2dStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sp2dStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("status", format!("unknown SP2D status `{s}`")))
    }
}

/// What an actor asks to do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Submit,
    Receive,
    Approve,
    RequestRevision,
    Reject,
    Resubmit,
    // Actions below never appear in the SPM table; they label audit rows.
    Create,
    Archive,
    IssueSp2d,
    Dispatch,
    RecordExecution,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Submit,
        Action::Receive,
        Action::Approve,
        Action::RequestRevision,
        Action::Reject,
        Action::Resubmit,
        Action::Create,
        Action::Archive,
        Action::IssueSp2d,
        Action::Dispatch,
        Action::RecordExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Receive => "receive",
            Action::Approve => "approve",
            Action::RequestRevision => "request_revision",
            Action::Reject => "reject",
            Action::Resubmit => "resubmit",
            Action::Create => "create",
            Action::Archive => "archive",
            Action::IssueSp2d => "issue_sp2d",
            Action::Dispatch => "dispatch",
            Action::RecordExecution => "record_execution",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("action", format!("unknown action `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names_match_serde() {
        for status in SpmStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<SpmStatus>().unwrap(), status);
        }
        for status in Sp2dStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = SpmStatus::ALL.into_iter().filter(SpmStatus::is_terminal).collect();
        assert_eq!(terminal, vec![SpmStatus::Disetujui, SpmStatus::Ditolak]);
        assert!("selesai".parse::<SpmStatus>().is_err());
    }
}
