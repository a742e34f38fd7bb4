// Central transition table for SPM documents. Callers never derive legal
// moves themselves; they look them up here.

use crate::documents::Document;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::otp::OtpPurpose;
use crate::roles::{Actor, Role};

use super::states::{Action, SpmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteRule {
    Optional,
    /// Rejections and revision requests must say why.
    ReasonRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Treasury officer of the document's own OPD.
    Submitter,
    Stage(Role),
}

/// Side effect committed atomically with the status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Stamp the submission date and mint queue and file numbers (first
    /// submission only).
    AllocateIntakeNumbers,
    /// Create the SP2D and mint its number, unless one already exists.
    IssueSp2d,
    /// Head of agency approved: queue the SP2D for dispatch.
    ReleaseSp2d,
    /// Cancel the SP2D if one was issued. Its number stays spent.
    VoidSp2d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: SpmStatus,
    pub action: Action,
    pub to: SpmStatus,
    pub authority: Authority,
    pub note: NoteRule,
    pub gate: Option<OtpPurpose>,
    pub effect: Effect,
}

const fn rule(
    from: SpmStatus,
    action: Action,
    to: SpmStatus,
    authority: Authority,
    note: NoteRule,
    gate: Option<OtpPurpose>,
    effect: Effect,
) -> TransitionRule {
    TransitionRule {
        from,
        action,
        to,
        authority,
        note,
        gate,
        effect,
    }
}

use Action::*;
use Authority::{Stage, Submitter};
use NoteRule::{Optional, ReasonRequired};
use SpmStatus::*;

pub const TRANSITIONS: &[TransitionRule] = &[
    // Forward path.
    rule(Draft, Submit, Diajukan, Submitter, Optional, Some(OtpPurpose::SubmissionFinalization), Effect::AllocateIntakeNumbers),
    rule(Diajukan, Receive, ResepsionisVerifikasi, Stage(Role::Resepsionis), Optional, None, Effect::None),
    rule(ResepsionisVerifikasi, Approve, PbmdVerifikasi, Stage(Role::Resepsionis), Optional, None, Effect::None),
    rule(PbmdVerifikasi, Approve, AkuntansiVerifikasi, Stage(Role::Pbmd), Optional, None, Effect::None),
    rule(AkuntansiVerifikasi, Approve, PerbendaharaanVerifikasi, Stage(Role::Akuntansi), Optional, None, Effect::None),
    rule(PerbendaharaanVerifikasi, Approve, KepalaBkadReview, Stage(Role::Perbendaharaan), Optional, None, Effect::IssueSp2d),
    rule(KepalaBkadReview, Approve, Disetujui, Stage(Role::KepalaBkad), Optional, Some(OtpPurpose::DisbursementApproval), Effect::ReleaseSp2d),
    // Revision requests.
    rule(ResepsionisVerifikasi, RequestRevision, PerluRevisi, Stage(Role::Resepsionis), ReasonRequired, None, Effect::None),
    rule(PbmdVerifikasi, RequestRevision, PerluRevisi, Stage(Role::Pbmd), ReasonRequired, None, Effect::None),
    rule(AkuntansiVerifikasi, RequestRevision, PerluRevisi, Stage(Role::Akuntansi), ReasonRequired, None, Effect::None),
    rule(PerbendaharaanVerifikasi, RequestRevision, PerluRevisi, Stage(Role::Perbendaharaan), ReasonRequired, None, Effect::None),
    rule(KepalaBkadReview, RequestRevision, PerluRevisi, Stage(Role::KepalaBkad), ReasonRequired, None, Effect::None),
    // Rejections. An SP2D survives a revision loop, so any stage may
    // have one to void.
    rule(ResepsionisVerifikasi, Reject, Ditolak, Stage(Role::Resepsionis), ReasonRequired, None, Effect::VoidSp2d),
    rule(PbmdVerifikasi, Reject, Ditolak, Stage(Role::Pbmd), ReasonRequired, None, Effect::VoidSp2d),
    rule(AkuntansiVerifikasi, Reject, Ditolak, Stage(Role::Akuntansi), ReasonRequired, None, Effect::VoidSp2d),
    rule(PerbendaharaanVerifikasi, Reject, Ditolak, Stage(Role::Perbendaharaan), ReasonRequired, None, Effect::VoidSp2d),
    rule(KepalaBkadReview, Reject, Ditolak, Stage(Role::KepalaBkad), ReasonRequired, None, Effect::VoidSp2d),
    // Resubmission restarts the whole review chain.
    rule(PerluRevisi, Resubmit, Diajukan, Submitter, Optional, Some(OtpPurpose::SubmissionFinalization), Effect::AllocateIntakeNumbers),
];

pub fn find_rule(from: SpmStatus, action: Action) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|r| r.from == from && r.action == action)
}

pub fn allowed_actions(from: SpmStatus) -> Vec<Action> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == from)
        .map(|r| r.action)
        .collect()
}

/// True if every consecutive pair of statuses is an edge of the table.
pub fn is_valid_path(statuses: &[SpmStatus]) -> bool {
    statuses
        .windows(2)
        .all(|pair| TRANSITIONS.iter().any(|r| r.from == pair[0] && r.to == pair[1]))
}

impl TransitionRule {
    pub fn authorize(&self, actor: &Actor, doc: &Document) -> WorkflowResult<()> {
        let permitted = match self.authority {
            Authority::Submitter => actor.can_submit_for(&doc.opd_id),
            Authority::Stage(role) => actor.can_act_as(role),
        };
        if permitted {
            return Ok(());
        }
        let needed = match self.authority {
            Authority::Submitter => format!("treasury officer of OPD `{}`", doc.opd_id),
            Authority::Stage(role) => format!("role `{role}`"),
        };
        Err(WorkflowError::unauthorized(format!(
            "`{}` on a {} document requires {needed}; user `{}` holds {:?}",
            self.action,
            self.from,
            actor.user_id,
            actor.roles()
        )))
    }

    /// Normalise the note and enforce a mandatory reason where required.
    pub fn check_note(&self, note: Option<&str>) -> WorkflowResult<Option<String>> {
        let note = note.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        if self.note == NoteRule::ReasonRequired && note.is_none() {
            return Err(WorkflowError::validation(
                "reason",
                format!("`{}` requires a reason", self.action),
            ));
        }
        Ok(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_has_no_duplicate_edges() {
        let keys: HashSet<_> = TRANSITIONS.iter().map(|r| (r.from, r.action)).collect();
        assert_eq!(keys.len(), TRANSITIONS.len());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(allowed_actions(Disetujui).is_empty());
        assert!(allowed_actions(Ditolak).is_empty());
    }

    #[test]
    fn every_review_stage_can_revise_and_reject() {
        for status in SpmStatus::ALL.into_iter().filter(SpmStatus::is_review_stage) {
            let actions = allowed_actions(status);
            assert!(actions.contains(&RequestRevision), "{status} lacks revision");
            assert!(actions.contains(&Reject), "{status} lacks rejection");
            assert_eq!(find_rule(status, Reject).unwrap().note, ReasonRequired);
        }
    }

    #[test]
    fn happy_path_is_valid_and_skipping_is_not() {
        let happy = [
            Draft,
            Diajukan,
            ResepsionisVerifikasi,
            PbmdVerifikasi,
            AkuntansiVerifikasi,
            PerbendaharaanVerifikasi,
            KepalaBkadReview,
            Disetujui,
        ];
        assert!(is_valid_path(&happy));
        assert!(!is_valid_path(&[Draft, Diajukan, PbmdVerifikasi]));
        assert!(!is_valid_path(&[PerluRevisi, PbmdVerifikasi]));
        assert!(is_valid_path(&[PbmdVerifikasi, PerluRevisi, Diajukan]));
    }

    #[test]
    fn sp2d_is_issued_only_at_treasury_approval() {
        let issuing: Vec<_> = TRANSITIONS
            .iter()
            .filter(|r| r.effect == Effect::IssueSp2d)
            .collect();
        assert_eq!(issuing.len(), 1);
        assert_eq!(issuing[0].from, PerbendaharaanVerifikasi);
        assert_eq!(issuing[0].action, Approve);
    }

    #[test]
    fn every_rejection_voids_a_leftover_sp2d() {
        for rule in TRANSITIONS.iter().filter(|r| r.action == Reject) {
            assert_eq!(rule.effect, Effect::VoidSp2d, "{} reject keeps its SP2D", rule.from);
        }
    }

    #[test]
    fn reason_is_trimmed_and_required() {
        let reject = find_rule(PbmdVerifikasi, Reject).unwrap();
        assert!(reject.check_note(None).is_err());
        assert!(reject.check_note(Some("   ")).is_err());
        assert_eq!(
            reject.check_note(Some(" kode rekening salah ")).unwrap().as_deref(),
            Some("kode rekening salah")
        );
        let approve = find_rule(PbmdVerifikasi, Approve).unwrap();
        assert_eq!(approve.check_note(None).unwrap(), None);
    }
}
