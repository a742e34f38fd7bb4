//! Role assignment rules, the one-time-code gate and emergency mode.

use chrono::Duration;

use simpa_bend::{Action, ErrorKind, OtpPurpose, Role, SpmStatus, TransitionInput, WorkflowError};

mod fixtures;
use fixtures::{gu_content, Bend, ADMIN, BENDAHARA, RESEPSIONIS, ROOT};

#[tokio::test]
async fn single_holder_roles_refuse_a_second_holder() {
    let bend = Bend::in_memory().with_staff().await;
    let root = bend.actor(ROOT).await;
    let roles = bend.engine.roles();

    let err = roles.assign(&root, "sari", Role::Resepsionis, None).await.unwrap_err();
    match err {
        WorkflowError::SingleHolderConflict { role, ref holder } => {
            assert_eq!(role, Role::Resepsionis);
            assert_eq!(holder, RESEPSIONIS);
        }
        other => panic!("expected a single-holder conflict, got {other:?}"),
    }

    roles.revoke(&root, RESEPSIONIS, Role::Resepsionis).await.unwrap();
    roles.assign(&root, "sari", Role::Resepsionis, None).await.unwrap();
    let holders = roles.holders(Role::Resepsionis).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].user_id, "sari");
}

#[tokio::test]
async fn single_holder_is_enforced_by_sqlite_too() {
    let bend = Bend::on_sqlite().await.with_staff().await;
    let root = bend.actor(ROOT).await;
    let err = bend
        .engine
        .roles()
        .assign(&root, "kepala2", Role::KepalaBkad, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::SingleHolderConflict { role: Role::KepalaBkad, .. }));
}

#[tokio::test]
async fn treasury_officers_share_nothing_but_need_an_opd() {
    let bend = Bend::in_memory().with_staff().await;
    let admin = bend.actor(ADMIN).await;
    let roles = bend.engine.roles();

    roles
        .assign(&admin, "wati", Role::BendaharaOpd, Some("dispora".to_string()))
        .await
        .unwrap();
    let err = roles.assign(&admin, "wati2", Role::BendaharaOpd, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "opd_id"));

    let err = roles.assign(&admin, "eko", Role::Admin, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Unauthorized { .. }));

    let err = roles.bootstrap_superadmin("intruder").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Unauthorized { .. }));
}

#[tokio::test]
async fn submission_requires_a_fresh_one_time_code() {
    let bend = Bend::in_memory().with_staff().await;
    let bendahara = bend.actor(BENDAHARA).await;
    let doc = bend.draft(gu_content()).await;

    let err = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "otp"));

    let code = bend.otp(BENDAHARA, OtpPurpose::SubmissionFinalization).await;
    let wrong: String = code.chars().map(|c| if c == '0' { '1' } else { '0' }).collect();
    let err = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(wrong))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(bend.reload(doc.id).await.status, SpmStatus::Draft);

    let submitted = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(code.clone()))
        .await
        .unwrap();
    assert!(!submitted.emergency_bypass);

    // the code was consumed with the transition
    let other = bend.draft(gu_content()).await;
    let err = bend
        .engine
        .transition(&bendahara, other.id, Action::Submit, TransitionInput::new(other.version).with_otp(code))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn expired_codes_are_refused() {
    let bend = Bend::in_memory().with_staff().await;
    let bendahara = bend.actor(BENDAHARA).await;
    let doc = bend.draft(gu_content()).await;

    let code = bend.otp(BENDAHARA, OtpPurpose::SubmissionFinalization).await;
    bend.clock.advance(Duration::minutes(6));
    let err = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(code))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expired"));
}

#[tokio::test]
async fn codes_are_bound_to_their_purpose() {
    let bend = Bend::on_sqlite().await.with_staff().await;
    let bendahara = bend.actor(BENDAHARA).await;
    let doc = bend.draft(gu_content()).await;

    let code = bend.otp(BENDAHARA, OtpPurpose::DisbursementApproval).await;
    let err = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(code))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn guessing_is_cut_off_after_five_wrong_codes() {
    let bend = Bend::on_sqlite().await.with_staff().await;
    let bendahara = bend.actor(BENDAHARA).await;
    let doc = bend.draft(gu_content()).await;

    let code = bend.otp(BENDAHARA, OtpPurpose::SubmissionFinalization).await;
    let wrong: String = code.chars().map(|c| if c == '9' { '0' } else { '9' }).collect();
    let mut last = None;
    for _ in 0..5 {
        last = Some(
            bend.engine
                .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(wrong.clone()))
                .await
                .unwrap_err(),
        );
    }
    assert!(last.unwrap().to_string().contains("too many"));

    let err = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(code))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(bend.reload(doc.id).await.status, SpmStatus::Draft);

    let fresh = bend.otp(BENDAHARA, OtpPurpose::SubmissionFinalization).await;
    let submitted = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_otp(fresh))
        .await
        .unwrap();
    assert_eq!(submitted.document.status, SpmStatus::Diajukan);
}

#[tokio::test]
async fn emergency_mode_bypasses_the_gate_and_says_so() {
    let bend = Bend::in_memory().with_staff().await;
    let root = bend.actor(ROOT).await;
    let admin = bend.actor(ADMIN).await;
    let bendahara = bend.actor(BENDAHARA).await;

    let err = bend.engine.set_emergency(&admin, true, "gateway SMS mati").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    let err = bend.engine.set_emergency(&root, true, "  ").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "reason"));

    bend.engine.set_emergency(&root, true, "gateway SMS mati").await.unwrap();
    let doc = bend.draft(gu_content()).await;
    let submitted = bend
        .engine
        .transition(&bendahara, doc.id, Action::Submit, TransitionInput::new(doc.version).with_note("mendesak"))
        .await
        .unwrap();
    assert!(submitted.emergency_bypass);

    let trail = bend.engine.history(doc.id).await.unwrap();
    let submit = trail.iter().find(|r| r.action == Action::Submit).unwrap();
    let note = submit.note.as_deref().unwrap();
    assert!(note.starts_with("mendesak"));
    assert!(note.contains("mode darurat"));

    bend.engine.set_emergency(&root, false, "gateway pulih").await.unwrap();
    let gate = bend.engine.otp_gate();
    assert!(!gate.emergency_state().await.unwrap().active);
    let history = gate.emergency_history().await.unwrap();
    assert_eq!(history.iter().map(|h| h.activated).collect::<Vec<_>>(), vec![true, false]);

    let next = bend.draft(gu_content()).await;
    let err = bend
        .engine
        .transition(&bendahara, next.id, Action::Submit, TransitionInput::new(next.version))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
