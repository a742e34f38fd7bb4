//! Shared harness for the integration tests: an engine on either store, a
//! pinned clock, a notification channel that records what it was asked to
//! send, and a cast of users holding every workflow role.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use simpa_bend::config::DatabaseConfig;
use simpa_bend::database::DatabaseManager;
use simpa_bend::notifications::NotificationError;
use simpa_bend::{
    Action, Actor, Channel, Document, DraftContent, FixedClock, JenisSpm, LocalFileStorage, MemoryStore,
    NotificationChannel, NotificationDispatcher, OtpPurpose, Role, SpmStatus, TransitionInput, TransitionResult,
    WorkflowEngine, WorkflowStore,
};

pub const OPD: &str = "dinkes";
pub const ROOT: &str = "root";
pub const ADMIN: &str = "admin";
pub const BENDAHARA: &str = "budi";
pub const RESEPSIONIS: &str = "rina";
pub const PBMD: &str = "putu";
pub const AKUNTANSI: &str = "ani";
pub const PERBENDAHARAAN: &str = "pandu";
pub const KEPALA: &str = "kepala";

/// 2025-06-02 10:00 WIB.
pub fn june_second() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Channel that keeps every message instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingChannel {
    pub fn messages_for(&self, recipient: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.recipient == recipient)
            .cloned()
            .collect()
    }

    /// Digits of the most recent one-time code sent to `recipient`.
    pub fn last_code(&self, recipient: &str) -> Option<String> {
        self.messages_for(recipient)
            .into_iter()
            .rev()
            .find(|m| m.subject.starts_with("Kode verifikasi"))
            .map(|m| m.body.chars().filter(char::is_ascii_digit).collect())
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(SentMessage {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

pub struct Bend {
    pub engine: WorkflowEngine,
    pub store: Arc<dyn WorkflowStore>,
    pub clock: Arc<FixedClock>,
    pub channel: Arc<RecordingChannel>,
    _dir: TempDir,
}

impl Bend {
    fn build(store: Arc<dyn WorkflowStore>, dir: TempDir) -> Self {
        let clock = Arc::new(FixedClock::new(june_second()));
        let channel = Arc::new(RecordingChannel::default());
        let engine = WorkflowEngine::new(store.clone(), Arc::new(LocalFileStorage::new(dir.path().join("files"))))
            .with_clock(clock.clone())
            .with_dispatcher(NotificationDispatcher::new(vec![channel.clone() as Arc<dyn NotificationChannel>]));
        Self {
            engine,
            store,
            clock,
            channel,
            _dir: dir,
        }
    }

    pub fn in_memory() -> Self {
        Self::build(Arc::new(MemoryStore::new()), TempDir::new().unwrap())
    }

    pub async fn on_sqlite() -> Self {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("bend.db").display()),
            max_connections: 4,
            auto_migrate: true,
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        Self::build(Arc::new(manager.store()), dir)
    }

    /// Bootstrap a superadmin and grant every workflow role once.
    pub async fn with_staff(self) -> Self {
        let roles = self.engine.roles();
        roles.bootstrap_superadmin(ROOT).await.unwrap();
        let root = self.actor(ROOT).await;
        roles.assign(&root, ADMIN, Role::Admin, None).await.unwrap();
        roles
            .assign(&root, BENDAHARA, Role::BendaharaOpd, Some(OPD.to_string()))
            .await
            .unwrap();
        for (user, role) in [
            (RESEPSIONIS, Role::Resepsionis),
            (PBMD, Role::Pbmd),
            (AKUNTANSI, Role::Akuntansi),
            (PERBENDAHARAAN, Role::Perbendaharaan),
            (KEPALA, Role::KepalaBkad),
        ] {
            roles.assign(&root, user, role, None).await.unwrap();
        }
        self
    }

    pub async fn actor(&self, user: &str) -> Actor {
        self.engine.actor(user).await.unwrap()
    }

    pub async fn draft(&self, content: DraftContent) -> Document {
        let bendahara = self.actor(BENDAHARA).await;
        self.engine.create_draft(&bendahara, OPD, content).await.unwrap()
    }

    /// Request a code for `user` and read it back from the recorded mail.
    pub async fn otp(&self, user: &str, purpose: OtpPurpose) -> String {
        let actor = self.actor(user).await;
        self.engine.request_otp(&actor, purpose).await.unwrap();
        self.channel.last_code(user).unwrap()
    }

    pub async fn act(
        &self,
        user: &str,
        doc: &Document,
        action: Action,
        note: Option<&str>,
    ) -> Result<TransitionResult, simpa_bend::WorkflowError> {
        let actor = self.actor(user).await;
        let mut input = TransitionInput::new(doc.version);
        if let Some(note) = note {
            input = input.with_note(note);
        }
        let purpose = match (doc.status, action) {
            (SpmStatus::Draft, Action::Submit) | (SpmStatus::PerluRevisi, Action::Resubmit) => {
                Some(OtpPurpose::SubmissionFinalization)
            }
            (SpmStatus::KepalaBkadReview, Action::Approve) => Some(OtpPurpose::DisbursementApproval),
            _ => None,
        };
        if let Some(purpose) = purpose {
            input = input.with_otp(self.otp(user, purpose).await);
        }
        self.engine.transition(&actor, doc.id, action, input).await
    }

    /// Apply `action` as `user`, panicking on refusal, and return the new
    /// document state.
    pub async fn step(&self, user: &str, doc: &Document, action: Action) -> Document {
        self.act(user, doc, action, None)
            .await
            .unwrap_or_else(|e| panic!("{user} {action} from {}: {e}", doc.status))
            .document
    }

    /// Walk the happy path from `draft` up to (and including) `until`.
    pub async fn advance(&self, doc: Document, until: SpmStatus) -> Document {
        let path = [
            (BENDAHARA, Action::Submit),
            (RESEPSIONIS, Action::Receive),
            (RESEPSIONIS, Action::Approve),
            (PBMD, Action::Approve),
            (AKUNTANSI, Action::Approve),
            (PERBENDAHARAAN, Action::Approve),
            (KEPALA, Action::Approve),
        ];
        let mut doc = doc;
        for (user, action) in path {
            if doc.status == until {
                break;
            }
            doc = self.step(user, &doc, action).await;
        }
        assert_eq!(doc.status, until);
        doc
    }

    pub async fn reload(&self, id: Uuid) -> Document {
        self.engine.document(id).await.unwrap()
    }
}

pub fn gu_content() -> DraftContent {
    DraftContent {
        program_id: "1.02.01".to_string(),
        kegiatan_id: "1.02.01.2.01".to_string(),
        sub_kegiatan_id: "1.02.01.2.01.0001".to_string(),
        jenis: JenisSpm::Gu,
        nilai: 25_000_000,
        uraian: "Ganti uang persediaan Juni".to_string(),
        vendor_id: None,
        tax_lines: Vec::new(),
    }
}

pub fn ls_content(vendor: Option<&str>) -> DraftContent {
    DraftContent {
        jenis: JenisSpm::LsBarangJasa,
        nilai: 110_000_000,
        uraian: "Pengadaan alat kesehatan puskesmas".to_string(),
        vendor_id: vendor.map(str::to_string),
        ..gu_content()
    }
}
