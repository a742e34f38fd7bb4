use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::workflow_metrics;
use crate::otp::OtpPurpose;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Email,
    WhatsApp,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Email => f.write_str("email"),
            Channel::WhatsApp => f.write_str("whatsapp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("{channel} delivery to `{recipient}` failed: {message}")]
    Delivery {
        channel: Channel,
        recipient: String,
        message: String,
    },
    #[error("no notification channel is enabled")]
    NoChannels,
    #[error("no channel delivered the message to `{recipient}`")]
    Undelivered { recipient: String },
}

/// Something the core wants a user to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    StatusChanged {
        document_id: Uuid,
        from: String,
        to: String,
        note: Option<String>,
    },
    AwaitingReview {
        document_id: Uuid,
        stage: String,
    },
    Sp2dIssued {
        spm_id: Uuid,
        nomor_sp2d: String,
    },
    EmergencyMode {
        active: bool,
        reason: String,
    },
}

impl NotificationEvent {
    pub fn subject(&self) -> String {
        match self {
            NotificationEvent::StatusChanged { to, .. } => format!("Status SPM berubah: {to}"),
            NotificationEvent::AwaitingReview { stage, .. } => {
                format!("SPM menunggu verifikasi ({stage})")
            }
            NotificationEvent::Sp2dIssued { nomor_sp2d, .. } => format!("SP2D {nomor_sp2d} terbit"),
            NotificationEvent::EmergencyMode { active: true, .. } => "Mode darurat diaktifkan".to_string(),
            NotificationEvent::EmergencyMode { active: false, .. } => "Mode darurat dinonaktifkan".to_string(),
        }
    }

    pub fn body(&self) -> String {
        match self {
            NotificationEvent::StatusChanged {
                document_id,
                from,
                to,
                note,
            } => {
                let mut body = format!("SPM {document_id} berpindah dari {from} ke {to}.");
                if let Some(note) = note {
                    body.push_str(&format!("\nCatatan: {note}"));
                }
                body
            }
            NotificationEvent::AwaitingReview { document_id, stage } => {
                format!("SPM {document_id} menunggu tindakan Anda pada tahap {stage}.")
            }
            NotificationEvent::Sp2dIssued { spm_id, nomor_sp2d } => {
                format!("SP2D nomor {nomor_sp2d} diterbitkan untuk SPM {spm_id}.")
            }
            NotificationEvent::EmergencyMode { reason, .. } => format!("Alasan: {reason}"),
        }
    }
}

/// One outbound channel (SMTP, WhatsApp gateway, ...).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotificationError>;
}

/// Channel that only writes to the log; the default when no gateway is
/// configured. Bodies, and with them one-time codes, are left out unless
/// `with_body` turns them on.
#[derive(Debug, Clone, Copy)]
pub struct LogChannel {
    channel: Channel,
    include_body: bool,
}

impl LogChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            include_body: false,
        }
    }

    pub fn with_body(mut self, include_body: bool) -> Self {
        self.include_body = include_body;
        self
    }

    pub fn includes_body(&self) -> bool {
        self.include_body
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotificationError> {
        if self.include_body {
            info!(
                channel = %self.channel,
                recipient = %recipient,
                subject = %subject,
                body = %body,
                "Notification sent"
            );
        } else {
            info!(
                channel = %self.channel,
                recipient = %recipient,
                subject = %subject,
                body_len = body.len(),
                "Notification sent"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver a one-time code on every channel. The code counts as sent
    /// when at least one channel accepted it; returns how many did.
    pub async fn deliver_code(
        &self,
        recipient: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<usize, NotificationError> {
        if self.channels.is_empty() {
            return Err(NotificationError::NoChannels);
        }
        let subject = format!("Kode verifikasi {}", purpose.label());
        let body = format!("Kode Anda: {code}. Jangan berikan kode ini kepada siapa pun.");

        let mut delivered = 0;
        for channel in &self.channels {
            match channel.send(recipient, &subject, &body).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    workflow_metrics().record_notification_failure();
                    warn!(channel = %channel.channel(), error = %e, "One-time code delivery failed");
                }
            }
        }
        if delivered == 0 {
            return Err(NotificationError::Undelivered {
                recipient: recipient.to_string(),
            });
        }
        debug!(recipient = %recipient, delivered, "One-time code delivered");
        Ok(delivered)
    }

    /// Fire-and-forget: failures are logged, never returned.
    pub async fn notify(&self, recipient: &str, event: &NotificationEvent) {
        let subject = event.subject();
        let body = event.body();
        for channel in &self.channels {
            if let Err(e) = channel.send(recipient, &subject, &body).await {
                workflow_metrics().record_notification_failure();
                warn!(channel = %channel.channel(), recipient = %recipient, error = %e, "Notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(channel: Channel) -> MockNotificationChannel {
        let mut mock = MockNotificationChannel::new();
        mock.expect_channel().return_const(channel);
        mock.expect_send().returning(move |recipient, _, _| {
            Err(NotificationError::Delivery {
                channel,
                recipient: recipient.to_string(),
                message: "gateway down".to_string(),
            })
        });
        mock
    }

    #[tokio::test]
    async fn code_counts_as_sent_if_one_channel_delivers() {
        let mut email = MockNotificationChannel::new();
        email.expect_channel().return_const(Channel::Email);
        email
            .expect_send()
            .withf(|recipient, _, body| recipient.to_string() == "budi" && body.contains("123456"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let dispatcher = NotificationDispatcher::new(vec![
            Arc::new(email),
            Arc::new(failing(Channel::WhatsApp)),
        ]);
        let delivered = dispatcher
            .deliver_code("budi", OtpPurpose::SubmissionFinalization, "123456")
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn log_channel_keeps_bodies_out_unless_asked() {
        let quiet = LogChannel::new(Channel::Email);
        assert!(!quiet.includes_body());
        let verbose = quiet.with_body(true);
        assert!(verbose.includes_body());

        let dispatcher = NotificationDispatcher::new(vec![Arc::new(quiet), Arc::new(verbose)]);
        let delivered = dispatcher
            .deliver_code("budi", OtpPurpose::SubmissionFinalization, "654321")
            .await
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn code_fails_when_every_channel_fails() {
        let dispatcher = NotificationDispatcher::new(vec![
            Arc::new(failing(Channel::Email)),
            Arc::new(failing(Channel::WhatsApp)),
        ]);
        let err = dispatcher
            .deliver_code("budi", OtpPurpose::DisbursementApproval, "000111")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NotificationError::Undelivered {
                recipient: "budi".to_string()
            }
        );

        let none = NotificationDispatcher::default();
        assert_eq!(
            none.deliver_code("budi", OtpPurpose::DisbursementApproval, "1").await,
            Err(NotificationError::NoChannels)
        );
    }

    #[tokio::test]
    async fn event_failures_are_swallowed() {
        let dispatcher = NotificationDispatcher::new(vec![Arc::new(failing(Channel::Email))]);
        dispatcher
            .notify(
                "sri",
                &NotificationEvent::EmergencyMode {
                    active: true,
                    reason: "server OTP down".to_string(),
                },
            )
            .await;
    }

    #[test]
    fn status_change_body_includes_note() {
        let event = NotificationEvent::StatusChanged {
            document_id: Uuid::nil(),
            from: "pbmd_verifikasi".to_string(),
            to: "perlu_revisi".to_string(),
            note: Some("lampiran kurang".to_string()),
        };
        assert!(event.subject().contains("perlu_revisi"));
        assert!(event.body().contains("lampiran kurang"));
    }
}
