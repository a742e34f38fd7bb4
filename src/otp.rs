use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::notifications::{NotificationDispatcher, NotificationEvent};
use crate::roles::{Actor, Role};
use crate::storage::WorkflowStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    SubmissionFinalization,
    DisbursementApproval,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::SubmissionFinalization => "submission_finalization",
            OtpPurpose::DisbursementApproval => "disbursement_approval",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OtpPurpose::SubmissionFinalization => "pengajuan SPM",
            OtpPurpose::DisbursementApproval => "persetujuan pencairan",
        }
    }
}

impl fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpPurpose {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "submission_finalization" | "submission" => Ok(OtpPurpose::SubmissionFinalization),
            "disbursement_approval" | "disbursement" => Ok(OtpPurpose::DisbursementApproval),
            other => Err(WorkflowError::validation("purpose", format!("unknown OTP purpose `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub user_id: String,
    pub purpose: OtpPurpose,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub failed_attempts: u32,
}

/// Identifies the code a transition consumes inside its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpConsumption {
    pub user_id: String,
    pub purpose: OtpPurpose,
    pub code: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<String>,
    pub changed_by: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyAudit {
    pub id: Uuid,
    pub actor: String,
    pub activated: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Outcome of checking the one-time-code gate for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Emergency mode is on; no code needed.
    Bypassed,
    /// Code looks valid; it is consumed with the transition commit.
    Verified(OtpConsumption),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpSettings {
    pub length: usize,
    pub ttl: Duration,
    /// Wrong guesses allowed before the live code is burned.
    pub max_attempts: u32,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            length: 6,
            ttl: Duration::minutes(5),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub purpose: OtpPurpose,
    pub expires_at: DateTime<Utc>,
    pub channels_delivered: usize,
}

/// One-time-code gate for sensitive transitions, plus the emergency
/// switch that bypasses it.
#[derive(Clone)]
pub struct OtpGate {
    store: Arc<dyn WorkflowStore>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    settings: OtpSettings,
}

impl OtpGate {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        settings: OtpSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            settings,
        }
    }

    /// Generate a code, deliver it out-of-band and only then remember it.
    /// A code no channel accepted is never stored.
    pub async fn issue(&self, actor: &Actor, purpose: OtpPurpose) -> WorkflowResult<IssuedCode> {
        let code = generate_code(self.settings.length);
        let channels_delivered = self
            .dispatcher
            .deliver_code(&actor.user_id, purpose, &code)
            .await?;

        let expires_at = self.clock.now() + self.settings.ttl;
        self.store
            .store_otp(&OneTimeCode {
                user_id: actor.user_id.clone(),
                purpose,
                code,
                expires_at,
                consumed: false,
                failed_attempts: 0,
            })
            .await?;
        info!(user = %actor.user_id, purpose = %purpose, channels_delivered, "One-time code issued");
        Ok(IssuedCode {
            purpose,
            expires_at,
            channels_delivered,
        })
    }

    /// Decide whether a gated transition may proceed. The code itself is
    /// consumed later, atomically with the transition.
    pub async fn check(
        &self,
        actor: &Actor,
        purpose: OtpPurpose,
        code: Option<&str>,
    ) -> WorkflowResult<GateDecision> {
        if self.store.emergency_state().await?.active {
            warn!(user = %actor.user_id, purpose = %purpose, "One-time code gate bypassed by emergency mode");
            return Ok(GateDecision::Bypassed);
        }
        let code = code
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| WorkflowError::validation("otp", format!("a one-time code for {} is required", purpose.label())))?;

        let now = self.clock.now();
        let stored = self.store.find_otp(&actor.user_id, purpose).await?;
        match stored {
            Some(otp) if !otp.consumed && otp.expires_at > now && otp.code == code => {
                Ok(GateDecision::Verified(OtpConsumption {
                    user_id: actor.user_id.clone(),
                    purpose,
                    code: code.to_string(),
                    now,
                }))
            }
            Some(otp) if otp.code == code && otp.expires_at <= now => Err(WorkflowError::unauthorized(
                "one-time code has expired; request a new one",
            )),
            Some(otp) if !otp.consumed && otp.expires_at > now => {
                let attempts = self
                    .store
                    .record_otp_failure(&actor.user_id, purpose, self.settings.max_attempts)
                    .await?;
                warn!(user = %actor.user_id, purpose = %purpose, attempts, "Wrong one-time code");
                if attempts >= self.settings.max_attempts {
                    Err(WorkflowError::unauthorized(
                        "too many wrong one-time codes; request a new one",
                    ))
                } else {
                    Err(WorkflowError::unauthorized("one-time code is invalid or already used"))
                }
            }
            _ => Err(WorkflowError::unauthorized("one-time code is invalid or already used")),
        }
    }

    pub async fn emergency_state(&self) -> WorkflowResult<EmergencyState> {
        self.store.emergency_state().await
    }

    /// Switch emergency mode. Superadmin only, reason mandatory, always
    /// audit-logged.
    pub async fn set_emergency(
        &self,
        actor: &Actor,
        active: bool,
        reason: &str,
    ) -> WorkflowResult<EmergencyState> {
        if !actor.is_superadmin() {
            return Err(WorkflowError::unauthorized(format!(
                "only a {} may change emergency mode",
                Role::Superadmin
            )));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::validation("reason", "emergency mode changes require a reason"));
        }

        let now = self.clock.now();
        let state = EmergencyState {
            active,
            reason: Some(reason.to_string()),
            changed_by: Some(actor.user_id.clone()),
            changed_at: Some(now),
        };
        let audit = EmergencyAudit {
            id: Uuid::new_v4(),
            actor: actor.user_id.clone(),
            activated: active,
            reason: reason.to_string(),
            at: now,
        };
        self.store.set_emergency_state(&state, &audit).await?;
        warn!(actor = %actor.user_id, active, reason = %reason, "Emergency mode changed");

        self.dispatcher
            .notify(
                &actor.user_id,
                &NotificationEvent::EmergencyMode {
                    active,
                    reason: reason.to_string(),
                },
            )
            .await;
        Ok(state)
    }

    pub async fn emergency_history(&self) -> WorkflowResult<Vec<EmergencyAudit>> {
        self.store.emergency_history().await
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length.max(4))
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}
