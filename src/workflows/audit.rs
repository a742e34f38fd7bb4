use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::states::{Action, Sp2dStatus, SpmStatus};
use crate::documents::DocumentType;

/// Immutable trail entry written in the same commit as the change it
/// describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub doc_type: DocumentType,
    pub document_id: Uuid,
    pub actor: String,
    pub action: Action,
    /// `None` for creation.
    pub from_state: Option<String>,
    pub to_state: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn spm(
        document_id: Uuid,
        actor: &str,
        action: Action,
        from: Option<SpmStatus>,
        to: SpmStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_type: DocumentType::Spm,
            document_id,
            actor: actor.to_string(),
            action,
            from_state: from.map(|s| s.as_str().to_string()),
            to_state: to.as_str().to_string(),
            note,
            at,
        }
    }

    pub fn sp2d(
        sp2d_id: Uuid,
        actor: &str,
        action: Action,
        from: Option<Sp2dStatus>,
        to: Sp2dStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_type: DocumentType::Sp2d,
            document_id: sp2d_id,
            actor: actor.to_string(),
            action,
            from_state: from.map(|s| s.as_str().to_string()),
            to_state: to.as_str().to_string(),
            note,
            at,
        }
    }
}
