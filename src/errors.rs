use thiserror::Error;
use uuid::Uuid;

use crate::documents::DocumentType;
use crate::numbering::ScopeKey;
use crate::roles::Role;

/// Broad classification used for audit and for deciding whether the actor
/// can simply retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    Integrity,
    Upstream,
    NotFound,
    Storage,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("Not authorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Role `{role}` already has an active holder ({holder})")]
    SingleHolderConflict { role: Role, holder: String },

    #[error("{doc_type} {id} was modified concurrently (expected version {expected}); reload and retry")]
    StaleVersion {
        doc_type: DocumentType,
        id: Uuid,
        expected: i64,
    },

    #[error("Number `{number}` already issued in scope {scope}; counter integrity violated")]
    NumberCollision { scope: ScopeKey, number: String },

    #[error("Numbering scope {scope} is missing although numbers were issued from it; administrative repair required")]
    ScopeLost { scope: ScopeKey },

    #[error("{doc_type} {id} not found")]
    NotFound { doc_type: DocumentType, id: Uuid },

    #[error("{0}")]
    Template(#[from] crate::numbering::TemplateError),

    #[error("Notification delivery failed: {0}")]
    Notification(#[from] crate::notifications::NotificationError),

    #[error("Attachment storage failed: {0}")]
    FileStorage(String),

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl WorkflowError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        WorkflowError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation { .. } | WorkflowError::Template(_) => ErrorKind::Validation,
            WorkflowError::Unauthorized { .. } | WorkflowError::SingleHolderConflict { .. } => {
                ErrorKind::Authorization
            }
            WorkflowError::StaleVersion { .. } => ErrorKind::Conflict,
            WorkflowError::NumberCollision { .. } | WorkflowError::ScopeLost { .. } => {
                ErrorKind::Integrity
            }
            WorkflowError::Notification(_) | WorkflowError::FileStorage(_) => ErrorKind::Upstream,
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::Storage(_) => ErrorKind::Storage,
            #[cfg(feature = "database")]
            WorkflowError::Database(_) => ErrorKind::Storage,
        }
    }

    /// Integrity failures need an administrator; everything else can be
    /// retried by the actor with corrected input or a fresh read.
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Integrity
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
