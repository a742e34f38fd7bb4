// SIMPA BEND Library - SPM/SP2D workflow and document numbering
// This exposes the core components for the CLI, tests and integration

pub mod attachments;
pub mod clock;
pub mod config;
pub mod database;
pub mod documents;
pub mod errors;
pub mod notifications;
pub mod numbering;
pub mod observability;
pub mod otp;
pub mod roles;
pub mod storage;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use attachments::{FileStorage, LocalFileStorage};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{config, init_config, SimpaBendConfig};
pub use database::{init_database, shutdown_database};
pub use documents::{Document, DocumentFilter, DocumentType, DraftContent, JenisPajak, JenisSpm, Sp2d, TaxLineInput};
pub use errors::{ErrorKind, WorkflowError, WorkflowResult};
pub use notifications::{Channel, LogChannel, NotificationChannel, NotificationDispatcher, NotificationEvent};
pub use numbering::{NumberSeries, NumberingAllocator, ScopeKey, SeriesTemplates, Template};
pub use observability::{workflow_metrics, OperationTimer, WorkflowMetrics};
pub use otp::{OtpGate, OtpPurpose, OtpSettings};
pub use roles::{Actor, Role, RoleAssignment, RoleRegistry};
pub use storage::{MemoryStore, WorkflowStore};
#[cfg(feature = "database")]
pub use storage::SqliteStore;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflows::{
    Action, AuditRecord, EngineSettings, Sp2dStatus, SpmStatus, TransitionInput, TransitionResult, WorkflowEngine,
};
