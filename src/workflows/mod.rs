// SPM workflow: status set, central transition table, audit records and
// the engine that commits transitions atomically.

pub mod audit;
pub mod state_machine;
pub mod states;
pub mod transitions;

pub use audit::AuditRecord;
pub use state_machine::{reviewer_for, EngineSettings, TransitionInput, TransitionResult, WorkflowEngine, WIB};
pub use states::{Action, Sp2dStatus, SpmStatus};
pub use transitions::{allowed_actions, find_rule, is_valid_path, Authority, Effect, NoteRule, TransitionRule, TRANSITIONS};
