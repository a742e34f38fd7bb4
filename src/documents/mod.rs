// SPM / SP2D document model, tax withholding lines and draft validation.

pub mod tax;
pub mod types;
pub mod validation;

pub use tax::{suggested_lines, JenisPajak, TaxLine, TaxLineInput};
pub use types::{Attachment, Document, DocumentFilter, DocumentType, DraftContent, JenisSpm, Sp2d};
pub use validation::validate_draft;
