// Sequential, human-readable document numbering.

pub mod allocator;
pub mod template;

pub use allocator::{AllocatedNumber, AllocationRequest, NumberingAllocator, SeriesTemplates};
pub use template::{roman_month, NumberSeries, ScopeKey, Template, TemplateError};
