//! Delegate selection: capability matching, whitelist and audit trail

pub mod audit;
pub mod matcher;
pub mod whitelist;

pub use audit::{
    BatchSelectionLog, SelectionConclusion, SelectionLogEntry, SelectionLogRecord,
    SelectionLogService,
};
pub use matcher::{can_assign_delegate, extract_selectors, CapabilityMatcher};
pub use whitelist::ConnectionWhitelist;
