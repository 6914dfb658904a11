pub mod export;
pub mod format;
pub mod import;
pub mod merge;

pub use export::{ExportResult, export};
pub use format::{EXPORT_FORMAT, ExportFile, SignedPayload, SyncPayload};
pub use import::{ImportResult, import};
pub use merge::{MergeOutcome, merge};
