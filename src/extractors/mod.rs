pub mod options;

pub use options::{SyncOptions, RECORD_HEADER, SCOPE_HEADER};
