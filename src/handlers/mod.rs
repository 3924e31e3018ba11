//! HTTP handlers for schema sync and the history log.

pub mod history;
pub mod sync;
pub use history::*;
pub use sync::*;
