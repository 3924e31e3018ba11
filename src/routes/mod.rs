pub mod common;
pub mod sync;

pub use common::{common_routes, common_routes_with_ready};
pub use sync::sync_routes;
