//! Shared application state for the admin routes.

use crate::dialect::Dialect;
use crate::sync::Synchronizer;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    /// One structural operation at a time; the guard is held across database calls.
    pub sync: Arc<Mutex<Synchronizer>>,
    /// Readiness checks go straight to the database without waiting on `sync`.
    pub dialect: Arc<dyn Dialect>,
}

impl AppState {
    pub fn new(sync: Synchronizer, dialect: Arc<dyn Dialect>) -> Self {
        AppState {
            sync: Arc::new(Mutex::new(sync)),
            dialect,
        }
    }
}
