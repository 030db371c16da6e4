use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::AuditLogger;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub audit: Arc<AuditLogger>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            audit,
            started_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &Store {
        self.audit.store()
    }
}
