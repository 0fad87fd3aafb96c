use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    #[serde(alias = "APPLIED_SUCCESSFULLY", alias = "applied_successfully")]
    Applied,
    #[serde(alias = "failed_during_reset", alias = "FAILED")]
    Failed,
}

/// One entry of a project's migration ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub status: MigrationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(alias = "query", default)]
    pub statement: String,
}

impl Migration {
    pub fn applied(version: String, name: String, statement: String) -> Self {
        Self {
            version,
            name,
            status: MigrationStatus::Applied,
            applied_at: Some(Utc::now()),
            statement,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == MigrationStatus::Applied
    }

    pub fn mark_pending(&mut self) {
        self.status = MigrationStatus::Pending;
        self.applied_at = None;
    }

    /// Statement text compared modulo surrounding whitespace
    pub fn same_statement(&self, other: &Migration) -> bool {
        self.statement.trim() == other.statement.trim()
    }
}
