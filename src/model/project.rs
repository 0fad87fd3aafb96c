use crate::model::{generate_id, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    ActiveHealthy,
    ActiveUnhealthy,
    ComingUp,
    GoingDown,
    Inactive,
    InitFailed,
    Pausing,
    Removed,
    Restoring,
    Unknown,
}

/// A tenant database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    pub organization_id: Id,
    pub region: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub postgres_version: String,
}

impl Project {
    pub fn new(name: String, organization_id: Id, region: String, postgres_version: String) -> Self {
        Self::new_with_id(generate_id("proj_"), name, organization_id, region, postgres_version)
    }

    pub fn new_with_id(
        id: Id,
        name: String,
        organization_id: Id,
        region: String,
        postgres_version: String,
    ) -> Self {
        Self {
            id,
            name,
            organization_id,
            region,
            status: ProjectStatus::ActiveHealthy,
            created_at: Utc::now(),
            postgres_version,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ProjectStatus::ActiveHealthy
    }
}
