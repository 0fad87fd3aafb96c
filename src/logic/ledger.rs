use crate::engine::QueryEngine;
use crate::error::{PlatformError, Result};
use crate::model::{Migration, MigrationStatus};
use crate::store::PlatformStore;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Width of the timestamp part of generated versions (`YYYYMMDDHHMMSSffffff`)
const STAMP_WIDTH: usize = 20;
/// Shortest digit prefix still read as a timestamp (`YYYYMMDDHHMMSS`)
const MIN_STAMP_DIGITS: usize = 14;

/// Per-project log of applied schema changes
pub struct MigrationLedger {
    store: Arc<PlatformStore>,
    engine: Arc<QueryEngine>,
}

impl MigrationLedger {
    pub fn new(store: Arc<PlatformStore>, engine: Arc<QueryEngine>) -> Self {
        Self { store, engine }
    }

    /// Run `statement` against the project and record it under a fresh version.
    /// The entry is recorded even when the statement fails.
    pub async fn apply(&self, project_id: &str, name: &str, statement: &str) -> Result<Migration> {
        if project_id.trim().is_empty() {
            return Err(PlatformError::Validation(
                "project ref must not be empty".to_string(),
            ));
        }
        if name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "migration name must not be empty".to_string(),
            ));
        }
        if statement.trim().is_empty() {
            return Err(PlatformError::Validation(
                "migration statement must not be empty".to_string(),
            ));
        }
        self.store.require_project(project_id)?;

        let _locks = self.store.lock_projects(&[project_id]).await;
        let version = self.next_version(project_id);
        self.apply_versioned_locked(project_id, &version, name, statement)
            .await
    }

    /// Apply under a known version, updating an existing entry in place.
    /// Callers must hold the project lock. An entry with no statement is recorded as failed.
    pub(crate) async fn apply_versioned_locked(
        &self,
        project_id: &str,
        version: &str,
        name: &str,
        statement: &str,
    ) -> Result<Migration> {
        let outcome = if statement.trim().is_empty() {
            Err(format!("migration '{}' is missing its SQL statement", name))
        } else {
            self.engine
                .execute(project_id, statement)
                .await
                .map(|_| ())
                .map_err(|err| err.to_string())
        };

        match outcome {
            Ok(()) => {
                let migration =
                    Migration::applied(version.to_string(), name.to_string(), statement.to_string());
                self.store.upsert_migration(project_id, migration.clone())?;
                info!("[{}] migration {} ({}) applied", project_id, version, name);
                Ok(migration)
            }
            Err(err) => {
                warn!(
                    "[{}] migration {} ({}) failed: {}",
                    project_id, version, name, err
                );
                self.store.upsert_migration(
                    project_id,
                    Migration {
                        version: version.to_string(),
                        name: name.to_string(),
                        status: MigrationStatus::Failed,
                        applied_at: None,
                        statement: statement.to_string(),
                    },
                )?;
                Err(PlatformError::Migration {
                    name: name.to_string(),
                    version: version.to_string(),
                    message: err,
                })
            }
        }
    }

    /// Entries in stored order
    pub fn list(&self, project_id: &str) -> Result<Vec<Migration>> {
        self.store.require_project(project_id)?;
        Ok(self.store.migrations(project_id))
    }

    /// Import an existing entry without running it
    pub fn record(&self, project_id: &str, migration: Migration) -> Result<()> {
        if migration.version.trim().is_empty() {
            return Err(PlatformError::Validation(
                "migration version must not be empty".to_string(),
            ));
        }
        self.store.append_migration(project_id, migration)
    }

    /// A sortable version strictly after the newest timestamp-shaped one in the ledger
    pub fn next_version(&self, project_id: &str) -> String {
        let now: u128 = Utc::now()
            .format("%Y%m%d%H%M%S%6f")
            .to_string()
            .parse()
            .unwrap_or_default();
        let newest = self
            .store
            .migrations(project_id)
            .iter()
            .filter_map(|m| version_stamp(&m.version))
            .max();
        let stamp = match newest {
            Some(newest) if newest >= now => newest + 1,
            _ => now,
        };
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{:0width$}_{}", stamp, &suffix[..8], width = STAMP_WIDTH)
    }
}

/// Timestamp part of a version, widened to microsecond precision
fn version_stamp(version: &str) -> Option<u128> {
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_STAMP_DIGITS || digits.len() > STAMP_WIDTH {
        return None;
    }
    let stamp: u128 = digits.parse().ok()?;
    Some(stamp * 10u128.pow((STAMP_WIDTH - digits.len()) as u32))
}
