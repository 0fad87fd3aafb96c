use crate::engine::QueryEngine;
use crate::error::{PlatformError, Result};
use crate::model::{Extension, ProjectStatus, QueryResult, TableDef};
use crate::store::PlatformStore;
use log::info;
use std::sync::Arc;

/// Direct SQL access to a project's database and its metadata
pub struct DatabaseService {
    store: Arc<PlatformStore>,
    engine: Arc<QueryEngine>,
}

impl DatabaseService {
    pub fn new(store: Arc<PlatformStore>, engine: Arc<QueryEngine>) -> Self {
        Self { store, engine }
    }

    /// Run ad-hoc SQL. Schema changes made this way on a branch project mark the
    /// branch as carrying uncommitted changes.
    pub async fn execute_sql(&self, project_id: &str, query: &str) -> Result<QueryResult> {
        if project_id.trim().is_empty() {
            return Err(PlatformError::Validation(
                "project ref must not be empty".to_string(),
            ));
        }
        if query.trim().is_empty() {
            return Err(PlatformError::Validation(
                "query must not be empty".to_string(),
            ));
        }
        let project = self.store.require_project(project_id)?;
        if project.status != ProjectStatus::ActiveHealthy {
            return Err(PlatformError::DatabaseConnection(format!(
                "project '{}' is not accepting connections (status {:?})",
                project_id, project.status
            )));
        }

        let _locks = self.store.lock_projects(&[project_id]).await;
        let execution = self.engine.execute_tracked(project_id, query).await;

        // statements before a failing one stay applied
        if execution.schema_changed {
            if let Some(branch) = self.store.branch_for_project(project_id) {
                self.store.update_branch(&branch.id, |b| {
                    b.has_uncommitted_schema_changes = true;
                    b.touch();
                })?;
                info!(
                    "[{}] branch {} now has uncommitted schema changes",
                    project_id, branch.id
                );
            }
        }
        execution.result
    }

    /// Tables of the project's catalog, optionally limited to some schemas
    pub fn list_tables(&self, project_id: &str, schemas: Option<&[String]>) -> Result<Vec<TableDef>> {
        self.store.require_project(project_id)?;
        Ok(self.store.catalog(project_id).tables_in(schemas))
    }

    pub fn list_extensions(&self, project_id: &str) -> Result<Vec<Extension>> {
        self.store.require_project(project_id)?;
        Ok(self.store.extensions(project_id))
    }
}
