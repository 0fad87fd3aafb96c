use crate::config::AppConfig;
use crate::engine::QueryEngine;
use crate::error::{PlatformError, Result};
use crate::logic::{BranchManager, DatabaseService, EdgeFunctionRegistry, MigrationLedger};
use crate::model::Project;
use crate::store::{BranchingPolicy, PlanBranchingPolicy, PlatformStore, Snapshot, UuidIdGenerator};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Wires the store, the query engine and the services built on them
pub struct Platform {
    config: AppConfig,
    store: Arc<PlatformStore>,
    engine: Arc<QueryEngine>,
    ledger: Arc<MigrationLedger>,
    branches: BranchManager,
    database: DatabaseService,
    functions: EdgeFunctionRegistry,
}

impl Platform {
    pub fn new(config: AppConfig) -> Self {
        let policy = Arc::new(PlanBranchingPolicy::from_config(&config.platform));
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: AppConfig, policy: Arc<dyn BranchingPolicy>) -> Self {
        let store = Arc::new(PlatformStore::new());
        let engine = Arc::new(QueryEngine::new(store.clone(), config.engine.clone()));
        let ledger = Arc::new(MigrationLedger::new(store.clone(), engine.clone()));
        let ids = Arc::new(UuidIdGenerator);
        let branches = BranchManager::new(
            store.clone(),
            engine.clone(),
            ledger.clone(),
            policy,
            ids.clone(),
        );
        let database = DatabaseService::new(store.clone(), engine.clone());
        let functions = EdgeFunctionRegistry::new(store.clone(), ids);

        Self {
            config,
            store,
            engine,
            ledger,
            branches,
            database,
            functions,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PlatformStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn database(&self) -> &DatabaseService {
        &self.database
    }

    pub fn functions(&self) -> &EdgeFunctionRegistry {
        &self.functions
    }

    /// Register a new project with the configured region and Postgres version
    pub fn register_project(&self, name: &str, organization_id: &str) -> Result<Project> {
        if organization_id.trim().is_empty() {
            return Err(PlatformError::Validation(
                "organization id must not be empty".to_string(),
            ));
        }
        let project = Project::new(
            name.to_string(),
            organization_id.to_string(),
            self.config.platform.default_region.clone(),
            self.config.platform.default_postgres_version.clone(),
        );
        self.store.insert_project(project.clone())?;
        info!("Registered project {} ({})", project.id, project.name);
        Ok(project)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Replace all state; databases are rebuilt from the restored catalogs on next use
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        let _locks = self.store.lock_for_restore(&snapshot).await;
        self.store.restore_locked(snapshot)?;
        self.engine.release_all();
        info!("Restored platform state");
        Ok(())
    }

    /// Write a snapshot to `path`, or to the configured snapshot path
    pub async fn save_snapshot(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = self.snapshot_path(path)?;
        let snapshot = self.snapshot();
        let blob = snapshot.to_blob(self.config.snapshot.compress)?;
        tokio::fs::write(&path, &blob).await?;
        info!(
            "Saved snapshot to {} ({} bytes, sha256 {})",
            path.display(),
            blob.len(),
            snapshot.checksum()?
        );
        Ok(path)
    }

    pub async fn load_snapshot(&self, path: Option<&Path>) -> Result<()> {
        let path = self.snapshot_path(path)?;
        let blob = tokio::fs::read(&path).await?;
        self.restore(Snapshot::from_blob(&blob)?).await
    }

    fn snapshot_path(&self, path: Option<&Path>) -> Result<PathBuf> {
        path.map(Path::to_path_buf)
            .or_else(|| self.config.snapshot.path.as_ref().map(PathBuf::from))
            .ok_or_else(|| {
                PlatformError::Validation("no snapshot path given or configured".to_string())
            })
    }
}
