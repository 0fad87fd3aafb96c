use crate::error::{PlatformError, Result};
use crate::model::{
    Branch, Catalog, EdgeFunction, Extension, Id, Migration, Project, ProjectStatus,
};
use crate::store::snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
use chrono::Utc;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Everything the platform knows, keyed by project id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub(crate) projects: BTreeMap<Id, Project>,
    /// Branches keyed by parent project id
    #[serde(default)]
    pub(crate) branches: BTreeMap<Id, Vec<Branch>>,
    #[serde(default)]
    pub(crate) migrations: BTreeMap<Id, Vec<Migration>>,
    #[serde(default)]
    pub(crate) catalogs: BTreeMap<Id, Catalog>,
    #[serde(default)]
    pub(crate) extensions: BTreeMap<Id, Vec<Extension>>,
    #[serde(default)]
    pub(crate) edge_functions: BTreeMap<Id, Vec<EdgeFunction>>,
}

impl StoreState {
    /// Check the cross-record invariants a restored document must satisfy
    pub fn validate(&self) -> Result<()> {
        for (id, project) in &self.projects {
            if id != &project.id {
                return Err(PlatformError::Validation(format!(
                    "project keyed as '{}' carries id '{}'",
                    id, project.id
                )));
            }
        }

        let mut branch_ids = HashSet::new();
        for (parent_id, branches) in &self.branches {
            if !self.projects.contains_key(parent_id) {
                return Err(PlatformError::Validation(format!(
                    "branches reference unknown parent project '{}'",
                    parent_id
                )));
            }
            if let Some(name) = branches.iter().map(|b| &b.name).duplicates().next() {
                return Err(PlatformError::Validation(format!(
                    "duplicate branch name '{}' under project '{}'",
                    name, parent_id
                )));
            }
            for branch in branches {
                if &branch.parent_project_id != parent_id {
                    return Err(PlatformError::Validation(format!(
                        "branch '{}' is filed under '{}' but names parent '{}'",
                        branch.id, parent_id, branch.parent_project_id
                    )));
                }
                if !self.projects.contains_key(&branch.branch_project_id) {
                    return Err(PlatformError::Validation(format!(
                        "branch '{}' points at unknown project '{}'",
                        branch.id, branch.branch_project_id
                    )));
                }
                if !branch_ids.insert(branch.id.as_str()) {
                    return Err(PlatformError::Validation(format!(
                        "duplicate branch id '{}'",
                        branch.id
                    )));
                }
            }
        }

        for (project_id, ledger) in &self.migrations {
            if let Some(version) = ledger.iter().map(|m| &m.version).duplicates().next() {
                return Err(PlatformError::Validation(format!(
                    "duplicate migration version '{}' in project '{}'",
                    version, project_id
                )));
            }
        }

        for (project_id, functions) in &self.edge_functions {
            if let Some((slug, version)) = functions
                .iter()
                .map(|f| (&f.slug, &f.version))
                .duplicates()
                .next()
            {
                return Err(PlatformError::Validation(format!(
                    "duplicate function version '{}@{}' in project '{}'",
                    slug, version, project_id
                )));
            }
        }

        Ok(())
    }

    fn require_project(&self, id: &str) -> Result<&Project> {
        self.projects
            .get(id)
            .ok_or_else(|| PlatformError::not_found("project", id))
    }

    fn branch_mut(&mut self, id: &str) -> Option<&mut Branch> {
        self.branches
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut())
            .find(|b| b.id == id)
    }
}

/// Held per-project locks; released on drop
pub struct ProjectLocks {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// In-memory store for projects, branches, ledgers, catalogs, extensions and edge functions.
///
/// Each accessor is atomic on its own. Multi-step operations serialize on the
/// per-project locks from [`PlatformStore::lock_projects`].
#[derive(Default)]
pub struct PlatformStore {
    state: RwLock<StoreState>,
    locks: Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlatformStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the locks of every listed project, in id order
    pub async fn lock_projects(&self, ids: &[&str]) -> ProjectLocks {
        let ordered: Vec<&str> = ids.iter().copied().sorted().dedup().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            let lock = self.locks.lock().entry(id.to_string()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        ProjectLocks { _guards: guards }
    }

    // Projects

    pub fn insert_project(&self, project: Project) -> Result<()> {
        if project.id.trim().is_empty() || project.name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "project id and name must not be empty".to_string(),
            ));
        }
        let mut state = self.state.write();
        if state.projects.contains_key(&project.id) {
            return Err(PlatformError::Validation(format!(
                "project '{}' already exists",
                project.id
            )));
        }
        let id = project.id.clone();
        state.projects.insert(id.clone(), project);
        state.migrations.entry(id.clone()).or_default();
        state.catalogs.entry(id.clone()).or_default();
        state.extensions.entry(id.clone()).or_default();
        state.edge_functions.entry(id).or_default();
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Option<Project> {
        self.state.read().projects.get(id).cloned()
    }

    pub fn require_project(&self, id: &str) -> Result<Project> {
        self.state.read().require_project(id).cloned()
    }

    pub fn list_projects(&self) -> Vec<Project> {
        self.state.read().projects.values().cloned().collect()
    }

    pub fn set_project_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let mut state = self.state.write();
        let project = state
            .projects
            .get_mut(id)
            .ok_or_else(|| PlatformError::not_found("project", id))?;
        project.status = status;
        Ok(())
    }

    // Branches

    pub fn insert_branch(&self, branch: Branch) -> Result<()> {
        if branch.name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "branch name must not be empty".to_string(),
            ));
        }
        let mut state = self.state.write();
        state.require_project(&branch.parent_project_id)?;
        state.require_project(&branch.branch_project_id)?;
        if state.branch_mut(&branch.id).is_some() {
            return Err(PlatformError::Validation(format!(
                "branch '{}' already exists",
                branch.id
            )));
        }
        let bucket = state
            .branches
            .entry(branch.parent_project_id.clone())
            .or_default();
        if bucket.iter().any(|b| b.name == branch.name) {
            return Err(PlatformError::Validation(format!(
                "branch '{}' already exists for project '{}'",
                branch.name, branch.parent_project_id
            )));
        }
        bucket.push(branch);
        Ok(())
    }

    pub fn get_branch(&self, id: &str) -> Option<Branch> {
        self.state
            .read()
            .branches
            .values()
            .flatten()
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn require_branch(&self, id: &str) -> Result<Branch> {
        self.get_branch(id)
            .ok_or_else(|| PlatformError::not_found("branch", id))
    }

    /// The branch whose data lives in `project_id`, if that project is a branch
    pub fn branch_for_project(&self, project_id: &str) -> Option<Branch> {
        self.state
            .read()
            .branches
            .values()
            .flatten()
            .find(|b| b.branch_project_id == project_id)
            .cloned()
    }

    pub fn list_branches(&self, parent_project_id: &str) -> Vec<Branch> {
        self.state
            .read()
            .branches
            .get(parent_project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn branch_name_taken(&self, parent_project_id: &str, name: &str) -> bool {
        self.state
            .read()
            .branches
            .get(parent_project_id)
            .map_or(false, |bucket| bucket.iter().any(|b| b.name == name))
    }

    /// Apply `update` to the branch and return the updated copy
    pub fn update_branch<F>(&self, id: &str, update: F) -> Result<Branch>
    where
        F: FnOnce(&mut Branch),
    {
        let mut state = self.state.write();
        let branch = state
            .branch_mut(id)
            .ok_or_else(|| PlatformError::not_found("branch", id))?;
        update(branch);
        Ok(branch.clone())
    }

    /// Remove a branch record; the parent's bucket goes too once empty
    pub fn remove_branch(&self, id: &str) -> Result<Branch> {
        let mut state = self.state.write();
        let parent_id = state
            .branches
            .iter()
            .find(|(_, bucket)| bucket.iter().any(|b| b.id == id))
            .map(|(parent_id, _)| parent_id.clone())
            .ok_or_else(|| PlatformError::not_found("branch", id))?;

        let bucket = state.branches.entry(parent_id.clone()).or_default();
        let position = bucket
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| PlatformError::not_found("branch", id))?;
        let removed = bucket.remove(position);
        if bucket.is_empty() {
            state.branches.remove(&parent_id);
        }
        Ok(removed)
    }

    // Migration ledgers

    pub fn migrations(&self, project_id: &str) -> Vec<Migration> {
        self.state
            .read()
            .migrations
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn append_migration(&self, project_id: &str, migration: Migration) -> Result<()> {
        self.update_migrations(project_id, |ledger| {
            if ledger.iter().any(|m| m.version == migration.version) {
                return Err(PlatformError::Validation(format!(
                    "migration version '{}' already recorded",
                    migration.version
                )));
            }
            ledger.push(migration);
            Ok(())
        })
    }

    /// Replace the entry with the same version in place, or append
    pub fn upsert_migration(&self, project_id: &str, migration: Migration) -> Result<()> {
        self.update_migrations(project_id, |ledger| {
            match ledger.iter_mut().find(|m| m.version == migration.version) {
                Some(existing) => *existing = migration,
                None => ledger.push(migration),
            }
            Ok(())
        })
    }

    pub fn update_migrations<F, T>(&self, project_id: &str, update: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Migration>) -> Result<T>,
    {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        update(state.migrations.entry(project_id.to_string()).or_default())
    }

    // Catalogs and extensions

    pub fn catalog(&self, project_id: &str) -> Catalog {
        self.state
            .read()
            .catalogs
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn replace_catalog(&self, project_id: &str, catalog: Catalog) -> Result<()> {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        state.catalogs.insert(project_id.to_string(), catalog);
        Ok(())
    }

    pub fn extensions(&self, project_id: &str) -> Vec<Extension> {
        self.state
            .read()
            .extensions
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Register an extension; `false` if one with that name was already present
    pub fn add_extension(&self, project_id: &str, extension: Extension) -> Result<bool> {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        let installed = state.extensions.entry(project_id.to_string()).or_default();
        if installed.iter().any(|e| e.name == extension.name) {
            return Ok(false);
        }
        installed.push(extension);
        Ok(true)
    }

    pub fn remove_extension(&self, project_id: &str, name: &str) -> Result<bool> {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        let installed = state.extensions.entry(project_id.to_string()).or_default();
        let before = installed.len();
        installed.retain(|e| e.name != name);
        Ok(installed.len() != before)
    }

    /// Forget the catalog and extensions of a project whose database was discarded
    pub fn clear_schema_metadata(&self, project_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        state.catalogs.insert(project_id.to_string(), Catalog::default());
        state.extensions.insert(project_id.to_string(), Vec::new());
        Ok(())
    }

    // Edge functions

    pub fn functions(&self, project_id: &str) -> Vec<EdgeFunction> {
        self.state
            .read()
            .edge_functions
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_function(&self, project_id: &str, function: EdgeFunction) -> Result<()> {
        let mut state = self.state.write();
        state.require_project(project_id)?;
        let functions = state.edge_functions.entry(project_id.to_string()).or_default();
        if functions
            .iter()
            .any(|f| f.slug == function.slug && f.version == function.version)
        {
            return Err(PlatformError::Validation(format!(
                "function '{}' already has version '{}'",
                function.slug, function.version
            )));
        }
        functions.push(function);
        Ok(())
    }

    pub fn replace_functions(&self, project_id: &str, functions: Vec<EdgeFunction>) -> Result<()> {
        if let Some((slug, version)) = functions
            .iter()
            .map(|f| (&f.slug, &f.version))
            .duplicates()
            .next()
        {
            return Err(PlatformError::Validation(format!(
                "function '{}' lists version '{}' twice",
                slug, version
            )));
        }
        let mut state = self.state.write();
        state.require_project(project_id)?;
        state.edge_functions.insert(project_id.to_string(), functions);
        Ok(())
    }

    /// Copy the parent's catalog, extensions and functions into `child_id`, and
    /// its ledger with every entry marked applied
    pub fn fork_project(&self, parent_id: &str, child_id: &str) -> Result<usize> {
        let mut state = self.state.write();
        state.require_project(parent_id)?;
        state.require_project(child_id)?;

        let catalog = state.catalogs.get(parent_id).cloned().unwrap_or_default();
        let extensions = state.extensions.get(parent_id).cloned().unwrap_or_default();
        let functions = state.edge_functions.get(parent_id).cloned().unwrap_or_default();
        let forked_at = Utc::now();
        let ledger: Vec<Migration> = state
            .migrations
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut m| {
                m.status = crate::model::MigrationStatus::Applied;
                m.applied_at = Some(forked_at);
                m
            })
            .collect();
        let copied = ledger.len();

        state.catalogs.insert(child_id.to_string(), catalog);
        state.extensions.insert(child_id.to_string(), extensions);
        state.edge_functions.insert(child_id.to_string(), functions);
        state.migrations.insert(child_id.to_string(), ledger);
        Ok(copied)
    }

    // Snapshots

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            taken_at: Utc::now(),
            state: self.state.read().clone(),
        }
    }

    /// Replace the whole state with a validated snapshot
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        let _locks = self.lock_for_restore(&snapshot).await;
        self.restore_locked(snapshot)
    }

    /// Locks of every project known now or named in `snapshot`
    pub async fn lock_for_restore(&self, snapshot: &Snapshot) -> ProjectLocks {
        let ids: Vec<Id> = self
            .state
            .read()
            .projects
            .keys()
            .chain(snapshot.state.projects.keys())
            .cloned()
            .collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.lock_projects(&ids).await
    }

    /// Callers must hold the locks from [`PlatformStore::lock_for_restore`]
    pub(crate) fn restore_locked(&self, snapshot: Snapshot) -> Result<()> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(PlatformError::Validation(format!(
                "snapshot format {} is newer than supported format {}",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        snapshot.state.validate()?;
        *self.state.write() = snapshot.state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BranchStatus, CreateBranchOptions, FunctionStatus, MigrationStatus};

    fn project(id: &str) -> Project {
        Project::new_with_id(
            id.to_string(),
            format!("{}-name", id),
            "org_1".to_string(),
            "us-west-1".to_string(),
            "15.1".to_string(),
        )
    }

    fn branch(id: &str, name: &str, parent: &str, child: &str) -> Branch {
        Branch::new(
            id.to_string(),
            name.to_string(),
            parent.to_string(),
            child.to_string(),
            &CreateBranchOptions::default(),
        )
    }

    fn store_with_branch() -> PlatformStore {
        let store = PlatformStore::new();
        store.insert_project(project("proj_a")).unwrap();
        store.insert_project(project("proj_b")).unwrap();
        store
            .insert_branch(branch("branch_1", "dev", "proj_a", "proj_b"))
            .unwrap();
        store
    }

    #[test]
    fn test_insert_branch_validates_references() {
        let store = PlatformStore::new();
        store.insert_project(project("proj_a")).unwrap();

        let err = store
            .insert_branch(branch("branch_1", "dev", "proj_a", "proj_missing"))
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
        assert!(store.list_branches("proj_a").is_empty());
    }

    #[test]
    fn test_branch_names_unique_per_parent() {
        let store = store_with_branch();
        store.insert_project(project("proj_c")).unwrap();

        let err = store
            .insert_branch(branch("branch_2", "dev", "proj_a", "proj_c"))
            .unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        assert!(store.branch_name_taken("proj_a", "dev"));
        assert!(!store.branch_name_taken("proj_c", "dev"));
    }

    #[test]
    fn test_remove_branch_drops_empty_bucket() {
        let store = store_with_branch();
        let removed = store.remove_branch("branch_1").unwrap();
        assert_eq!(removed.name, "dev");
        assert!(!store.state.read().branches.contains_key("proj_a"));
        assert!(matches!(
            store.remove_branch("branch_1"),
            Err(PlatformError::NotFound(_))
        ));
        // The branch's project outlives the branch record
        assert!(store.get_project("proj_b").is_some());
    }

    #[test]
    fn test_update_branch_and_lookup_by_project() {
        let store = store_with_branch();
        let updated = store
            .update_branch("branch_1", |b| b.status = BranchStatus::Merging)
            .unwrap();
        assert_eq!(updated.status, BranchStatus::Merging);
        assert_eq!(
            store.branch_for_project("proj_b").map(|b| b.id),
            Some("branch_1".to_string())
        );
        assert!(store.branch_for_project("proj_a").is_none());
    }

    #[test]
    fn test_ledger_versions_are_unique() {
        let store = store_with_branch();
        let first = Migration::applied("v1".into(), "init".into(), "CREATE TABLE a (id int)".into());
        store.append_migration("proj_a", first.clone()).unwrap();
        assert!(store.append_migration("proj_a", first.clone()).is_err());

        let mut failed = first;
        failed.status = MigrationStatus::Failed;
        store.upsert_migration("proj_a", failed).unwrap();
        let ledger = store.migrations("proj_a");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, MigrationStatus::Failed);
    }

    #[test]
    fn test_fork_copies_metadata_as_applied() {
        let store = store_with_branch();
        let mut pending = Migration::applied("v1".into(), "init".into(), "SELECT 1".into());
        pending.mark_pending();
        store.append_migration("proj_a", pending).unwrap();
        store
            .add_extension(
                "proj_a",
                Extension {
                    name: "pgcrypto".into(),
                    schema: "extensions".into(),
                    version: "1.3".into(),
                    description: String::new(),
                },
            )
            .unwrap();
        let now = Utc::now();
        store
            .push_function(
                "proj_a",
                EdgeFunction {
                    id: "fn_1".into(),
                    slug: "hello".into(),
                    name: "hello".into(),
                    version: "ver_1".into(),
                    status: FunctionStatus::Active,
                    created_at: now,
                    updated_at: now,
                    entrypoint_path: "index.ts".into(),
                    import_map_path: None,
                    files: vec![],
                },
            )
            .unwrap();

        assert_eq!(store.fork_project("proj_a", "proj_b").unwrap(), 1);
        assert!(store.migrations("proj_b")[0].is_applied());
        assert!(!store.migrations("proj_a")[0].is_applied());
        assert_eq!(store.extensions("proj_b").len(), 1);
        assert_eq!(store.functions("proj_b").len(), 1);

        // Later parent changes are not visible to the fork
        store.remove_extension("proj_a", "pgcrypto").unwrap();
        assert_eq!(store.extensions("proj_b").len(), 1);
    }

    #[test]
    fn test_duplicate_extension_is_ignored() {
        let store = store_with_branch();
        let ext = Extension {
            name: "vector".into(),
            schema: "public".into(),
            version: "0.5.1".into(),
            description: String::new(),
        };
        assert!(store.add_extension("proj_a", ext.clone()).unwrap());
        assert!(!store.add_extension("proj_a", ext).unwrap());
        assert_eq!(store.extensions("proj_a").len(), 1);
    }

    #[tokio::test]
    async fn test_restore_rejects_dangling_branch() {
        let store = store_with_branch();
        let mut snapshot = store.snapshot();
        snapshot.state.projects.remove("proj_b");
        let err = store.restore(snapshot).await.unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        // Rejected restore leaves the state untouched
        assert!(store.get_project("proj_b").is_some());
    }

    #[tokio::test]
    async fn test_restore_waits_for_project_locks() {
        let store = Arc::new(store_with_branch());
        let mut snapshot = store.snapshot();
        snapshot.state.projects.insert("proj_c".to_string(), project("proj_c"));

        // proj_c only exists in the incoming state
        let held = store.lock_projects(&["proj_c"]).await;
        let restore = {
            let store = store.clone();
            tokio::spawn(async move { store.restore(snapshot).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!restore.is_finished());
        assert!(store.get_project("proj_c").is_none());

        drop(held);
        restore.await.unwrap().unwrap();
        assert!(store.get_project("proj_c").is_some());
    }

    #[tokio::test]
    async fn test_lock_projects_serializes_overlapping_sets() {
        let store = Arc::new(store_with_branch());
        let held = store.lock_projects(&["proj_b", "proj_a", "proj_a"]).await;

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _locks = store.lock_projects(&["proj_a"]).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap();
    }
}
