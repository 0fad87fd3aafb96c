use crate::engine::QueryEngine;
use crate::error::{PlatformError, Result};
use crate::logic::ledger::MigrationLedger;
use crate::model::{
    latest_version, Branch, BranchStatus, CreateBranchOptions, DeleteOutcome, EdgeFunction,
    FunctionStatus, MergeOutcome, Migration, MigrationStatus, OperationStatus, Project, ProjectStatus,
    RebaseOutcome, ResetOutcome,
};
use crate::store::{BranchingPolicy, IdGenerator, PlatformStore};
use chrono::Utc;
use itertools::Itertools;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// What a merge has folded into the parent so far
#[derive(Debug, Default)]
struct MergeProgress {
    functions: Vec<String>,
    versions: Vec<String>,
}

/// Create, reset, rebase, merge and delete development branches
pub struct BranchManager {
    store: Arc<PlatformStore>,
    engine: Arc<QueryEngine>,
    ledger: Arc<MigrationLedger>,
    policy: Arc<dyn BranchingPolicy>,
    ids: Arc<dyn IdGenerator>,
}

impl BranchManager {
    pub fn new(
        store: Arc<PlatformStore>,
        engine: Arc<QueryEngine>,
        ledger: Arc<MigrationLedger>,
        policy: Arc<dyn BranchingPolicy>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            engine,
            ledger,
            policy,
            ids,
        }
    }

    /// Fork `parent_project_id` into a new branch project
    pub async fn create(
        &self,
        parent_project_id: &str,
        name: &str,
        options: CreateBranchOptions,
    ) -> Result<Branch> {
        if parent_project_id.trim().is_empty() {
            return Err(PlatformError::Validation(
                "project ref must not be empty".to_string(),
            ));
        }
        if name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "branch name must not be empty".to_string(),
            ));
        }
        let parent = self.store.require_project(parent_project_id)?;
        self.ensure_branching_enabled(&parent).await?;

        let _locks = self.store.lock_projects(&[parent_project_id]).await;
        if self.store.branch_name_taken(parent_project_id, name) {
            return Err(PlatformError::Validation(format!(
                "branch '{}' already exists for project '{}'",
                name, parent_project_id
            )));
        }

        let child_id = self.ids.new_id("proj_");
        let branch_id = self.ids.new_id("branch_");
        let region = options.region.clone().unwrap_or_else(|| parent.region.clone());
        let mut child = Project::new_with_id(
            child_id.clone(),
            format!("{}-{}", parent.name, name),
            parent.organization_id.clone(),
            region,
            parent.postgres_version.clone(),
        );
        child.status = ProjectStatus::ComingUp;
        self.store.insert_project(child)?;
        self.store.insert_branch(Branch::new(
            branch_id.clone(),
            name.to_string(),
            parent_project_id.to_string(),
            child_id.clone(),
            &options,
        ))?;
        info!(
            "Creating branch '{}' ({}) of project {}",
            name, branch_id, parent_project_id
        );

        let copied = self.store.fork_project(parent_project_id, &child_id)?;
        self.set_status(&branch_id, BranchStatus::RunningMigrations)?;
        if let Err(err) = self.engine.materialize(&child_id).await {
            warn!("Branch {} failed to materialize: {}", branch_id, err);
            self.set_status(&branch_id, BranchStatus::MigrationsFailed)?;
            self.store
                .set_project_status(&child_id, ProjectStatus::InitFailed)?;
            return Err(err);
        }
        self.store
            .set_project_status(&child_id, ProjectStatus::ActiveHealthy)?;
        let branch = self.set_status(&branch_id, BranchStatus::ActiveHealthy)?;
        info!(
            "Branch {} ready as project {} with {} migration(s)",
            branch_id, child_id, copied
        );
        Ok(branch)
    }

    /// Discard the branch database and replay its ledger up to `to_version`
    pub async fn reset(&self, branch_id: &str, to_version: Option<&str>) -> Result<ResetOutcome> {
        let branch = self.store.require_branch(branch_id)?;
        let _locks = self
            .store
            .lock_projects(&[branch.branch_project_id.as_str()])
            .await;
        let branch = self.store.require_branch(branch_id)?;
        let project_id = branch.branch_project_id.clone();

        let ledger = self.store.migrations(&project_id);
        if let Some(target) = to_version {
            if !ledger.iter().any(|m| m.version == target) {
                return Err(PlatformError::NotFound(format!(
                    "migration version '{}' not found for branch '{}'",
                    target, branch_id
                )));
            }
        }
        if let Some(duplicate) = ledger.iter().map(|m| &m.version).duplicates().next() {
            return Err(PlatformError::Api(format!(
                "ledger of project '{}' lists version '{}' more than once",
                project_id, duplicate
            )));
        }

        let previous = branch.status;
        self.set_status(branch_id, BranchStatus::Resetting)?;
        info!("Resetting branch {} to {:?}", branch_id, to_version);

        if let Err(err) = self.engine.reset(&project_id).await {
            self.set_status(branch_id, previous)?;
            return Err(PlatformError::Api(format!(
                "failed to reset database of branch '{}': {}",
                branch_id, err
            )));
        }
        self.store.update_migrations(&project_id, |entries| {
            entries.iter_mut().for_each(Migration::mark_pending);
            Ok(())
        })?;

        if let Some(target) = to_version {
            let ordered: Vec<Migration> = ledger
                .into_iter()
                .sorted_by(|a, b| a.version.cmp(&b.version))
                .collect();
            let through = ordered
                .iter()
                .position(|m| m.version == target)
                .map_or(0, |i| i + 1);
            for migration in &ordered[..through] {
                if let Err(err) = self
                    .ledger
                    .apply_versioned_locked(
                        &project_id,
                        &migration.version,
                        &migration.name,
                        &migration.statement,
                    )
                    .await
                {
                    warn!("Reset of branch {} stopped: {}", branch_id, err);
                    self.set_status(branch_id, BranchStatus::ResetFailed)?;
                    return Err(err);
                }
            }
        }

        self.store.update_branch(branch_id, |b| {
            b.status = BranchStatus::ActiveHealthy;
            b.has_uncommitted_schema_changes = false;
            b.touch();
        })?;
        Ok(ResetOutcome {
            branch_id: branch_id.to_string(),
            status: OperationStatus::Completed,
            target_migration_version: to_version.map(str::to_string),
        })
    }

    /// Apply the parent's migrations the branch has not applied yet
    pub async fn rebase(&self, branch_id: &str) -> Result<RebaseOutcome> {
        let branch = self.store.require_branch(branch_id)?;
        let _locks = self
            .store
            .lock_projects(&[
                branch.parent_project_id.as_str(),
                branch.branch_project_id.as_str(),
            ])
            .await;
        let branch = self.store.require_branch(branch_id)?;
        if branch.has_uncommitted_schema_changes {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' has uncommitted schema changes",
                branch_id
            )));
        }
        if branch.status != BranchStatus::ActiveHealthy {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' cannot be rebased while {:?}",
                branch_id, branch.status
            )));
        }

        let applied: HashSet<String> = self
            .store
            .migrations(&branch.branch_project_id)
            .into_iter()
            .filter(Migration::is_applied)
            .map(|m| m.version)
            .collect();
        let missing: Vec<Migration> = self
            .store
            .migrations(&branch.parent_project_id)
            .into_iter()
            .filter(|m| m.is_applied() && !applied.contains(&m.version))
            .filter(|m| !m.statement.trim().is_empty())
            .sorted_by(|a, b| a.version.cmp(&b.version))
            .collect();
        if missing.is_empty() {
            info!("Branch {} is up to date with its parent", branch_id);
            return Ok(RebaseOutcome {
                branch_id: branch_id.to_string(),
                status: OperationStatus::Completed,
                rebase_operation_id: None,
                applied_versions: Vec::new(),
            });
        }

        let operation_id = self.ids.new_id("rb_op_");
        self.set_status(branch_id, BranchStatus::Rebasing)?;
        info!(
            "Rebasing branch {} onto {} migration(s) ({})",
            branch_id,
            missing.len(),
            operation_id
        );

        let mut applied_versions = Vec::with_capacity(missing.len());
        for migration in missing {
            if let Err(err) = self
                .ledger
                .apply_versioned_locked(
                    &branch.branch_project_id,
                    &migration.version,
                    &migration.name,
                    &migration.statement,
                )
                .await
            {
                warn!(
                    "Rebase of branch {} conflicts at {}: {}",
                    branch_id, migration.version, err
                );
                self.set_status(branch_id, BranchStatus::ActiveHealthy)?;
                return Err(PlatformError::RebaseConflict {
                    migration: migration.version,
                    message: err.to_string(),
                });
            }
            applied_versions.push(migration.version);
        }

        self.set_status(branch_id, BranchStatus::ActiveHealthy)?;
        Ok(RebaseOutcome {
            branch_id: branch_id.to_string(),
            status: OperationStatus::Completed,
            rebase_operation_id: Some(operation_id),
            applied_versions,
        })
    }

    /// Fold the branch's edge functions and migrations into its parent
    pub async fn merge(&self, branch_id: &str) -> Result<MergeOutcome> {
        let branch = self.store.require_branch(branch_id)?;
        let _locks = self
            .store
            .lock_projects(&[
                branch.parent_project_id.as_str(),
                branch.branch_project_id.as_str(),
            ])
            .await;
        let branch = self.store.require_branch(branch_id)?;
        if branch.status != BranchStatus::ActiveHealthy {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' cannot be merged while {:?}",
                branch_id, branch.status
            )));
        }
        if branch.has_uncommitted_schema_changes {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' has uncommitted schema changes",
                branch_id
            )));
        }

        let merge_request_id = self.ids.new_id("mr_");
        self.set_status(branch_id, BranchStatus::Merging)?;
        info!(
            "Merging branch {} into project {} ({})",
            branch_id, branch.parent_project_id, merge_request_id
        );

        let mut progress = MergeProgress::default();
        let folded = match self.merge_functions(&branch, &mut progress) {
            Ok(()) => self.merge_migrations(&branch, &mut progress).await,
            Err(err) => Err(err),
        };

        let outcome = |status| MergeOutcome {
            branch_id: branch_id.to_string(),
            target_project_id: branch.parent_project_id.clone(),
            status,
            merge_request_id: merge_request_id.clone(),
            merged_functions: progress.functions.clone(),
            merged_versions: progress.versions.clone(),
        };
        match folded {
            Ok(()) => {
                self.set_status(branch_id, BranchStatus::Completed)?;
                info!(
                    "Merged branch {}: {} function(s), {} migration(s)",
                    branch_id,
                    progress.functions.len(),
                    progress.versions.len()
                );
                Ok(outcome(OperationStatus::Completed))
            }
            Err(err) if err.is_conflict() => {
                warn!("Merge of branch {} rejected: {}", branch_id, err);
                self.set_status(branch_id, BranchStatus::ActiveHealthy)?;
                Err(err)
            }
            Err(err) => {
                warn!("Merge of branch {} failed: {}", branch_id, err);
                self.set_status(branch_id, BranchStatus::Error)?;
                Ok(outcome(OperationStatus::Failed))
            }
        }
    }

    fn merge_functions(&self, branch: &Branch, progress: &mut MergeProgress) -> Result<()> {
        let candidates = self.store.functions(&branch.branch_project_id);
        let mut target = self.store.functions(&branch.parent_project_id);
        let now = Utc::now();
        let mut merged = Vec::new();

        let slugs: Vec<&str> = candidates
            .iter()
            .map(|f| f.slug.as_str())
            .filter(|slug| !slug.is_empty())
            .unique()
            .collect();
        for slug in slugs {
            let Some(candidate) = latest_version(&candidates, slug) else {
                continue;
            };
            let promoted = EdgeFunction {
                status: FunctionStatus::Active,
                updated_at: now,
                ..candidate.clone()
            };
            match target.iter().rposition(|f| f.slug == slug) {
                None => target.push(promoted),
                Some(index) if target[index].version == candidate.version => {
                    if target[index].files != candidate.files {
                        return Err(PlatformError::MergeConflict {
                            resource: slug.to_string(),
                            message: format!(
                                "version '{}' differs between branch and parent",
                                candidate.version
                            ),
                        });
                    }
                    continue;
                }
                Some(_)
                    if target
                        .iter()
                        .any(|f| f.slug == slug && f.version == candidate.version) =>
                {
                    // branch still carries an older parent version
                    continue;
                }
                Some(index) => target[index] = promoted,
            }
            merged.push(slug.to_string());
        }

        if !merged.is_empty() {
            self.store
                .replace_functions(&branch.parent_project_id, target)?;
        }
        progress.functions = merged;
        Ok(())
    }

    async fn merge_migrations(&self, branch: &Branch, progress: &mut MergeProgress) -> Result<()> {
        let parent_id = &branch.parent_project_id;
        let existing = self.store.migrations(parent_id);
        let candidates: Vec<Migration> = self
            .store
            .migrations(&branch.branch_project_id)
            .into_iter()
            .filter(Migration::is_applied)
            .sorted_by(|a, b| a.version.cmp(&b.version))
            .collect();

        for migration in candidates {
            if let Some(current) = existing.iter().find(|m| m.version == migration.version) {
                if current.status == MigrationStatus::Failed {
                    return Err(PlatformError::MergeConflict {
                        resource: migration.version,
                        message: "migration failed on the parent project".to_string(),
                    });
                }
                if !current.same_statement(&migration) {
                    return Err(PlatformError::MergeConflict {
                        resource: migration.version,
                        message: "statement differs from the parent's migration".to_string(),
                    });
                }
                continue;
            }

            if !migration.statement.trim().is_empty() {
                match self.engine.execute(parent_id, &migration.statement).await {
                    Ok(_) => {}
                    Err(err @ PlatformError::Sql { .. }) => {
                        return Err(PlatformError::MergeConflict {
                            resource: migration.version,
                            message: err.to_string(),
                        })
                    }
                    Err(err) => return Err(err),
                }
            }
            self.store.append_migration(
                parent_id,
                Migration::applied(
                    migration.version.clone(),
                    migration.name.clone(),
                    migration.statement.clone(),
                ),
            )?;
            progress.versions.push(migration.version);
        }
        Ok(())
    }

    /// Remove a branch record; its project stays registered
    pub async fn delete(&self, branch_id: &str) -> Result<DeleteOutcome> {
        let branch = self.store.require_branch(branch_id)?;
        let _locks = self
            .store
            .lock_projects(&[
                branch.parent_project_id.as_str(),
                branch.branch_project_id.as_str(),
            ])
            .await;
        let branch = self.store.require_branch(branch_id)?;
        if branch.is_default {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' is the default branch",
                branch_id
            )));
        }
        if !branch.status.allows_delete() {
            return Err(PlatformError::OperationNotPermitted(format!(
                "branch '{}' cannot be deleted while {:?}",
                branch_id, branch.status
            )));
        }

        self.store.remove_branch(branch_id)?;
        info!("Deleted branch {} of project {}", branch_id, branch.parent_project_id);
        Ok(DeleteOutcome {
            branch_id: branch_id.to_string(),
            status: OperationStatus::Deleted,
            message: format!("branch '{}' deleted", branch.name),
        })
    }

    pub async fn list_branches(&self, project_id: &str) -> Result<Vec<Branch>> {
        if project_id.trim().is_empty() {
            return Err(PlatformError::Validation(
                "project ref must not be empty".to_string(),
            ));
        }
        let project = self.store.require_project(project_id)?;
        self.ensure_branching_enabled(&project).await?;
        Ok(self.store.list_branches(project_id))
    }

    pub fn get_branch(&self, branch_id: &str) -> Result<Branch> {
        self.store.require_branch(branch_id)
    }

    async fn ensure_branching_enabled(&self, project: &Project) -> Result<()> {
        if !self.policy.is_branching_enabled(project).await? {
            return Err(PlatformError::BranchingNotEnabled(format!(
                "organization '{}' is not on a plan that includes branching",
                project.organization_id
            )));
        }
        Ok(())
    }

    fn set_status(&self, branch_id: &str, status: BranchStatus) -> Result<Branch> {
        self.store.update_branch(branch_id, |b| {
            b.status = status;
            b.touch();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::{PlanBranchingPolicy, UuidIdGenerator};

    struct Fixture {
        store: Arc<PlatformStore>,
        ledger: Arc<MigrationLedger>,
        policy: Arc<PlanBranchingPolicy>,
        manager: BranchManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PlatformStore::new());
        store
            .insert_project(Project::new_with_id(
                "proj_parent".to_string(),
                "shop".to_string(),
                "org_1".to_string(),
                "eu-west-1".to_string(),
                "15.1".to_string(),
            ))
            .unwrap();
        let engine = Arc::new(QueryEngine::new(store.clone(), EngineConfig::default()));
        let ledger = Arc::new(MigrationLedger::new(store.clone(), engine.clone()));
        let policy = Arc::new(PlanBranchingPolicy::new(vec!["pro".to_string()]));
        policy.set_plan("org_1", "pro");
        let manager = BranchManager::new(
            store.clone(),
            engine,
            ledger.clone(),
            policy.clone(),
            Arc::new(UuidIdGenerator),
        );
        Fixture {
            store,
            ledger,
            policy,
            manager,
        }
    }

    #[tokio::test]
    async fn test_create_forks_parent() {
        let f = fixture();
        f.ledger
            .apply("proj_parent", "init", "CREATE TABLE a (id int)")
            .await
            .unwrap();

        let branch = f
            .manager
            .create("proj_parent", "dev", CreateBranchOptions::default())
            .await
            .unwrap();
        assert_eq!(branch.status, BranchStatus::ActiveHealthy);
        assert!(branch.id.starts_with("branch_"));
        assert!(branch.branch_project_id.starts_with("proj_"));

        let child = f.store.require_project(&branch.branch_project_id).unwrap();
        assert_eq!(child.name, "shop-dev");
        assert_eq!(child.region, "eu-west-1");
        assert_eq!(child.status, ProjectStatus::ActiveHealthy);
        let ledger = f.store.migrations(&branch.branch_project_id);
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].is_applied());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_input() {
        let f = fixture();
        f.manager
            .create("proj_parent", "dev", CreateBranchOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            f.manager
                .create("proj_parent", "dev", CreateBranchOptions::default())
                .await,
            Err(PlatformError::Validation(_))
        ));
        assert!(matches!(
            f.manager
                .create("proj_parent", "", CreateBranchOptions::default())
                .await,
            Err(PlatformError::Validation(_))
        ));
        assert!(matches!(
            f.manager
                .create("proj_missing", "dev", CreateBranchOptions::default())
                .await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_branching_not_enabled() {
        let f = fixture();
        f.policy.set_plan("org_1", "free");
        assert!(matches!(
            f.manager
                .create("proj_parent", "dev", CreateBranchOptions::default())
                .await,
            Err(PlatformError::BranchingNotEnabled(_))
        ));
        assert!(matches!(
            f.manager.list_branches("proj_parent").await,
            Err(PlatformError::BranchingNotEnabled(_))
        ));
    }

    #[tokio::test]
    async fn test_rebase_requires_clean_branch() {
        let f = fixture();
        let branch = f
            .manager
            .create("proj_parent", "dev", CreateBranchOptions::default())
            .await
            .unwrap();
        f.store
            .update_branch(&branch.id, |b| b.has_uncommitted_schema_changes = true)
            .unwrap();
        assert!(matches!(
            f.manager.rebase(&branch.id).await,
            Err(PlatformError::OperationNotPermitted(_))
        ));
        assert!(matches!(
            f.manager.merge(&branch.id).await,
            Err(PlatformError::OperationNotPermitted(_))
        ));
        assert_eq!(
            f.manager.get_branch(&branch.id).unwrap().status,
            BranchStatus::ActiveHealthy
        );
    }

    #[tokio::test]
    async fn test_rebase_conflict_reverts_status() {
        let f = fixture();
        let branch = f
            .manager
            .create("proj_parent", "dev", CreateBranchOptions::default())
            .await
            .unwrap();
        f.ledger
            .apply(&branch.branch_project_id, "local", "CREATE TABLE b (id int)")
            .await
            .unwrap();
        let parent_entry = f
            .ledger
            .apply("proj_parent", "upstream", "CREATE TABLE b (id int)")
            .await
            .unwrap();

        let err = f.manager.rebase(&branch.id).await.unwrap_err();
        assert!(
            matches!(err, PlatformError::RebaseConflict { ref migration, .. } if *migration == parent_entry.version)
        );
        assert_eq!(
            f.manager.get_branch(&branch.id).unwrap().status,
            BranchStatus::ActiveHealthy
        );
        let failed = f
            .store
            .migrations(&branch.branch_project_id)
            .into_iter()
            .find(|m| m.version == parent_entry.version)
            .unwrap();
        assert_eq!(failed.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let f = fixture();
        let default_branch = f
            .manager
            .create(
                "proj_parent",
                "main",
                CreateBranchOptions {
                    is_default: true,
                    ..CreateBranchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            f.manager.delete(&default_branch.id).await,
            Err(PlatformError::OperationNotPermitted(_))
        ));

        let branch = f
            .manager
            .create("proj_parent", "dev", CreateBranchOptions::default())
            .await
            .unwrap();
        f.store
            .update_branch(&branch.id, |b| b.status = BranchStatus::MigrationsFailed)
            .unwrap();
        assert!(matches!(
            f.manager.delete(&branch.id).await,
            Err(PlatformError::OperationNotPermitted(_))
        ));

        f.store
            .update_branch(&branch.id, |b| b.status = BranchStatus::Error)
            .unwrap();
        let outcome = f.manager.delete(&branch.id).await.unwrap();
        assert_eq!(outcome.status, OperationStatus::Deleted);
        assert!(matches!(
            f.manager.get_branch(&branch.id),
            Err(PlatformError::NotFound(_))
        ));
        assert!(f.store.get_project(&branch.branch_project_id).is_some());
        assert_eq!(f.manager.list_branches("proj_parent").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_branches_validation() {
        let f = fixture();
        assert!(matches!(
            f.manager.list_branches("").await,
            Err(PlatformError::Validation(_))
        ));
        assert!(matches!(
            f.manager.list_branches("proj_missing").await,
            Err(PlatformError::NotFound(_))
        ));
        assert!(f.manager.list_branches("proj_parent").await.unwrap().is_empty());
    }
}
