use crate::model::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchStatus {
    CreatingProject,
    RunningMigrations,
    ActiveHealthy,
    MigrationsFailed,
    FunctionsFailed,
    Merging,
    Rebasing,
    Resetting,
    ResetFailed,
    Error,
    Completed,
}

impl BranchStatus {
    /// Statuses that only exist while an operation holds the branch
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BranchStatus::CreatingProject
                | BranchStatus::RunningMigrations
                | BranchStatus::Merging
                | BranchStatus::Rebasing
                | BranchStatus::Resetting
        )
    }

    pub fn allows_delete(self) -> bool {
        !matches!(
            self,
            BranchStatus::CreatingProject
                | BranchStatus::RunningMigrations
                | BranchStatus::MigrationsFailed
                | BranchStatus::FunctionsFailed
        )
    }
}

/// A development branch; its data lives in the project `branch_project_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub name: String,
    pub parent_project_id: Id,
    pub branch_project_id: Id,
    pub status: BranchStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Set when schema was changed on the branch outside of a migration
    #[serde(default)]
    pub has_uncommitted_schema_changes: bool,
}

fn default_persistent() -> bool {
    true
}

impl Branch {
    pub fn new(
        id: Id,
        name: String,
        parent_project_id: Id,
        branch_project_id: Id,
        options: &CreateBranchOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            parent_project_id,
            branch_project_id,
            status: BranchStatus::CreatingProject,
            created_at: now,
            last_activity_at: now,
            is_default: options.is_default,
            persistent: options.persistent,
            git_branch: options.git_branch.clone(),
            region: options.region.clone(),
            has_uncommitted_schema_changes: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBranchOptions {
    pub git_branch: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    pub region: Option<String>,
}

impl Default for CreateBranchOptions {
    fn default() -> Self {
        Self {
            git_branch: None,
            is_default: false,
            persistent: true,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Completed,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub branch_id: Id,
    pub status: OperationStatus,
    pub target_migration_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebaseOutcome {
    pub branch_id: Id,
    pub status: OperationStatus,
    pub rebase_operation_id: Option<Id>,
    /// Parent versions applied to the branch by this call
    pub applied_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub branch_id: Id,
    pub target_project_id: Id,
    pub status: OperationStatus,
    pub merge_request_id: Id,
    pub merged_functions: Vec<String>,
    pub merged_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub branch_id: Id,
    pub status: OperationStatus,
    pub message: String,
}
