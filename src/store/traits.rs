use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::model::{generate_id, Id, Project};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Decides whether a project's organization may create branches
#[async_trait::async_trait]
pub trait BranchingPolicy: Send + Sync {
    async fn is_branching_enabled(&self, project: &Project) -> Result<bool>;
}

/// Source of prefixed record identifiers
pub trait IdGenerator: Send + Sync {
    fn new_id(&self, prefix: &str) -> Id;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn new_id(&self, prefix: &str) -> Id {
        generate_id(prefix)
    }
}

/// Plan-based entitlement: organizations on one of the branching plans may branch
pub struct PlanBranchingPolicy {
    branching_plans: Vec<String>,
    organization_plans: RwLock<HashMap<Id, String>>,
}

impl PlanBranchingPolicy {
    pub fn new(branching_plans: Vec<String>) -> Self {
        Self {
            branching_plans,
            organization_plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &PlatformConfig) -> Self {
        Self::new(config.branching_plans.clone())
    }

    pub fn set_plan(&self, organization_id: &str, plan: &str) {
        self.organization_plans
            .write()
            .insert(organization_id.to_string(), plan.to_lowercase());
    }
}

#[async_trait::async_trait]
impl BranchingPolicy for PlanBranchingPolicy {
    async fn is_branching_enabled(&self, project: &Project) -> Result<bool> {
        let plan = self
            .organization_plans
            .read()
            .get(&project.organization_id)
            .cloned()
            .ok_or_else(|| PlatformError::not_found("organization", &project.organization_id))?;
        Ok(self.branching_plans.iter().any(|p| p.eq_ignore_ascii_case(&plan)))
    }
}
