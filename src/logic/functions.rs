use crate::error::{PlatformError, Result};
use crate::model::{
    latest_version, name_to_slug, DeployFunction, EdgeFunction, FunctionStatus, DEFAULT_ENTRYPOINT,
};
use crate::store::{IdGenerator, PlatformStore};
use chrono::Utc;
use itertools::Itertools;
use log::info;
use std::sync::Arc;

/// Deploys and lists edge function versions per project
pub struct EdgeFunctionRegistry {
    store: Arc<PlatformStore>,
    ids: Arc<dyn IdGenerator>,
}

impl EdgeFunctionRegistry {
    pub fn new(store: Arc<PlatformStore>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, ids }
    }

    /// Append a new version; a known slug keeps its function id
    pub async fn deploy(&self, project_id: &str, request: DeployFunction) -> Result<EdgeFunction> {
        self.store.require_project(project_id)?;
        let slug = validate_deploy(&request)?;
        let entrypoint_path = request
            .entrypoint_path
            .clone()
            .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string());

        let _locks = self.store.lock_projects(&[project_id]).await;
        let existing = self.store.functions(project_id);
        let id = match latest_version(&existing, &slug) {
            Some(previous) => previous.id.clone(),
            None => self.ids.new_id("func_"),
        };
        let now = Utc::now();
        let function = EdgeFunction {
            id,
            slug,
            name: request.name.trim().to_string(),
            version: self.ids.new_id("ver_"),
            status: FunctionStatus::Active,
            created_at: now,
            updated_at: now,
            entrypoint_path,
            import_map_path: request.import_map_path,
            files: request.files,
        };
        self.store.push_function(project_id, function.clone())?;
        info!(
            "[{}] deployed function {} version {}",
            project_id, function.slug, function.version
        );
        Ok(function)
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<EdgeFunction>> {
        self.store.require_project(project_id)?;
        Ok(self.store.functions(project_id))
    }

    pub fn latest(&self, project_id: &str, slug: &str) -> Result<Option<EdgeFunction>> {
        self.store.require_project(project_id)?;
        let functions = self.store.functions(project_id);
        Ok(latest_version(&functions, slug).cloned())
    }
}

/// Check a deploy request and return the slug it deploys to
fn validate_deploy(request: &DeployFunction) -> Result<String> {
    let slug = name_to_slug(&request.name);
    if slug.is_empty() {
        return Err(PlatformError::Validation(
            "function name must contain at least one word character".to_string(),
        ));
    }
    if request.files.is_empty() {
        return Err(PlatformError::Validation(
            "at least one file is required".to_string(),
        ));
    }
    for file in &request.files {
        if file.name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "file names must not be empty".to_string(),
            ));
        }
        if file.content.trim().is_empty() {
            return Err(PlatformError::Validation(format!(
                "file '{}' has no content",
                file.name
            )));
        }
    }
    if let Some(duplicate) = request.files.iter().map(|f| &f.name).duplicates().next() {
        return Err(PlatformError::Validation(format!(
            "file '{}' is listed more than once",
            duplicate
        )));
    }

    let has_file = |path: &str| request.files.iter().any(|f| f.name == path);
    let entrypoint = request
        .entrypoint_path
        .as_deref()
        .unwrap_or(DEFAULT_ENTRYPOINT);
    if !has_file(entrypoint) {
        return Err(PlatformError::Validation(format!(
            "entrypoint '{}' is not among the deployed files",
            entrypoint
        )));
    }
    if let Some(import_map) = request.import_map_path.as_deref() {
        if !has_file(import_map) {
            return Err(PlatformError::Validation(format!(
                "import map '{}' is not among the deployed files",
                import_map
            )));
        }
    }
    Ok(slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FunctionFile, Project};
    use crate::store::UuidIdGenerator;

    fn registry() -> EdgeFunctionRegistry {
        let store = Arc::new(PlatformStore::new());
        store
            .insert_project(Project::new_with_id(
                "proj_a".to_string(),
                "alpha".to_string(),
                "org_1".to_string(),
                "us-west-1".to_string(),
                "15.1".to_string(),
            ))
            .unwrap();
        EdgeFunctionRegistry::new(store, Arc::new(UuidIdGenerator))
    }

    fn request(name: &str, body: &str) -> DeployFunction {
        DeployFunction {
            name: name.to_string(),
            files: vec![FunctionFile {
                name: "index.ts".to_string(),
                content: body.to_string(),
            }],
            entrypoint_path: None,
            import_map_path: None,
        }
    }

    #[tokio::test]
    async fn test_deploy_new_function() {
        let registry = registry();
        let deployed = registry
            .deploy("proj_a", request("Hello World!", "export default () => 1"))
            .await
            .unwrap();
        assert_eq!(deployed.slug, "hello-world");
        assert_eq!(deployed.name, "Hello World!");
        assert_eq!(deployed.status, FunctionStatus::Active);
        assert_eq!(deployed.entrypoint_path, DEFAULT_ENTRYPOINT);
        assert!(deployed.id.starts_with("func_"));
        assert!(deployed.version.starts_with("ver_"));
    }

    #[tokio::test]
    async fn test_redeploy_keeps_function_id() {
        let registry = registry();
        let first = registry
            .deploy("proj_a", request("hello", "v1"))
            .await
            .unwrap();
        let second = registry
            .deploy("proj_a", request("hello", "v2"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.version, second.version);

        assert_eq!(registry.list("proj_a").unwrap().len(), 2);
        let latest = registry.latest("proj_a", "hello").unwrap().unwrap();
        assert_eq!(latest.version, second.version);
        assert!(registry.latest("proj_a", "other").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_validation() {
        let registry = registry();
        assert!(matches!(
            registry.deploy("proj_a", request("!!!", "x")).await,
            Err(PlatformError::Validation(_))
        ));
        assert!(matches!(
            registry.deploy("proj_a", request("hello", "  ")).await,
            Err(PlatformError::Validation(_))
        ));

        let mut missing_entry = request("hello", "x");
        missing_entry.entrypoint_path = Some("main.ts".to_string());
        assert!(matches!(
            registry.deploy("proj_a", missing_entry).await,
            Err(PlatformError::Validation(_))
        ));

        let mut duplicated = request("hello", "x");
        duplicated.files.push(duplicated.files[0].clone());
        assert!(matches!(
            registry.deploy("proj_a", duplicated).await,
            Err(PlatformError::Validation(_))
        ));

        let mut bad_import_map = request("hello", "x");
        bad_import_map.import_map_path = Some("import_map.json".to_string());
        assert!(matches!(
            registry.deploy("proj_a", bad_import_map).await,
            Err(PlatformError::Validation(_))
        ));

        assert!(matches!(
            registry.deploy("proj_missing", request("hello", "x")).await,
            Err(PlatformError::NotFound(_))
        ));
        assert!(registry.list("proj_a").unwrap().is_empty());
    }
}
