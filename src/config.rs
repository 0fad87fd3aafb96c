use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub platform: PlatformConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a single statement, in milliseconds
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub default_region: String,
    pub default_postgres_version: String,
    /// Organization plans that are entitled to branching
    pub branching_plans: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub path: Option<String>,
    pub compress: bool,
}

impl EngineConfig {
    pub fn statement_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.statement_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 30_000,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default_region: "us-west-1".to_string(),
            default_postgres_version: "15.1".to_string(),
            branching_plans: vec!["pro".to_string(), "team".to_string(), "enterprise".to_string()],
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: None,
            compress: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and config file
    pub fn load() -> anyhow::Result<Self> {
        // Load environment variables from .env file if it exists
        dotenvy::dotenv().ok();

        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("tenantdb").required(false));

        // Environment variables like TENANTDB_ENGINE__STATEMENT_TIMEOUT_MS
        config = config.add_source(
            config::Environment::with_prefix("TENANTDB")
                .separator("__")
                .prefix_separator("_")
                .list_separator(",")
                .with_list_parse_key("platform.branching_plans")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.statement_timeout_ms, 30_000);
        assert_eq!(config.engine.statement_timeout(), std::time::Duration::from_secs(30));
        assert!(config.platform.branching_plans.contains(&"team".to_string()));
        assert!(config.snapshot.compress);
        assert!(config.snapshot.path.is_none());
    }

    #[test]
    fn test_load_without_sources_yields_defaults() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.platform.default_region, "us-west-1");
        assert_eq!(config.platform.branching_plans.len(), 3);
    }
}
