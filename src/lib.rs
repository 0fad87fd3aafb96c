pub mod config;
pub mod engine;
pub mod error;
pub mod logic;
pub mod model;
pub mod platform;
pub mod store;

pub use config::AppConfig;
pub use engine::QueryEngine;
pub use error::{PlatformError, Result, SqlErrorKind};
pub use logic::{BranchManager, DatabaseService, EdgeFunctionRegistry, MigrationLedger};
pub use platform::Platform;
pub use store::{BranchingPolicy, PlanBranchingPolicy, PlatformStore, Snapshot};

// Export all model types
pub use model::*;

/// Install the process logger: Info by default, sqlx limited to warnings.
/// Calling it again is a no-op.
pub fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let _ = Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .try_init();
}
