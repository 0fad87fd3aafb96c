pub mod branch_ops;
pub mod database;
pub mod functions;
pub mod ledger;

pub use branch_ops::BranchManager;
pub use database::DatabaseService;
pub use functions::EdgeFunctionRegistry;
pub use ledger::MigrationLedger;
