pub mod adapter;
pub mod dialect;
pub mod errors;
pub mod types;

pub use adapter::{Execution, QueryEngine};
pub use dialect::{PreparedStatement, StatementKind};
