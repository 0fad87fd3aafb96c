pub mod branch;
pub mod catalog;
pub mod common;
pub mod function;
pub mod migration;
pub mod project;
pub mod sql;

pub use branch::*;
pub use catalog::*;
pub use common::*;
pub use function::*;
pub use migration::*;
pub use project::*;
pub use sql::*;
