pub mod memory;
pub mod snapshot;
pub mod traits;

pub use memory::{PlatformStore, ProjectLocks, StoreState};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
pub use traits::{BranchingPolicy, IdGenerator, PlanBranchingPolicy, UuidIdGenerator};
