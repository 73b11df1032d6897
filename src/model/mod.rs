pub mod extractors;
pub mod output;
pub mod policy;

pub use extractors::{KeepSummary, OwnershipExtractor, SpatialExtractor};
pub use output::{CommitLevel, KeepAction, PolicyOutput};
pub use policy::KeepPolicy;
