//! Tests, test groups, and the shared queue that hands groups out to managers.

pub mod builder;
pub mod chunker;
pub mod error;
pub mod group;
pub mod hash;
pub mod queue;
pub mod status;
pub mod test_spec;

pub use builder::{GroupFile, GroupPolicy, TestQueueBuilder};
pub use error::QueueError;
pub use group::{GroupId, GroupMetadata, TestGroup};
pub use queue::{ReadQueue, WriteQueue};
pub use status::{Expectation, Status};
pub use test_spec::{SubsuiteName, Test, TestId, TestKey, TestType, TestsByType};
