pub mod browser_manager;
pub mod config;
pub mod executor;
pub mod logger;
pub mod manager;
pub mod manager_group;
pub mod messages;
pub mod results;
pub mod sanitizer;
pub mod worker;

pub use config::RunConfig;
pub use manager::{ManagerSummary, TestRunnerManager};
pub use manager_group::{ManagerGroup, ManagerGroupError};
