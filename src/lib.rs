pub mod adaptor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod poller;
pub mod pricing;
pub mod routes;
pub mod scheduler;
pub mod settlement;
pub mod status;
pub mod store;
pub mod task;

pub use error::{AdaptorError, PricingError, SettlementError, StoreError};
pub use poller::ChannelTaskPoller;
pub use settlement::{SettlementOutcome, TaskSettlementReconciler};
pub use task::{Channel, Task, TaskInfo, TaskPlatform, TaskStatus};
