//! Sequential executor: in-order, cancelable downstream dispatch.

pub mod sequential;
pub mod task;

pub use sequential::{ExecutorConfig, LaneSnapshot, SequentialExecutor};
pub use task::{SequentialTask, ServiceType, TaskOutcome};
