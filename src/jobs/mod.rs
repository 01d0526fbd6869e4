//! Background jobs: queued imports and scheduled validation.

pub mod retry;
pub mod scheduler;

pub use retry::RetryPolicy;
pub use scheduler::{
    due_locations, Command, JobContext, JobOutcome, JobScheduler, SchedulerError, SchedulerHandle,
    SchedulerSettings,
};
