pub mod job;
pub mod service;

pub use job::{JobReport, JobState, JobStatus};
pub use service::{JobScheduler, SCHEDULER_PLATFORM};
