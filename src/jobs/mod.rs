//! Job intake and execution: envelope schema, task registry, queue, retry
//! policy, and the executor that drives one job through a browser session.

pub mod executor;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod retry;

pub use executor::{JobExecutor, JobOutcome, PrepareOutcome, PreparedJob};
pub use payload::{AirparkComplaint, JobEnvelope};
pub use queue::JobQueue;
pub use registry::{definition_for_job, find_definition, TaskDefinition};
pub use retry::retry_delay_secs;
