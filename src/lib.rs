//! Browser-automation worker that submits municipal complaint forms.
//!
//! A fleet of single-job worker processes pulls form-submission jobs from a
//! shared Redis queue. Each job drives one fresh browser session through
//! proxy-identity negotiation, human-cadence form filling, audio challenge
//! solving, and submission, and publishes a structured result record back to
//! the store.

pub mod captcha;
pub mod core;
pub mod jobs;
pub mod proxy;
pub mod session;
pub mod store;
pub mod util;
pub mod worker;

pub use crate::core::{Settings, Stage, TaskError, TaskResult, WorkerContext};
pub use crate::worker::Worker;
