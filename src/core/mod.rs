pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::Settings;
pub use context::WorkerContext;
pub use error::{Classification, TaskError};
pub use types::{Stage, TaskResult};
