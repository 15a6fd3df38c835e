//! Wire-format job payloads.
//!
//! Jobs cross the queue as JSON objects with PascalCase member names. The
//! envelope carries the routing discriminator and the retry knobs every job
//! type shares; task-specific fields stay opaque in the envelope and are
//! decoded a second time by the task's own schema.

use serde::{Deserialize, Serialize};

fn default_retry_delay() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_cap() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Common shape of every queued job. Task-specific members survive a
/// round-trip untouched in `extra`, so a requeued job loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "Type", default)]
    pub job_type: String,

    #[serde(rename = "SessionUID", default)]
    pub session_uid: String,

    /// Fixed delay (seconds) applied before the first attempt; never used
    /// as a backoff base.
    #[serde(rename = "Countdown", default)]
    pub countdown: u64,

    #[serde(rename = "DefaultRetryDelay", default = "default_retry_delay")]
    pub default_retry_delay: u64,

    #[serde(rename = "MaxRetries", default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(rename = "RetryBackoff", default = "default_true")]
    pub retry_backoff: bool,

    #[serde(rename = "RetryBackoffMax", default = "default_backoff_cap")]
    pub retry_backoff_max: u64,

    #[serde(rename = "RetryJitter", default = "default_true")]
    pub retry_jitter: bool,

    /// How many times this job has already been attempted. Incremented by
    /// the executor before a requeue.
    #[serde(rename = "Attempt", default)]
    pub attempt: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobEnvelope {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Canonical airpark noise-complaint schema. One schema serves both the
/// submission form and the validator; flat strings, all required, checked
/// in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirparkComplaint {
    #[serde(rename = "FirstName", default)]
    pub first_name: String,
    #[serde(rename = "LastName", default)]
    pub last_name: String,
    #[serde(rename = "Email", default)]
    pub email: String,
    #[serde(rename = "Phone", default)]
    pub phone: String,
    #[serde(rename = "Street", default)]
    pub street: String,
    #[serde(rename = "City", default)]
    pub city: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Zip", default)]
    pub zip: String,
    #[serde(rename = "StartDate", default)]
    pub start_date: String,
    #[serde(rename = "EndDate", default)]
    pub end_date: String,
    #[serde(rename = "StartTime", default)]
    pub start_time: String,
    #[serde(rename = "EndTime", default)]
    pub end_time: String,
    #[serde(rename = "AircraftType", default)]
    pub aircraft_type: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "ResponseRequested", default)]
    pub response_requested: String,
}

impl AirparkComplaint {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Report every missing required field, never stopping at the first.
    /// Order follows the field declarations above.
    pub fn validate(&self) -> Vec<String> {
        let required: [(&str, &str); 15] = [
            ("FirstName", &self.first_name),
            ("LastName", &self.last_name),
            ("Email", &self.email),
            ("Phone", &self.phone),
            ("Street", &self.street),
            ("City", &self.city),
            ("State", &self.state),
            ("Zip", &self.zip),
            ("StartDate", &self.start_date),
            ("EndDate", &self.end_date),
            ("StartTime", &self.start_time),
            ("EndTime", &self.end_time),
            ("AircraftType", &self.aircraft_type),
            ("Description", &self.description),
            ("ResponseRequested", &self.response_requested),
        ];

        required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| format!("Missing `{name}` value"))
            .collect()
    }
}
