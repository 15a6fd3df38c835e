//! Failure taxonomy for job execution.
//!
//! Every failure the worker can encounter maps onto exactly one
//! [`Classification`], and the mapping is a total function: an unknown
//! fault is a browser fault, and a browser fault is fatal. Only a
//! narrowly-scoped "site rejected the submission" condition is retried at
//! the queue layer; everything else trades a few seconds of unavailability
//! for a guaranteed clean browser, session and proxy on restart.

use thiserror::Error;

/// What the executor does with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// User-correctable; returned in the result, never raised. The browser
    /// is never touched on this path.
    Soft,
    /// Requeue with bounded exponential backoff.
    Retryable,
    /// Session state is assumed corrupt; the supervising loop rebuilds the
    /// browser and proxy identity from scratch.
    Fatal,
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Missing required fields, in declaration order.
    #[error("request validation failed: {0:?}")]
    Validation(Vec<String>),

    /// The site reported a rejected form submission, likely a stale
    /// session, worth a fresh attempt from the queue.
    #[error("site rejected submission: {0}")]
    RetryableSubmission(String),

    #[error("job retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("proxy negotiation exhausted after {attempts} attempts (threshold {threshold})")]
    ProxyNegotiationExhausted { attempts: u32, threshold: u8 },

    /// Hard-block page signature seen during the CAPTCHA handshake. Callers
    /// distinguish "rotate proxy" from "challenge unsolved" on this variant.
    #[error("IP blocked by challenge provider")]
    IpBlocked,

    #[error("page load timed out after {0} ms")]
    PageLoadTimeout(u64),

    #[error("session {stage} failed after {attempts} attempts")]
    StageExhausted { stage: &'static str, attempts: u32 },

    #[error("worker handles job type `{expected}`, payload carries `{actual}`")]
    TypeMismatch { expected: String, actual: String },

    /// Driver-level fault, name-resolution fault, or anything unclassified.
    #[error("browser fault: {0}")]
    Browser(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Total classification over every failure kind.
    pub fn classification(&self) -> Classification {
        match self {
            TaskError::Validation(_) => Classification::Soft,
            TaskError::RetryableSubmission(_) => Classification::Retryable,
            TaskError::RetriesExhausted { .. }
            | TaskError::ProxyNegotiationExhausted { .. }
            | TaskError::IpBlocked
            | TaskError::PageLoadTimeout(_)
            | TaskError::StageExhausted { .. }
            | TaskError::TypeMismatch { .. }
            | TaskError::Browser(_)
            | TaskError::Other(_) => Classification::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.classification() == Classification::Fatal
    }
}
