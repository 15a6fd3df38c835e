//! Explicit per-process context threaded through the executor entrypoint.
//!
//! Replaces the global service/session singletons the worker would
//! otherwise accumulate: everything a component needs (settings, the
//! shared store, the HTTP client) travels in one [`WorkerContext`].

use std::sync::Arc;

use crate::core::config::Settings;
use crate::store::KvStore;

#[derive(Clone)]
pub struct WorkerContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn KvStore>,
    pub http: reqwest::Client,
}

impl WorkerContext {
    pub fn new(settings: Settings, store: Arc<dyn KvStore>, http: reqwest::Client) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            http,
        }
    }

    /// Discriminator this worker is configured to process.
    pub fn worker_type(&self) -> &str {
        &self.settings.general.worker_type
    }

    /// Effective minimum trust score for a task: the worker-level override
    /// wins when set (>= 0), otherwise the task registry default applies.
    pub fn min_trust_score(&self, task_default: u8) -> u8 {
        let override_score = self.settings.proxy.min_trust_score;
        if override_score >= 0 {
            override_score.clamp(0, 10) as u8
        } else {
            task_default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ctx_with_override(score: i32) -> WorkerContext {
        let mut settings = Settings::from_env();
        settings.proxy.min_trust_score = score;
        WorkerContext::new(settings, Arc::new(MemoryStore::new()), reqwest::Client::new())
    }

    #[test]
    fn trust_score_override_wins_when_set() {
        assert_eq!(ctx_with_override(-1).min_trust_score(3), 3);
        assert_eq!(ctx_with_override(7).min_trust_score(3), 7);
        assert_eq!(ctx_with_override(0).min_trust_score(3), 0);
        assert_eq!(ctx_with_override(99).min_trust_score(3), 10);
    }
}
