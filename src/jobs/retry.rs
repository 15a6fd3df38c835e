//! Backoff schedule for requeued jobs.

use rand::RngExt;

use crate::jobs::payload::JobEnvelope;

/// Seconds to wait before the given retry attempt runs.
///
/// With backoff enabled the base delay doubles per attempt and is capped at
/// `RetryBackoffMax`; jitter scales the pre-cap value by a uniform factor in
/// [0.5, 1.5] so a burst of failed workers does not reconverge on the same
/// instant. Without backoff the job's `Countdown` (or the default delay when
/// no countdown is set) applies as-is.
pub fn retry_delay_secs(job: &JobEnvelope, attempt: u32) -> u64 {
    if !job.retry_backoff {
        return if job.countdown > 0 {
            job.countdown
        } else {
            job.default_retry_delay
        };
    }

    let base = job.default_retry_delay.max(1) as f64;
    let mut delay = base * f64::from(2u32.saturating_pow(attempt.min(20)));
    if job.retry_jitter {
        delay *= rand::rng().random_range(0.5..=1.5);
    }
    (delay as u64).min(job.retry_backoff_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(backoff: bool, jitter: bool) -> JobEnvelope {
        let mut job = JobEnvelope::from_json(r#"{"Type":"KGAI"}"#).unwrap();
        job.retry_backoff = backoff;
        job.retry_jitter = jitter;
        job
    }

    #[test]
    fn backoff_doubles_per_attempt_without_jitter() {
        let job = job(true, false);
        assert_eq!(retry_delay_secs(&job, 0), 10);
        assert_eq!(retry_delay_secs(&job, 1), 20);
        assert_eq!(retry_delay_secs(&job, 2), 40);
        assert_eq!(retry_delay_secs(&job, 3), 80);
    }

    #[test]
    fn backoff_is_capped() {
        let job = job(true, false);
        assert_eq!(retry_delay_secs(&job, 10), 600);
        assert_eq!(retry_delay_secs(&job, 30), 600);
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let job = job(true, true);
        for attempt in 0..8 {
            let delay = retry_delay_secs(&job, attempt);
            let base = 10u64 * 2u64.pow(attempt);
            assert!(delay <= (base * 3 / 2).min(600), "attempt {attempt}: {delay}");
            if base / 2 < 600 {
                assert!(delay >= base / 2, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn no_backoff_uses_countdown_then_default() {
        let mut job = job(false, false);
        assert_eq!(retry_delay_secs(&job, 5), 10);
        job.countdown = 42;
        assert_eq!(retry_delay_secs(&job, 5), 42);
    }
}
