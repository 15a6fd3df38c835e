//! Job execution: validation, session orchestration, retry classification.
//!
//! Execution is two-phase. [`JobExecutor::prepare`] does everything that
//! must not touch a browser: the worker-type check, the job metadata
//! record, and request validation. A validation failure returns a result
//! and the session is never spent on it. [`JobExecutor::run`] then drives
//! one full session (tear-up, form fill, challenge, submit) and classifies
//! any failure into the retry policy.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::captcha::{captcha_is_visible_on_page, CaptchaSolver, SolverConfig};
use crate::core::{Classification, Stage, TaskError, TaskResult, WorkerContext};
use crate::jobs::payload::{AirparkComplaint, JobEnvelope};
use crate::jobs::registry::{airpark_form_plan, definition_for_job, FormPlan, TaskDefinition};
use crate::jobs::retry::retry_delay_secs;
use crate::proxy::ProxyNegotiator;
use crate::session::driver::PageDriver;
use crate::session::lifecycle::{PageSetupConfig, SessionController, SessionTuning};

/// Terminal disposition of one job attempt.
#[derive(Debug)]
pub enum JobOutcome {
    /// Result published; nothing further to do. Covers success and the
    /// soft validation path.
    Completed(TaskResult),
    /// Requeue after `delay_secs`; the envelope carries the bumped attempt
    /// counter.
    Retry { job: JobEnvelope, delay_secs: u64 },
    /// Session state is assumed corrupt; the supervising loop rebuilds it.
    Fatal { error: TaskError, result: TaskResult },
}

/// A job that passed every pre-browser check.
pub struct PreparedJob {
    pub job: JobEnvelope,
    pub definition: &'static TaskDefinition,
    pub plan: FormPlan,
    pub result: TaskResult,
}

pub enum PrepareOutcome {
    Ready(Box<PreparedJob>),
    Done(JobOutcome),
}

pub struct JobExecutor<'a> {
    ctx: &'a WorkerContext,
    tuning: SessionTuning,
    solver_config: SolverConfig,
}

impl<'a> JobExecutor<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self {
            ctx,
            tuning: SessionTuning::default(),
            solver_config: SolverConfig::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: SessionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_solver_config(mut self, config: SolverConfig) -> Self {
        self.solver_config = config;
        self
    }

    // ── Phase 1: no browser ──────────────────────────────────────────────────

    pub async fn prepare(&self, mut job: JobEnvelope) -> PrepareOutcome {
        if job.session_uid.is_empty() {
            job.session_uid = uuid::Uuid::new_v4().to_string();
        }
        let uid = job.session_uid.clone();
        info!("Begin processing of job with UID {uid}");

        let mut result = TaskResult::new();

        let definition = match definition_for_job(self.ctx.worker_type(), &job) {
            Ok(definition) => definition,
            Err(e) => {
                result.record_error(&e.to_string());
                self.publish_result(&uid, &result).await;
                return PrepareOutcome::Done(JobOutcome::Fatal { error: e, result });
            }
        };

        self.mark_started(&uid).await;

        let complaint = match self.decode_complaint(&job) {
            Ok(complaint) => complaint,
            Err(e) => {
                result.record_error(&format!("Failed to decode job payload: {e}"));
                self.publish_result(&uid, &result).await;
                return PrepareOutcome::Done(JobOutcome::Fatal {
                    error: TaskError::Other(e),
                    result,
                });
            }
        };

        let validation_errors = complaint.validate();
        if !validation_errors.is_empty() {
            let fault = TaskError::Validation(validation_errors.clone());
            error!("Errors in the request: {fault}");
            result.validation_errors = validation_errors;
            self.publish_result(&uid, &result).await;
            return PrepareOutcome::Done(JobOutcome::Completed(result));
        }

        let plan = airpark_form_plan(&complaint, &uid);
        PrepareOutcome::Ready(Box::new(PreparedJob {
            job,
            definition,
            plan,
            result,
        }))
    }

    // ── Phase 2: one session ─────────────────────────────────────────────────

    pub async fn run(
        &self,
        mut prepared: PreparedJob,
        driver: &dyn PageDriver,
        negotiator: &ProxyNegotiator,
    ) -> JobOutcome {
        let uid = prepared.job.session_uid.clone();
        let started = Instant::now();

        let run = self
            .run_session(&mut prepared, driver, negotiator)
            .await;

        match run {
            Ok(()) => {
                let processing_total = started.elapsed().as_millis() as u64;
                info!("Total processing execution time for job {uid} is {processing_total} ms.");
                self.record_processing_total(&uid, processing_total).await;
                prepared.result.advance_stage(Stage::Done);
                self.publish_result(&uid, &prepared.result).await;
                JobOutcome::Completed(prepared.result)
            }
            Err(err) => self.classify_failure(prepared, err).await,
        }
    }

    /// Classify a failure that struck before [`JobExecutor::run`] could
    /// start, such as a browser that never launched. The prepared job still
    /// ends in a published outcome instead of silently disappearing.
    pub async fn fail(&self, prepared: PreparedJob, error: TaskError) -> JobOutcome {
        self.classify_failure(prepared, error).await
    }

    async fn run_session(
        &self,
        prepared: &mut PreparedJob,
        driver: &dyn PageDriver,
        negotiator: &ProxyNegotiator,
    ) -> Result<(), TaskError> {
        let definition = prepared.definition;
        let controller =
            SessionController::new(driver, negotiator).with_tuning(self.tuning.clone());

        // Per-job scratch space under the downloads root. The guard removes
        // it when the session ends, whatever the outcome.
        let temp_dir = tempfile::tempdir_in(&self.ctx.settings.cache.downloads_path)
            .map_err(|e| TaskError::Browser(format!("cannot create job temp directory: {e}")))?;

        let mut setup = PageSetupConfig::new(definition.page_url, definition.anchor_selector);
        setup.trust_threshold = self.ctx.min_trust_score(setup.trust_threshold);
        setup.blocked_urls = definition
            .tearup_block_urls
            .iter()
            .map(|u| u.to_string())
            .collect();
        controller.tearup(&setup, &mut prepared.result).await?;

        controller
            .fill_form(&prepared.plan, &mut prepared.result)
            .await?;

        let challenge_present = captcha_is_visible_on_page(
            driver,
            self.solver_config.widget_wait_timeout_ms,
            self.solver_config.widget_wait_poll_ms,
        )
        .await
        .map_err(|e| TaskError::Browser(e.to_string()))?;
        if challenge_present {
            let solver = CaptchaSolver::new(
                driver,
                self.ctx.store.as_ref(),
                &self.ctx.http,
                &self.ctx.settings.transcribe,
                temp_dir.path(),
            )
            .with_config(self.solver_config.clone());
            if !solver.solve().await? {
                return Err(TaskError::RetryableSubmission(
                    "Challenge was not solved within its budget".to_string(),
                ));
            }
        }

        controller
            .submit(&prepared.plan, definition.page_url, &mut prepared.result)
            .await?;
        prepared.result.body = Some("All done successfully".to_string());
        Ok(())
    }

    async fn classify_failure(&self, mut prepared: PreparedJob, err: TaskError) -> JobOutcome {
        let uid = prepared.job.session_uid.clone();
        match err.classification() {
            Classification::Retryable => {
                if prepared.job.attempt >= prepared.job.max_retries {
                    let error = TaskError::RetriesExhausted {
                        attempts: prepared.job.attempt,
                    };
                    prepared.result.record_error(&error.to_string());
                    self.publish_result(&uid, &prepared.result).await;
                    return JobOutcome::Fatal {
                        error,
                        result: prepared.result,
                    };
                }
                warn!("Failed to obtain results, retrying: {err}");
                let delay_secs = retry_delay_secs(&prepared.job, prepared.job.attempt);
                let mut job = prepared.job;
                job.attempt += 1;
                JobOutcome::Retry { job, delay_secs }
            }
            Classification::Soft | Classification::Fatal => {
                if prepared.result.error.is_none() {
                    prepared.result.record_error(&err.to_string());
                }
                self.publish_result(&uid, &prepared.result).await;
                JobOutcome::Fatal {
                    error: err,
                    result: prepared.result,
                }
            }
        }
    }

    // ── Store bookkeeping ────────────────────────────────────────────────────

    fn decode_complaint(&self, job: &JobEnvelope) -> anyhow::Result<AirparkComplaint> {
        let raw = job.to_json()?;
        Ok(AirparkComplaint::from_json(&raw)?)
    }

    /// Read-modify-write of the `job.<uid>` metadata record. Races between
    /// workers are tolerated; the last writer wins.
    async fn mark_started(&self, uid: &str) {
        let key = format!("job.{uid}");
        let mut meta = self.read_meta(&key).await;
        meta.insert("started_at".to_string(), json!(Utc::now().to_rfc3339()));
        meta.insert("task_post_run".to_string(), json!(uid));
        self.write_meta(&key, &meta).await;
    }

    async fn record_processing_total(&self, uid: &str, processing_total_ms: u64) {
        let key = format!("job.{uid}");
        let mut meta = self.read_meta(&key).await;
        meta.insert("processing_total".to_string(), json!(processing_total_ms));
        self.write_meta(&key, &meta).await;
    }

    async fn read_meta(&self, key: &str) -> serde_json::Map<String, serde_json::Value> {
        match self.ctx.store.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Default::default(),
            Err(e) => {
                warn!("failed to read {key}: {e}");
                Default::default()
            }
        }
    }

    async fn write_meta(&self, key: &str, meta: &serde_json::Map<String, serde_json::Value>) {
        match serde_json::to_string(meta) {
            Ok(raw) => {
                if let Err(e) = self.ctx.store.set(key, &raw).await {
                    warn!("failed to write {key}: {e}");
                }
            }
            Err(e) => warn!("failed to encode {key}: {e}"),
        }
    }

    async fn publish_result(&self, uid: &str, result: &TaskResult) {
        let key = format!("result.{uid}");
        match serde_json::to_string(result) {
            Ok(raw) => {
                if let Err(e) = self.ctx.store.set(&key, &raw).await {
                    warn!("failed to publish result for job {uid}: {e}");
                }
            }
            Err(e) => warn!("failed to encode result for job {uid}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::Settings;
    use crate::proxy::NegotiatorConfig;
    use crate::session::driver::fake::FakeDriver;
    use crate::store::{KvStore, MemoryStore};

    fn context(store: Arc<MemoryStore>, downloads: &std::path::Path, trust: i32) -> WorkerContext {
        let mut settings = Settings::from_env();
        settings.general.worker_type = "KGAI".to_string();
        settings.proxy.min_trust_score = trust;
        settings.cache.downloads_path = downloads.to_path_buf();
        settings.cache.data_path = downloads.join(".data");
        settings.cache.disk_path = downloads.join(".disk");
        WorkerContext::new(settings, store, reqwest::Client::new())
    }

    fn negotiator() -> ProxyNegotiator {
        let mut settings = Settings::from_env().proxy;
        settings.api_url = "http://assign.local".to_string();
        ProxyNegotiator::new(
            settings,
            "worker-test".to_string(),
            reqwest::Client::new(),
            NegotiatorConfig {
                max_attempts: 1,
                settle_lower_ms: 0,
                settle_upper_ms: 0,
                probe_poll_attempts: 1,
                probe_poll_interval_ms: 0,
                audit_addresses: false,
            },
        )
    }

    fn fast_tuning() -> SessionTuning {
        SessionTuning {
            typing_delay_from_ms: 0,
            typing_delay_to_ms: 0,
            submit_settle_ms: 0,
            submit_load_timeout_ms: 100,
            submit_poll_attempts: 3,
            ready_poll_ms: 1,
        }
    }

    fn fast_solver() -> SolverConfig {
        SolverConfig {
            widget_wait_timeout_ms: 0,
            widget_wait_poll_ms: 0,
            post_click_delay_ms: 0,
            record_poll_attempts: 1,
            record_poll_interval_ms: 0,
            pre_paste_delay_ms: 0,
            pre_continue_delay_ms: 0,
            typing_delay_from_ms: 0,
            typing_delay_to_ms: 0,
        }
    }

    fn complete_payload(uid: &str) -> JobEnvelope {
        JobEnvelope::from_json(&format!(
            r#"{{"Type":"KGAI","SessionUID":"{uid}","FirstName":"Ada","LastName":"L",
                "Email":"a@b.c","Phone":"1","Street":"s","City":"c","State":"MD","Zip":"2",
                "StartDate":"04/15/2025","EndDate":"04/15/2025","StartTime":"14:00",
                "EndTime":"14:30","AircraftType":"Jet","Description":"d",
                "ResponseRequested":"Yes"}}"#
        ))
        .unwrap()
    }

    fn scripted_success_driver(page_url: &str) -> FakeDriver {
        let driver = FakeDriver::new();
        {
            let mut state = driver.state.lock().unwrap();
            state.url = page_url.to_string();
            state.url_after_submit = Some(format!("{page_url}/thanks"));
            for sel in [
                "[id='First Name']",
                "[id='Last Name']",
                "#email",
                "[id='Phone Number']",
                "[id='Street Address Cross Streets']",
                "#City",
                "#State",
                "#ZIP",
                "[id='Aircraft Type']",
                "[id='Description Question']",
                "[id='Response requested']",
            ] {
                state.visible.push(sel.to_string());
            }
        }
        driver
    }

    #[tokio::test]
    async fn type_mismatch_is_fatal_before_any_session_work() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(store.clone(), dir.path(), -1);
        let executor = JobExecutor::new(&ctx);

        let job = JobEnvelope::from_json(r#"{"Type":"FAA","SessionUID":"j1"}"#).unwrap();
        match executor.prepare(job).await {
            PrepareOutcome::Done(JobOutcome::Fatal { error, .. }) => {
                assert!(matches!(error, TaskError::TypeMismatch { .. }));
            }
            _ => panic!("expected fatal type mismatch"),
        }
        // Result published, but no job metadata was ever written.
        assert!(store.get("result.j1").await.unwrap().is_some());
        assert!(store.get("job.j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validation_failure_is_soft_and_browserless() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(store.clone(), dir.path(), -1);
        let executor = JobExecutor::new(&ctx);

        let job =
            JobEnvelope::from_json(r#"{"Type":"KGAI","SessionUID":"j2","FirstName":"Ada"}"#)
                .unwrap();
        match executor.prepare(job).await {
            PrepareOutcome::Done(JobOutcome::Completed(result)) => {
                assert!(result
                    .validation_errors
                    .contains(&"Missing `Email` value".to_string()));
                assert!(result.error.is_none());
                assert_eq!(result.stage, Stage::Init);
            }
            _ => panic!("expected soft completion"),
        }

        // Metadata record carries the start marker.
        let meta: serde_json::Value =
            serde_json::from_str(&store.get("job.j2").await.unwrap().unwrap()).unwrap();
        assert_eq!(meta["task_post_run"], "j2");
        assert!(meta["started_at"].is_string());

        let published: serde_json::Value =
            serde_json::from_str(&store.get("result.j2").await.unwrap().unwrap()).unwrap();
        assert!(published["Errors"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e == "Missing `Email` value"));
    }

    #[tokio::test]
    async fn successful_run_publishes_done_result_and_timing() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        // Trust threshold 0 accepts the first identity without probing.
        let ctx = context(store.clone(), dir.path(), 0);
        let executor = JobExecutor::new(&ctx)
            .with_tuning(fast_tuning())
            .with_solver_config(fast_solver());

        let PrepareOutcome::Ready(prepared) = executor.prepare(complete_payload("j3")).await
        else {
            panic!("expected prepared job");
        };

        let driver = scripted_success_driver(prepared.definition.page_url);
        driver
            .state
            .lock()
            .unwrap()
            .visible
            .push(prepared.definition.anchor_selector.to_string());

        let negotiator = negotiator();
        match executor.run(*prepared, &driver, &negotiator).await {
            JobOutcome::Completed(result) => {
                assert_eq!(result.stage, Stage::Done);
                assert_eq!(result.body.as_deref(), Some("All done successfully"));
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let meta: serde_json::Value =
            serde_json::from_str(&store.get("job.j3").await.unwrap().unwrap()).unwrap();
        assert!(meta["processing_total"].is_u64());
        assert!(store.get("result.j3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn launch_fault_still_ends_the_dequeued_job_in_a_published_result() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(store.clone(), dir.path(), 0);
        let executor = JobExecutor::new(&ctx);

        let PrepareOutcome::Ready(prepared) = executor.prepare(complete_payload("j6")).await
        else {
            panic!("expected prepared job");
        };

        let fault = TaskError::Browser("browser launch failed: no executable".to_string());
        match executor.fail(*prepared, fault).await {
            JobOutcome::Fatal { error, result } => {
                assert!(matches!(error, TaskError::Browser(_)));
                assert_eq!(result.stage, Stage::Error);
            }
            other => panic!("expected fatal, got {other:?}"),
        }

        let published: serde_json::Value =
            serde_json::from_str(&store.get("result.j6").await.unwrap().unwrap()).unwrap();
        assert!(published["Error"]
            .as_str()
            .unwrap()
            .contains("browser launch failed"));
    }

    #[tokio::test]
    async fn rejected_submission_retries_until_the_budget_is_spent() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(store.clone(), dir.path(), 0);
        let executor = JobExecutor::new(&ctx)
            .with_tuning(fast_tuning())
            .with_solver_config(fast_solver());

        let PrepareOutcome::Ready(prepared) = executor.prepare(complete_payload("j4")).await
        else {
            panic!("expected prepared job");
        };
        let driver = scripted_success_driver(prepared.definition.page_url);
        {
            let mut state = driver.state.lock().unwrap();
            state.visible.push(prepared.definition.anchor_selector.to_string());
            state.page_source = "Please complete all required fields!".to_string();
        }

        let negotiator = negotiator();
        match executor.run(*prepared, &driver, &negotiator).await {
            JobOutcome::Retry { job, delay_secs } => {
                assert_eq!(job.attempt, 1);
                assert!(delay_secs >= 5 && delay_secs <= 15, "delay {delay_secs}");
            }
            other => panic!("expected retry, got {other:?}"),
        }

        // A job that has already burned its retries goes fatal instead.
        let mut exhausted = complete_payload("j5");
        exhausted.attempt = 3;
        let PrepareOutcome::Ready(prepared) = executor.prepare(exhausted).await else {
            panic!("expected prepared job");
        };
        let driver = scripted_success_driver(prepared.definition.page_url);
        {
            let mut state = driver.state.lock().unwrap();
            state.visible.push(prepared.definition.anchor_selector.to_string());
            state.page_source = "Please complete all required fields!".to_string();
        }
        match executor.run(*prepared, &driver, &negotiator).await {
            JobOutcome::Fatal { error, result } => {
                assert!(matches!(error, TaskError::RetriesExhausted { attempts: 3 }));
                assert_eq!(result.stage, Stage::Error);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }
}
