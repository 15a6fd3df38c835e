//! Session state machine: tear-up, form processing, tear-down.
//!
//! A session serves exactly one job. Tear-up rotates the proxy identity and
//! proves the target form actually rendered before the job is allowed to
//! touch it; tear-down repeats the same procedure afterwards so the next
//! session starts from a page the site considers organic. Every step logs
//! into the job's [`TaskResult`] as well as the process log.

use std::time::{Duration, Instant};

use rand::RngExt;
use tracing::debug;

use crate::core::{Stage, TaskError, TaskResult};
use crate::jobs::registry::FormPlan;
use crate::proxy::{NegotiationOutcome, ProxyNegotiator};
use crate::session::driver::PageDriver;

/// Parameters for one tear-up or tear-down pass.
#[derive(Debug, Clone)]
pub struct PageSetupConfig {
    pub initial_url: String,
    /// Whole-procedure retries before the stage is declared exhausted.
    pub attempts: u32,
    /// Minimum proxy trust score demanded during setup.
    pub trust_threshold: u8,
    /// Resources suppressed while the page loads.
    pub blocked_urls: Vec<String>,
    /// Element whose visibility proves the form rendered.
    pub anchor_selector: String,
    pub page_load_timeout_ms: u64,
    pub anchor_timeout_ms: u64,
    pub anchor_poll_ms: u64,
}

impl PageSetupConfig {
    pub fn new(initial_url: &str, anchor_selector: &str) -> Self {
        Self {
            initial_url: initial_url.to_string(),
            attempts: 3,
            trust_threshold: 7,
            blocked_urls: Vec::new(),
            anchor_selector: anchor_selector.to_string(),
            page_load_timeout_ms: 20_000,
            anchor_timeout_ms: 5_000,
            anchor_poll_ms: 500,
        }
    }
}

/// Pacing knobs, separated out so tests can run the controller flat-out.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub typing_delay_from_ms: u64,
    pub typing_delay_to_ms: u64,
    /// Settle time after clicking the submit control.
    pub submit_settle_ms: u64,
    pub submit_load_timeout_ms: u64,
    pub submit_poll_attempts: u32,
    pub ready_poll_ms: u64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            typing_delay_from_ms: 50,
            typing_delay_to_ms: 200,
            submit_settle_ms: 5_000,
            submit_load_timeout_ms: 10_000,
            submit_poll_attempts: 3,
            ready_poll_ms: 100,
        }
    }
}

fn js_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

pub struct SessionController<'a> {
    driver: &'a dyn PageDriver,
    negotiator: &'a ProxyNegotiator,
    tuning: SessionTuning,
}

impl<'a> SessionController<'a> {
    pub fn new(driver: &'a dyn PageDriver, negotiator: &'a ProxyNegotiator) -> Self {
        Self {
            driver,
            negotiator,
            tuning: SessionTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: SessionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    // ── Page setup ───────────────────────────────────────────────────────────

    pub async fn tearup(
        &self,
        config: &PageSetupConfig,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        self.page_setup("tearup", config, result).await
    }

    pub async fn teardown(
        &self,
        config: &PageSetupConfig,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        self.page_setup("teardown", config, result).await?;
        result.reset_stage();
        Ok(())
    }

    async fn page_setup(
        &self,
        stage: &'static str,
        config: &PageSetupConfig,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        let mut proxy_failures = 0u32;
        for attempt in 1..=config.attempts {
            result.log(&format!(
                "Attempting to reach the form page during {stage}: {attempt} out of {}",
                config.attempts
            ));

            match self.negotiator.negotiate(self.driver, config.trust_threshold).await {
                Ok(NegotiationOutcome::Accepted { .. }) => {
                    result.log(&format!("Proxy successfully changed during {stage}"));
                }
                Ok(NegotiationOutcome::Exhausted { attempts }) => {
                    result.log(&format!(
                        "Failed to find a suitable proxy after {attempts} attempts"
                    ));
                    proxy_failures += 1;
                    continue;
                }
                Err(e) => {
                    result.log(&format!("Failed to change proxy: {e}"));
                    proxy_failures += 1;
                    continue;
                }
            }

            if !config.blocked_urls.is_empty() {
                if let Err(e) = self.driver.set_blocked_urls(&config.blocked_urls).await {
                    result.log(&format!("Failed to suppress blocked resources: {e}"));
                }
            }

            let prepared = self.prepare_page(config, result).await;

            if !config.blocked_urls.is_empty() {
                if let Err(e) = self.driver.set_blocked_urls(&[]).await {
                    result.log(&format!("Failed to re-enable blocked resources: {e}"));
                }
            }

            if prepared {
                return Ok(());
            }
        }

        // When not a single attempt got past the proxy, name the real
        // culprit instead of the stage.
        if proxy_failures == config.attempts {
            return Err(TaskError::ProxyNegotiationExhausted {
                attempts: config.attempts,
                threshold: config.trust_threshold,
            });
        }
        Err(TaskError::StageExhausted {
            stage,
            attempts: config.attempts,
        })
    }

    /// Load the target page and prove the form rendered. Returns false on
    /// any miss; the caller decides whether another attempt remains.
    async fn prepare_page(&self, config: &PageSetupConfig, result: &mut TaskResult) -> bool {
        result.log(&format!("Obtaining the page with URL {}", config.initial_url));
        if let Err(e) = self.driver.goto(&config.initial_url).await {
            result.record_error(&format!(
                "Error obtaining the initial page URL: {e}"
            ));
            self.snapshot_body(result).await;
            return false;
        }
        result.log("Initial page URL obtained");
        result.advance_stage(Stage::ObtainedPage);

        if let Err(e) = self
            .wait_for_page_to_load(config.page_load_timeout_ms, result)
            .await
        {
            result.record_error(&format!("Failed to load the page: {e}"));
            self.snapshot_body(result).await;
            return false;
        }

        match self
            .wait_for_element(
                &config.anchor_selector,
                config.anchor_timeout_ms,
                config.anchor_poll_ms,
            )
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                result.log(&format!(
                    "Failed to find anchor element `{}` within {} ms",
                    config.anchor_selector, config.anchor_timeout_ms
                ));
                self.snapshot_body(result).await;
                false
            }
            Err(e) => {
                result.log(&format!("Anchor visibility check failed: {e}"));
                false
            }
        }
    }

    /// Poll `document.readyState` until complete or the deadline passes.
    pub async fn wait_for_page_to_load(
        &self,
        timeout_ms: u64,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        result.log(&format!("Waiting up to {timeout_ms} ms for the page to load"));
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.driver.ready_state().await {
                Ok(state) => {
                    debug!("document.readyState: {state}");
                    if state == "complete" {
                        return Ok(());
                    }
                }
                Err(e) => debug!("readyState probe failed: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(TaskError::PageLoadTimeout(timeout_ms));
            }
            tokio::time::sleep(Duration::from_millis(self.tuning.ready_poll_ms)).await;
        }
    }

    /// Poll element visibility. `Ok(false)` on timeout, never an error.
    pub async fn wait_for_element(
        &self,
        selector: &str,
        timeout_ms: u64,
        poll_ms: u64,
    ) -> anyhow::Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.driver.is_visible(selector).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
        }
    }

    // ── Form processing ──────────────────────────────────────────────────────

    /// Fill every field, apply the scripted assignments, submit, and verify
    /// the site accepted the post.
    pub async fn process(
        &self,
        plan: &FormPlan,
        initial_url: &str,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        self.fill_form(plan, result).await?;
        self.submit(plan, initial_url, result).await?;
        result.body = Some("All done successfully".to_string());
        Ok(())
    }

    /// Fill every typed field and apply the scripted assignments, leaving
    /// the form ready to submit.
    pub async fn fill_form(
        &self,
        plan: &FormPlan,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        for entry in &plan.fields {
            self.fill_form_field(&entry.selector, &entry.description, &entry.value, result)
                .await?;
        }

        if !plan.scripted.is_empty() {
            let mut script = String::from("(function(){");
            for assignment in &plan.scripted {
                script.push_str(&format!(
                    "document.getElementsByName('{}')[0].value = '{}';",
                    js_escape(&assignment.element_name),
                    js_escape(&assignment.value)
                ));
            }
            script.push_str("})()");
            if let Err(e) = self.driver.evaluate(&script).await {
                result.record_error(&format!("Failed to set scripted form fields: {e}"));
                self.snapshot_body(result).await;
                return Err(TaskError::Browser(format!(
                    "scripted field assignment failed: {e}"
                )));
            }
        }

        result.advance_stage(Stage::FormFilled);
        Ok(())
    }

    /// Find, scroll to, click and type into one field at human cadence.
    pub async fn fill_form_field(
        &self,
        selector: &str,
        description: &str,
        value: &str,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        if !self.driver.is_visible(selector).await.unwrap_or(false) {
            result.record_error(&format!("{description} field is not visible"));
            self.snapshot_body(result).await;
            return Err(TaskError::Browser(format!(
                "{description} field is not visible"
            )));
        }

        if let Err(e) = self.driver.scroll_into_view(selector).await {
            result.record_error(&format!(
                "Failed to scroll and interact with {description} field: {e}"
            ));
            self.snapshot_body(result).await;
            return Err(TaskError::Browser(e.to_string()));
        }
        if let Err(e) = self.driver.click(selector).await {
            result.record_error(&format!("Failed to click {description} field: {e}"));
            self.snapshot_body(result).await;
            return Err(TaskError::Browser(e.to_string()));
        }

        for ch in value.chars() {
            let delay = rand::rng().random_range(
                self.tuning.typing_delay_from_ms..=self.tuning.typing_delay_to_ms.max(self.tuning.typing_delay_from_ms),
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Err(e) = self.driver.insert_text(&ch.to_string()).await {
                result.record_error(&format!("Failed to fill {description} field: {e}"));
                self.snapshot_body(result).await;
                return Err(TaskError::Browser(e.to_string()));
            }
        }

        Ok(())
    }

    /// Click the submit control and poll for the page to move off the form
    /// URL; a page still showing the rejection signature afterwards means
    /// the submission was refused and is worth a fresh attempt.
    pub async fn submit(
        &self,
        plan: &FormPlan,
        initial_url: &str,
        result: &mut TaskResult,
    ) -> Result<(), TaskError> {
        for _ in 0..self.tuning.submit_poll_attempts {
            let current = self
                .driver
                .current_url()
                .await
                .map_err(|e| TaskError::Browser(e.to_string()))?;
            if current != initial_url {
                break;
            }

            result.log("Clicking on the `Send` button");
            if let Err(e) = self.driver.click(&plan.submit_selector).await {
                result.log(&format!(
                    "Failed to click on the `Send` button on the page: {e}"
                ));
                self.snapshot_body(result).await;
                return Err(TaskError::Browser(e.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(self.tuning.submit_settle_ms)).await;
            self.wait_for_page_to_load(self.tuning.submit_load_timeout_ms, result)
                .await?;
        }

        let source = self
            .driver
            .page_source()
            .await
            .map_err(|e| TaskError::Browser(e.to_string()))?;
        if source.contains(&plan.rejection_signature) {
            return Err(TaskError::RetryableSubmission(
                "Failed to submit the form with provided data".to_string(),
            ));
        }
        Ok(())
    }

    async fn snapshot_body(&self, result: &mut TaskResult) {
        if let Ok(source) = self.driver.page_source().await {
            result.body = Some(source);
        }
    }
}
