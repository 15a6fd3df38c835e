//! Supervising worker loop.
//!
//! One process serves one task type. Every job gets its own browser session:
//! launch, tear-up, process, tear-down, close, profile removal. A fatal job
//! outcome never kills the process; the corrupt session is discarded and the
//! next iteration starts from a fresh launch.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::core::{TaskError, TaskResult, WorkerContext};
use crate::jobs::registry::{find_definition, TaskDefinition};
use crate::jobs::{JobExecutor, JobOutcome, JobQueue, PrepareOutcome};
use crate::proxy::{mask_proxy_credentials, NegotiatorConfig, ProxyNegotiator};
use crate::session::driver::PageDriver;
use crate::session::{launch_session, remove_user_data_dir, PageSetupConfig, SessionController};

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    ctx: WorkerContext,
    queue: JobQueue,
    definition: &'static TaskDefinition,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Result<Self> {
        let definition = find_definition(ctx.worker_type())
            .with_context(|| format!("unknown worker type `{}`", ctx.worker_type()))?;
        let queue = JobQueue::new(ctx.store.clone(), definition.queue);
        Ok(Self {
            ctx,
            queue,
            definition,
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "worker {} serving `{}` jobs from queue `{}`",
            self.ctx.settings.general.worker_uid,
            self.definition.kind,
            self.queue.name()
        );

        loop {
            let job = match self.queue.dequeue(DEQUEUE_TIMEOUT).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!("queue read failed, backing off: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if let Err(e) = self.handle_job(job).await {
                error!("session fault, rebuilding for the next job: {e}");
            }
        }
    }

    async fn handle_job(&self, job: crate::jobs::JobEnvelope) -> Result<()> {
        let executor = JobExecutor::new(&self.ctx);
        let prepared = match executor.prepare(job).await {
            PrepareOutcome::Done(outcome) => return self.settle(outcome).await,
            PrepareOutcome::Ready(prepared) => prepared,
        };

        let proxy_arg = ProxyNegotiator::proxy_server_arg(&self.ctx.settings.proxy);
        if let Some(arg) = &proxy_arg {
            info!("session proxy: {}", mask_proxy_credentials(arg));
        }
        // A launch fault must still end the job in a published outcome; the
        // dequeued envelope would otherwise vanish without a result record.
        let (driver, user_data_dir) = match launch_session(
            &self.ctx.settings.browser,
            &self.ctx.settings.cache,
            proxy_arg.as_deref(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                let outcome = executor
                    .fail(
                        *prepared,
                        TaskError::Browser(format!("browser launch failed: {e}")),
                    )
                    .await;
                self.settle(outcome).await?;
                return Err(e);
            }
        };
        if let Err(e) = driver.clear_cookies().await {
            warn!("failed to clear cookies after launch: {e}");
        }

        let negotiator = ProxyNegotiator::new(
            self.ctx.settings.proxy.clone(),
            self.ctx.settings.general.worker_uid.clone(),
            self.ctx.http.clone(),
            NegotiatorConfig::default(),
        );

        let outcome = executor.run(*prepared, &driver, &negotiator).await;

        // A fatal outcome means the session is suspect; skip tear-down and
        // discard it outright.
        if !matches!(outcome, JobOutcome::Fatal { .. }) {
            let controller = SessionController::new(&driver, &negotiator);
            let mut setup =
                PageSetupConfig::new(self.definition.page_url, self.definition.anchor_selector);
            setup.trust_threshold = self.ctx.min_trust_score(setup.trust_threshold);
            let mut scratch = TaskResult::new();
            if let Err(e) = controller.teardown(&setup, &mut scratch).await {
                warn!("teardown failed: {e}");
            }
        }

        if let Err(e) = driver.close().await {
            warn!("browser close failed: {e}");
        }
        remove_user_data_dir(&user_data_dir);

        self.settle(outcome).await
    }

    async fn settle(&self, outcome: JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Completed(result) => {
                info!("job finished at stage {:?}", result.stage);
                Ok(())
            }
            JobOutcome::Retry { job, delay_secs } => {
                self.queue.requeue_with_delay(&job, delay_secs).await
            }
            JobOutcome::Fatal { error, .. } => {
                error!("job failed fatally: {error}");
                Ok(())
            }
        }
    }
}
