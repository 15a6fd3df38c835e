//! CAPTCHA solving coordinator.
//!
//! The solver never screen-scrapes the audio link itself: an in-page agent
//! publishes it to the shared store under `audio_link_<origin>`, and this
//! side polls for the record, downloads and transcribes the asset, then
//! drives the widget purely through the keyboard. Frames are located by
//! explicit traversal of the frame tree, not by switch-and-hope. A missing
//! record is a soft miss (`Ok(false)`); the provider's hard-block page is a
//! distinct fatal error so the caller knows to rotate the proxy rather than
//! retry the challenge.

pub mod audio;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rand::RngExt;
use tracing::{info, warn};
use url::Url;

use crate::captcha::audio::TempArtifacts;
use crate::core::config::TranscribeSettings;
use crate::core::TaskError;
use crate::session::driver::{FrameNode, PageDriver};
use crate::store::KvStore;

/// Hard-block signature rendered by the challenge provider when the exit IP
/// is burned.
const HARD_BLOCK_SIGNATURE: &str = "rc-doscaptcha-header";

/// Three-field space-delimited record published by the in-page agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub audio_link: String,
    /// The audio widget variant with a download control needs one more tab
    /// to reach the verify button.
    pub has_download_button: bool,
}

impl ChallengeRecord {
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        if parts.len() != 3 || parts[0].is_empty() {
            return None;
        }
        Some(Self {
            audio_link: parts[0].to_string(),
            has_download_button: parts[1] == "True",
        })
    }
}

/// Store key the in-page agent and this solver rendezvous on: the page's
/// origin (scheme://host[:port]) prefixed with `audio_link_`.
pub fn origin_key(page_url: &str) -> Result<String> {
    let url = Url::parse(page_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("page URL has no host: {page_url}"))?;
    let origin = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    Ok(format!("audio_link_{origin}"))
}

fn continue_tab_count(has_download_button: bool) -> u32 {
    if has_download_button {
        5
    } else {
        4
    }
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// How long to wait for the challenge widget to appear after the form
    /// is filled, before deciding there is nothing to solve.
    pub widget_wait_timeout_ms: u64,
    pub widget_wait_poll_ms: u64,
    /// Settle time between clicking the checkbox and checking its state.
    pub post_click_delay_ms: u64,
    pub record_poll_attempts: u32,
    pub record_poll_interval_ms: u64,
    pub pre_paste_delay_ms: u64,
    pub pre_continue_delay_ms: u64,
    pub typing_delay_from_ms: u64,
    pub typing_delay_to_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            widget_wait_timeout_ms: 3_000,
            widget_wait_poll_ms: 250,
            post_click_delay_ms: 1_000,
            record_poll_attempts: 25,
            record_poll_interval_ms: 200,
            pre_paste_delay_ms: 400,
            pre_continue_delay_ms: 600,
            typing_delay_from_ms: 50,
            typing_delay_to_ms: 100,
        }
    }
}

pub struct CaptchaSolver<'a> {
    driver: &'a dyn PageDriver,
    store: &'a dyn KvStore,
    http: &'a reqwest::Client,
    transcribe: &'a TranscribeSettings,
    downloads_path: &'a Path,
    config: SolverConfig,
}

impl<'a> CaptchaSolver<'a> {
    pub fn new(
        driver: &'a dyn PageDriver,
        store: &'a dyn KvStore,
        http: &'a reqwest::Client,
        transcribe: &'a TranscribeSettings,
        downloads_path: &'a Path,
    ) -> Self {
        Self {
            driver,
            store,
            http,
            transcribe,
            downloads_path,
            config: SolverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Attempt one solve. `Ok(true)`: solved or no challenge present.
    /// `Ok(false)`: unsolved, the caller may retry the whole flow.
    /// `Err(IpBlocked)`: the provider hard-blocked this exit IP.
    pub async fn solve(&self) -> Result<bool, TaskError> {
        match self.solve_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if self.hard_block_visible().await {
                    Err(TaskError::IpBlocked)
                } else {
                    Err(TaskError::Browser(e.to_string()))
                }
            }
        }
    }

    async fn solve_inner(&self) -> Result<bool> {
        let tree = self.driver.frame_tree().await?;
        let Some(anchor_frame) = find_challenge_frame(&tree) else {
            info!("no challenge frame present, nothing to solve");
            return Ok(true);
        };

        if !self.click_checkbox(anchor_frame).await? {
            info!("challenge checkbox not found in frame, treating as absent");
            return Ok(true);
        }

        tokio::time::sleep(Duration::from_millis(self.config.post_click_delay_ms)).await;
        if self.is_checked(anchor_frame).await? {
            info!("checkbox auto-accepted, captcha solved");
            return Ok(true);
        }

        // Keyboard-only switch to the audio challenge.
        self.driver.press_key("Tab").await?;
        self.driver.press_key("Enter").await?;
        info!("switched challenge to audio mode");

        let key = origin_key(&self.driver.current_url().await?)?;
        let Some(record) = self.poll_record(&key).await? else {
            if self.hard_block_visible().await {
                return Err(TaskError::IpBlocked.into());
            }
            warn!("no challenge record appeared under {key}");
            return Ok(false);
        };

        let mut artifacts = TempArtifacts::new();
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mp3_path = artifacts.track(self.downloads_path.join(format!("audio_{token}.mp3")));
        let wav_path = artifacts.track(self.downloads_path.join(format!("audio_{token}.wav")));

        audio::download_audio(self.http, &record.audio_link, &mp3_path).await?;
        audio::transcode_to_wav(&mp3_path, &wav_path)?;
        let text = audio::speech_to_text(self.http, self.transcribe, &wav_path).await?;

        if !text.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.config.pre_paste_delay_ms)).await;
            self.driver.press_key("Tab").await?;
            self.type_at_human_cadence(&text).await?;
            info!("decoded audio text entered");
        }

        tokio::time::sleep(Duration::from_millis(self.config.pre_continue_delay_ms)).await;
        for _ in 0..continue_tab_count(record.has_download_button) {
            self.driver.press_key("Tab").await?;
        }
        self.driver.press_key("Enter").await?;
        info!("challenge response submitted");

        Ok(true)
    }

    async fn click_checkbox(&self, frame: &FrameNode) -> Result<bool> {
        let clicked = self
            .driver
            .evaluate_in_frame(
                &frame.id,
                "(function(){\
                   const el = document.getElementById('recaptcha-anchor');\
                   if (!el) return false;\
                   el.click();\
                   return true;\
                 })()",
            )
            .await?;
        Ok(clicked.as_bool().unwrap_or(false))
    }

    async fn is_checked(&self, frame: &FrameNode) -> Result<bool> {
        let checked = self
            .driver
            .evaluate_in_frame(
                &frame.id,
                "document.querySelector('.recaptcha-checkbox-checked') !== null",
            )
            .await?;
        Ok(checked.as_bool().unwrap_or(false))
    }

    /// Bounded poll for the in-page agent's record. The record is consumed
    /// on first read.
    async fn poll_record(&self, key: &str) -> Result<Option<ChallengeRecord>> {
        for _ in 0..self.config.record_poll_attempts {
            match self.store.get(key).await {
                Ok(Some(raw)) => {
                    let record = ChallengeRecord::parse(&raw);
                    if record.is_none() {
                        warn!("malformed challenge record under {key}: {raw}");
                    }
                    if let Err(e) = self.store.delete(key).await {
                        warn!("failed to consume challenge record {key}: {e}");
                    }
                    return Ok(record);
                }
                Ok(None) => {}
                Err(e) => warn!("error reading challenge record, retrying: {e}"),
            }
            tokio::time::sleep(Duration::from_millis(self.config.record_poll_interval_ms)).await;
        }
        Ok(None)
    }

    async fn type_at_human_cadence(&self, text: &str) -> Result<()> {
        for ch in text.chars() {
            let delay = rand::rng().random_range(
                self.config.typing_delay_from_ms
                    ..=self.config.typing_delay_to_ms.max(self.config.typing_delay_from_ms),
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.driver.insert_text(&ch.to_string()).await?;
        }
        Ok(())
    }

    async fn hard_block_visible(&self) -> bool {
        self.driver
            .page_source()
            .await
            .map(|source| source.contains(HARD_BLOCK_SIGNATURE))
            .unwrap_or(false)
    }
}

/// The challenge widget's interactive checkbox lives in the provider's
/// anchor frame; find it by URL anywhere in the tree.
pub fn find_challenge_frame(tree: &FrameNode) -> Option<&FrameNode> {
    tree.find_by_url_fragment("recaptcha")
        .filter(|frame| frame.url.contains("anchor"))
        .or_else(|| tree.find_by_url_fragment("/recaptcha/api2/anchor"))
}

/// Probe used before solving: does the page show a challenge widget at all?
pub async fn captcha_is_visible_on_page(
    driver: &dyn PageDriver,
    timeout_ms: u64,
    poll_ms: u64,
) -> Result<bool> {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let tree = driver.frame_tree().await?;
        if find_challenge_frame(&tree).is_some() {
            return Ok(true);
        }
        if std::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
}
