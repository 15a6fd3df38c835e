//! Browser control seam.
//!
//! Everything above this module talks to the page through [`PageDriver`];
//! only [`CdpDriver`] knows about the DevTools protocol. Session, proxy and
//! CAPTCHA logic are exercised in tests against a scripted fake.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    BlockPattern, ClearBrowserCookiesParams, DeleteCookiesParams, EnableParams,
    SetBlockedUrLsParams,
};
use chromiumoxide::cdp::browser_protocol::page::{CreateIsolatedWorldParams, GetFrameTreeParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::{Browser, Page};
use tokio::task::JoinHandle;
use tracing::warn;

/// One node of the page's frame tree, captured explicitly so challenge
/// widgets nested in iframes can be located by URL instead of by guessing
/// switch indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNode {
    pub id: String,
    pub url: String,
    pub children: Vec<FrameNode>,
}

impl FrameNode {
    /// Depth-first search for the first frame whose URL contains `fragment`.
    pub fn find_by_url_fragment(&self, fragment: &str) -> Option<&FrameNode> {
        if self.url.contains(fragment) {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find_by_url_fragment(fragment))
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    async fn page_source(&self) -> Result<String>;
    async fn ready_state(&self) -> Result<String>;

    /// Evaluate JS in the main frame, returning the JSON value it produced.
    async fn evaluate(&self, js: &str) -> Result<serde_json::Value>;

    async fn is_visible(&self, selector: &str) -> Result<bool>;
    async fn scroll_into_view(&self, selector: &str) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;

    /// Insert text at the current focus, one chunk per call; cadence is the
    /// caller's concern.
    async fn insert_text(&self, text: &str) -> Result<()>;

    /// Dispatch a raw key (e.g. "Tab", "Enter") to whatever holds focus.
    async fn press_key(&self, key: &str) -> Result<()>;

    async fn set_blocked_urls(&self, urls: &[String]) -> Result<()>;
    async fn delete_cookie(&self, name: &str) -> Result<()>;
    async fn clear_cookies(&self) -> Result<()>;

    async fn frame_tree(&self) -> Result<FrameNode>;

    /// Evaluate JS inside a specific frame (isolated world, so it works for
    /// cross-origin challenge frames too).
    async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<serde_json::Value>;

    /// Close the underlying browser session.
    async fn close(&self) -> Result<()>;
}

// ── CDP implementation ───────────────────────────────────────────────────────

pub struct CdpDriver {
    page: Page,
    browser: tokio::sync::Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl CdpDriver {
    pub fn new(browser: Browser, page: Page, handler: JoinHandle<()>) -> Self {
        Self {
            page,
            browser: tokio::sync::Mutex::new(browser),
            handler,
        }
    }

    fn visibility_probe(selector: &str) -> String {
        let escaped = selector.replace('\\', "\\\\").replace('\'', "\\'");
        format!(
            "(function() {{\
               const el = document.querySelector('{escaped}');\
               if (!el) return false;\
               const style = window.getComputedStyle(el);\
               if (style.display === 'none' || style.visibility === 'hidden') return false;\
               const rect = el.getBoundingClientRect();\
               return rect.width > 0 && rect.height > 0;\
             }})()"
        )
    }

    fn key_code(key: &str) -> i64 {
        match key {
            "Tab" => 9,
            "Enter" => 13,
            "Escape" => 27,
            _ => 0,
        }
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.evaluate("window.location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("location.href did not evaluate to a string"))
    }

    async fn page_source(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn ready_state(&self) -> Result<String> {
        let value = self.evaluate("document.readyState").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn evaluate(&self, js: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(js).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        let value = self.evaluate(&Self::visibility_probe(selector)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("element `{selector}` not found"))?;
        element.scroll_into_view().await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("element `{selector}` not found"))?;
        element.click().await?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .context("Input.insertText failed")?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let code = Self::key_code(key);
        for event_type in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let params = DispatchKeyEventParams::builder()
                .r#type(event_type)
                .key(key)
                .code(key)
                .windows_virtual_key_code(code)
                .native_virtual_key_code(code)
                .build()
                .map_err(|e| anyhow!("key event build failed: {e}"))?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    async fn set_blocked_urls(&self, urls: &[String]) -> Result<()> {
        self.page.execute(EnableParams::default()).await?;
        let patterns: Vec<BlockPattern> = urls
            .iter()
            .map(|url| BlockPattern::new(url.clone(), true))
            .collect();
        let params = SetBlockedUrLsParams::builder()
            .url_patterns(patterns)
            .build();
        self.page
            .execute(params)
            .await
            .context("Network.setBlockedURLs failed")?;
        Ok(())
    }

    async fn delete_cookie(&self, name: &str) -> Result<()> {
        self.page.execute(DeleteCookiesParams::new(name)).await?;
        Ok(())
    }

    async fn clear_cookies(&self) -> Result<()> {
        self.page
            .execute(ClearBrowserCookiesParams::default())
            .await?;
        Ok(())
    }

    async fn frame_tree(&self) -> Result<FrameNode> {
        fn convert(tree: &chromiumoxide::cdp::browser_protocol::page::FrameTree) -> FrameNode {
            FrameNode {
                id: tree.frame.id.inner().clone(),
                url: tree.frame.url.clone(),
                children: tree
                    .child_frames
                    .iter()
                    .flatten()
                    .map(convert)
                    .collect(),
            }
        }

        let response = self.page.execute(GetFrameTreeParams::default()).await?;
        Ok(convert(&response.frame_tree))
    }

    async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<serde_json::Value> {
        let world = self
            .page
            .execute(
                CreateIsolatedWorldParams::builder()
                    .frame_id(frame_id.to_string())
                    .build()
                    .map_err(|e| anyhow!("isolated world build failed: {e}"))?,
            )
            .await
            .context("Page.createIsolatedWorld failed")?;

        let eval = self
            .page
            .execute(
                EvaluateParams::builder()
                    .expression(js)
                    .context_id(world.execution_context_id.clone())
                    .return_by_value(true)
                    .build()
                    .map_err(|e| anyhow!("frame evaluate build failed: {e}"))?,
            )
            .await
            .context("Runtime.evaluate in frame failed")?;

        if let Some(exception) = &eval.exception_details {
            return Err(anyhow!("frame script threw: {}", exception.text));
        }
        // `execute` wraps EvaluateReturns in a CommandResponse whose own
        // `result` field shadows the Deref target.
        Ok(eval
            .result
            .result
            .value
            .clone()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!("browser close reported: {e}");
        }
        self.handler.abort();
        Ok(())
    }
}

// ── Scripted fake for tests ──────────────────────────────────────────────────

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Deterministic in-memory driver. Tests script it up front and assert
    /// on the recorded action log afterwards.
    #[derive(Default)]
    pub struct FakeDriver {
        pub state: Mutex<FakeState>,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub url: String,
        pub page_source: String,
        pub ready_state: String,
        pub visible: Vec<String>,
        /// Queued answers per main-frame script fragment; first matching
        /// fragment wins, consumed front to back.
        pub eval_answers: HashMap<String, VecDeque<serde_json::Value>>,
        /// Same, keyed by (frame id, script fragment).
        pub frame_eval_answers: HashMap<(String, String), VecDeque<serde_json::Value>>,
        pub frame_tree: Option<FrameNode>,
        pub actions: Vec<String>,
        /// Selectors whose click should fail.
        pub broken: Vec<String>,
        /// URL the page jumps to after the nth recorded click on the submit
        /// control, simulating a successful form post.
        pub url_after_submit: Option<String>,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            let driver = Self::default();
            {
                let mut state = driver.state.lock().unwrap();
                state.ready_state = "complete".to_string();
            }
            driver
        }

        pub fn record(&self, action: String) {
            self.state.lock().unwrap().actions.push(action);
        }

        pub fn actions(&self) -> Vec<String> {
            self.state.lock().unwrap().actions.clone()
        }
    }

    #[async_trait]
    impl PageDriver for FakeDriver {
        async fn goto(&self, url: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.url = url.to_string();
            state.actions.push(format!("goto {url}"));
            Ok(())
        }

        async fn current_url(&self) -> Result<String> {
            Ok(self.state.lock().unwrap().url.clone())
        }

        async fn page_source(&self) -> Result<String> {
            Ok(self.state.lock().unwrap().page_source.clone())
        }

        async fn ready_state(&self) -> Result<String> {
            Ok(self.state.lock().unwrap().ready_state.clone())
        }

        async fn evaluate(&self, js: &str) -> Result<serde_json::Value> {
            let mut state = self.state.lock().unwrap();
            for (fragment, answers) in state.eval_answers.iter_mut() {
                if js.contains(fragment.as_str()) {
                    if let Some(answer) = answers.pop_front() {
                        return Ok(answer);
                    }
                }
            }
            Ok(serde_json::Value::Null)
        }

        async fn is_visible(&self, selector: &str) -> Result<bool> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .visible
                .iter()
                .any(|s| s == selector))
        }

        async fn scroll_into_view(&self, selector: &str) -> Result<()> {
            self.record(format!("scroll {selector}"));
            Ok(())
        }

        async fn click(&self, selector: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.broken.iter().any(|s| s == selector) {
                return Err(anyhow!("element `{selector}` not found"));
            }
            state.actions.push(format!("click {selector}"));
            if let Some(next_url) = state.url_after_submit.clone() {
                if selector == "#Send" {
                    state.url = next_url;
                }
            }
            Ok(())
        }

        async fn insert_text(&self, text: &str) -> Result<()> {
            self.record(format!("type {text}"));
            Ok(())
        }

        async fn press_key(&self, key: &str) -> Result<()> {
            self.record(format!("key {key}"));
            Ok(())
        }

        async fn set_blocked_urls(&self, urls: &[String]) -> Result<()> {
            self.record(format!("block {}", urls.len()));
            Ok(())
        }

        async fn delete_cookie(&self, name: &str) -> Result<()> {
            self.record(format!("delete-cookie {name}"));
            Ok(())
        }

        async fn clear_cookies(&self) -> Result<()> {
            self.record("clear-cookies".to_string());
            Ok(())
        }

        async fn frame_tree(&self) -> Result<FrameNode> {
            let state = self.state.lock().unwrap();
            Ok(state.frame_tree.clone().unwrap_or_else(|| FrameNode {
                id: "root".to_string(),
                url: state.url.clone(),
                children: Vec::new(),
            }))
        }

        async fn evaluate_in_frame(
            &self,
            frame_id: &str,
            js: &str,
        ) -> Result<serde_json::Value> {
            let mut state = self.state.lock().unwrap();
            let keys: Vec<(String, String)> =
                state.frame_eval_answers.keys().cloned().collect();
            for key in keys {
                if key.0 == frame_id && js.contains(key.1.as_str()) {
                    if let Some(answers) = state.frame_eval_answers.get_mut(&key) {
                        if let Some(answer) = answers.pop_front() {
                            return Ok(answer);
                        }
                    }
                }
            }
            Ok(serde_json::Value::Null)
        }

        async fn close(&self) -> Result<()> {
            self.record("close".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn scripted_eval_answers_are_consumed_in_order() {
        let driver = FakeDriver::new();
        driver
            .state
            .lock()
            .unwrap()
            .eval_answers
            .entry("readyState".to_string())
            .or_default()
            .extend([
                serde_json::Value::String("loading".into()),
                serde_json::Value::String("complete".into()),
            ]);

        let first = driver.evaluate("document.readyState").await.unwrap();
        let second = driver.evaluate("document.readyState").await.unwrap();
        assert_eq!(first, "loading");
        assert_eq!(second, "complete");
        // Unscripted expressions read as null.
        assert!(driver.evaluate("window.location.href").await.unwrap().is_null());
    }

    #[tokio::test]
    async fn frame_search_is_depth_first() {
        let tree = FrameNode {
            id: "root".into(),
            url: "https://example.com/form".into(),
            children: vec![FrameNode {
                id: "child".into(),
                url: "https://challenge.example/anchor".into(),
                children: vec![FrameNode {
                    id: "grandchild".into(),
                    url: "https://challenge.example/bframe".into(),
                    children: vec![],
                }],
            }],
        };
        assert_eq!(tree.find_by_url_fragment("anchor").unwrap().id, "child");
        assert_eq!(
            tree.find_by_url_fragment("bframe").unwrap().id,
            "grandchild"
        );
        assert!(tree.find_by_url_fragment("missing").is_none());
    }
}
