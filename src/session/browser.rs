//! Browser process bring-up for one worker session.
//!
//! Each session gets its own user-data directory (a UUID under the cache
//! data path) so profiles never bleed between jobs; the directory is removed
//! at shutdown. Flags follow the same stealth/CI-compat set used elsewhere
//! in the fleet, plus an optional `--proxy-server` pointing at the
//! negotiated identity.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::StreamExt;
use rand::seq::IndexedRandom;
use tracing::{error, info, warn};

use crate::core::config::{BrowserSettings, CacheSettings};
use crate::session::driver::CdpDriver;

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Find a usable Chromium-family browser executable.
///
/// Resolution order: explicit settings path, PATH scan, well-known install
/// locations.
pub fn find_chrome_executable(settings: &BrowserSettings) -> Option<String> {
    if let Some(p) = &settings.binary_path {
        if Path::new(p).exists() {
            return Some(p.clone());
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/brave-browser",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

fn build_session_config(
    exe: &str,
    settings: &BrowserSettings,
    user_data_dir: &Path,
    disk_cache_dir: &Path,
    proxy_url: Option<&str>,
) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: settings.window_width,
            height: settings.window_height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(settings.window_width, settings.window_height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--disable-crash-reporter")
        .arg("--disable-breakpad")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={ua}"))
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .arg(format!("--disk-cache-dir={}", disk_cache_dir.display()));

    if !settings.headless {
        builder = builder.with_head();
    }
    if settings.incognito {
        builder = builder.arg("--incognito");
    }
    if let Some(proxy) = proxy_url {
        builder = builder.arg(format!("--proxy-server={proxy}"));
    }

    builder
        .build()
        .map_err(|e| anyhow!("browser config build failed: {e}"))
}

/// Launch a fresh browser and return a driver bound to a blank page, plus
/// the session's user-data directory for later removal.
pub async fn launch_session(
    settings: &BrowserSettings,
    cache: &CacheSettings,
    proxy_url: Option<&str>,
) -> Result<(CdpDriver, PathBuf)> {
    let exe = find_chrome_executable(settings).ok_or_else(|| {
        anyhow!("no browser executable found; set CHROME_BROWSER_PATH or install Chromium")
    })?;

    cache.ensure_dirs()?;
    let user_data_dir = cache.data_path.join(uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&user_data_dir)?;

    let config = build_session_config(&exe, settings, &user_data_dir, &cache.disk_path, proxy_url)?;

    info!(browser = %exe, "launching browser session");
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("browser launch failed ({exe}): {e}"))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                error!("CDP handler error: {e}");
            }
        }
    });

    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| anyhow!("failed to open initial page: {e}"))?;

    Ok((CdpDriver::new(browser, page, handle), user_data_dir))
}

/// Remove a session's user-data directory. Failure is logged, not raised;
/// stale profiles are garbage, not corruption.
pub fn remove_user_data_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), "failed to remove user-data dir: {e}");
    }
}
