//! Environment-driven worker configuration.
//!
//! Every knob resolves from an env var with a sensible default so a worker
//! can start with nothing but `REDIS_HOST` and a browser on the PATH.
//! Settings are grouped by concern and threaded through the process inside
//! [`crate::core::WorkerContext`]; there are no global singletons.

use std::env;
use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "t" | "yes"),
        Err(_) => default,
    }
}

// ── General ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeneralSettings {
    /// Stable identity of this worker process, used in proxy-assignment
    /// requests and log lines. Defaults to a fresh UUID per start.
    pub worker_uid: String,
    /// Task-type discriminator this worker is allowed to process
    /// (e.g. `KGAI`). A job carrying any other type faults before the
    /// browser is touched.
    pub worker_type: String,
}

impl GeneralSettings {
    fn from_env() -> Self {
        Self {
            worker_uid: env_or("WORKER_UID", &uuid::Uuid::new_v4().to_string()),
            worker_type: env_or("WORKER_TYPE", "KGAI"),
        }
    }
}

// ── Shared store ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
}

impl RedisSettings {
    fn from_env() -> Self {
        Self {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: env_parse("REDIS_PORT", 6379),
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

// ── Proxy negotiation ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub protocol: String,
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Pool-variation tag forwarded to the assignment endpoint.
    pub variation: String,
    /// Base URL of the identity-assignment API.
    pub api_url: String,
    /// Page that echoes the apparent (proxied) address back through the
    /// browser, for audit logging.
    pub proxied_ip_url: String,
    /// Direct endpoint that echoes this host's unproxied address.
    pub unproxied_ip_url: String,
    /// External trust-probe page. The probe renders a decimal score which is
    /// rescaled to an integer 0–10.
    pub trust_probe_url: String,
    /// Worker-level override for the per-task minimum trust score;
    /// -1 means "use the task registry's default".
    pub min_trust_score: i32,
}

impl ProxySettings {
    fn from_env() -> Self {
        let api_url = env_or("PROXY_API_URL", "http://localhost:8080");
        Self {
            protocol: env_or("PROXY_PROTOCOL", "https"),
            hostname: env_or("PROXY_HOSTNAME", "us-pr.oxylabs.io"),
            username: env_or("PROXY_USERNAME", ""),
            password: env_or("PROXY_PASSWORD", ""),
            variation: env_or("PROXY_VARIATION", "INCLUSIVE"),
            proxied_ip_url: env_or("PROXIED_IP_SERVICE_URL", &format!("{api_url}/my_ip")),
            unproxied_ip_url: env_or("UNPROXIED_IP_SERVICE_URL", &format!("{api_url}/my_ip")),
            trust_probe_url: env_or("TRUST_PROBE_URL", "https://antcpt.com/score_detector/"),
            min_trust_score: env_parse("MIN_TRUST_SCORE", -1),
            api_url,
        }
    }
}

// ── Browser ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Explicit browser binary; when unset the PATH and well-known install
    /// locations are scanned.
    pub binary_path: Option<String>,
    pub headless: bool,
    pub incognito: bool,
    pub window_width: u32,
    pub window_height: u32,
}

impl BrowserSettings {
    fn from_env() -> Self {
        Self {
            binary_path: env_opt("CHROME_BROWSER_PATH"),
            headless: env_bool("CHROME_BROWSER_HEADLESS", false),
            incognito: env_bool("CHROME_BROWSER_INCOGNITO", false),
            window_width: env_parse("BROWSER_WINDOW_WIDTH", 1920),
            window_height: env_parse("BROWSER_WINDOW_HEIGHT", 1080),
        }
    }
}

// ── Cache / working directories ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub downloads_path: PathBuf,
    /// Per-session browser profile directories live under here; one UUID
    /// directory per session, removed at shutdown.
    pub data_path: PathBuf,
    pub disk_path: PathBuf,
}

impl CacheSettings {
    fn from_env() -> Self {
        let downloads = PathBuf::from(env_or("DOWNLOADS_PATH", "/var/tmp/cache"));
        Self {
            data_path: downloads.join(env_or("CACHE_DATA_PATH", ".data")),
            disk_path: downloads.join(env_or("CACHE_DISK_PATH", ".disk")),
            downloads_path: downloads,
        }
    }

    /// Create the working directories if missing. Errors out rather than
    /// limping along with a path the browser cannot write to.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.downloads_path, &self.data_path, &self.disk_path] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ── Speech-to-text ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TranscribeSettings {
    /// OpenAI-compatible base URL; point at a local endpoint for key-less
    /// operation.
    pub base_url: String,
    /// Never logged.
    pub api_key: Option<String>,
    pub model: String,
}

impl TranscribeSettings {
    fn from_env() -> Self {
        Self {
            base_url: env_or("TRANSCRIBE_BASE_URL", "https://api.openai.com/v1"),
            api_key: env_opt("TRANSCRIBE_API_KEY").or_else(|| env_opt("OPENAI_API_KEY")),
            model: env_or("TRANSCRIBE_MODEL", "whisper-1"),
        }
    }
}

// ── Aggregate ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    pub general: GeneralSettings,
    pub redis: RedisSettings,
    pub proxy: ProxySettings,
    pub browser: BrowserSettings,
    pub cache: CacheSettings,
    pub transcribe: TranscribeSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            general: GeneralSettings::from_env(),
            redis: RedisSettings::from_env(),
            proxy: ProxySettings::from_env(),
            browser: BrowserSettings::from_env(),
            cache: CacheSettings::from_env(),
            transcribe: TranscribeSettings::from_env(),
        }
    }
}
