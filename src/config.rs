use std::path::PathBuf;

/// Sync worker configuration (api_base_url, timeouts, retry policy, app_version)
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    /// Per-request timeout; a hung connection is an ordinary retryable failure.
    pub http_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
    /// Background loop tick.
    pub interval_secs: u64,
    /// Delay before the first background pass (plus 1-3s jitter).
    pub startup_delay_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// How long a second `sync_now` waits for the in-flight pass.
    pub join_timeout_secs: u64,
    /// No new task starts once a pass has run this long.
    pub pass_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://app.automatonsoft.de/api".to_string(),
            http_timeout_secs: 120,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            interval_secs: 60,
            startup_delay_secs: 10,
            max_retries: 5,
            backoff_base_secs: 10,
            backoff_cap_secs: 120,
            join_timeout_secs: 30,
            pass_timeout_secs: 300,
        }
    }
}

/// Top-level configuration for the tracker core.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
    /// Periodic flush of the running session (heartbeat for crash recovery).
    pub save_interval_secs: u64,
    /// Wall vs monotonic gap treated as a system sleep.
    pub sleep_gap_threshold_secs: u64,
    /// Idle seconds after which a running timer is paused.
    pub idle_threshold_secs: u64,
    pub queue_capacity: usize,
    pub dedup_window_secs: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync: SyncConfig::default(),
            save_interval_secs: 30,
            sleep_gap_threshold_secs: 5 * 60,
            idle_threshold_secs: 2 * 60,
            queue_capacity: 10_000,
            dedup_window_secs: 5,
        }
    }
}

impl TrackerConfig {
    /// Defaults overridden by `TIMELEDGER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("TIMELEDGER_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("TIMELEDGER_API_URL") {
            if !url.is_empty() {
                config.sync.api_base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Some(secs) = env_u64("TIMELEDGER_HTTP_TIMEOUT_SECS") {
            config.sync.http_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("TIMELEDGER_SYNC_INTERVAL_SECS") {
            config.sync.interval_secs = secs.max(1);
        }
        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("timeledger.db")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".timeledger")
}
