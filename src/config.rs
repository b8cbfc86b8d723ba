//! Configuration loaded from `<config_dir>/spotils/config.json`.
//!
//! Every field has a default, so an empty or partial file is valid. Intervals
//! are human strings such as `"1h 30m"` or `"2 days"`.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Deserializer};

pub const APP_NAME: &str = "spotils";

const DEFAULT_CLIENT_ID: &str = "492e1e45ea814fa3ac555fe1576aaf5b";
const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8898/login";

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^((?P<weeks>\d+) ?(weeks|week|W|w) ?)?",
        r"((?P<days>\d+) ?(days|day|D|d) ?)?",
        r"((?P<hours>\d+) ?(hours|hour|H|h) ?)?",
        r"((?P<minutes>\d+) ?(minutes|minute|M|m) ?)?",
        r"((?P<seconds>\d+) ?(seconds|second|S|s))?$",
    ))
    .expect("duration regex is valid")
});

/// Parse an interval like `"1w 2d"`, `"90m"` or `"1 hour 30 minutes"`.
///
/// Units must appear in descending order of magnitude.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let input = input.trim();
    let captures = DURATION_REGEX
        .captures(input)
        .filter(|_| !input.is_empty())
        .ok_or_else(|| anyhow!("Invalid interval: {input:?}"))?;

    let mut seconds = 0u64;
    for (unit, scale) in [
        ("weeks", 7 * 24 * 3600),
        ("days", 24 * 3600),
        ("hours", 3600),
        ("minutes", 60),
        ("seconds", 1),
    ] {
        if let Some(amount) = captures.name(unit) {
            let amount: u64 = amount.as_str().parse()?;
            seconds += amount * scale;
        }
    }

    if seconds == 0 {
        return Err(anyhow!("Interval must be positive: {input:?}"));
    }
    Ok(Duration::from_secs(seconds))
}

fn interval<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_interval(&raw).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub redirect_uri: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Items requested per listing page (Spotify allows up to 50)
    pub page_size: u32,
    /// URIs per mutating request (Spotify allows up to 100)
    pub max_batch: usize,
    pub max_concurrent_requests: usize,
    #[serde(deserialize_with = "interval")]
    pub cycle_deadline: Duration,
    /// Ceiling for the failure backoff of the scheduling interval
    #[serde(deserialize_with = "interval")]
    pub max_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_batch: 100,
            max_concurrent_requests: 4,
            cycle_deadline: Duration::from_secs(10 * 60),
            max_interval: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Lifetime of responses that carry no `Cache-Control`
    pub default_ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 0,
            max_entries: 10_000,
        }
    }
}

/// Collection mirrored by a job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    LikedSongs,
    Playlist(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "liked_songs")]
    pub source: SourceConfig,
    pub target_playlist_id: String,
    #[serde(deserialize_with = "interval")]
    pub interval: Duration,
    /// Also make the target follow the source's order
    #[serde(default)]
    pub reorder: bool,
    /// Without a snapshot, treat the target's current tracks as the local state
    #[serde(default = "enabled")]
    pub seed_from_target: bool,
}

fn enabled() -> bool {
    true
}

fn liked_songs() -> SourceConfig {
    SourceConfig::LikedSongs
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "interval")]
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Skip the current track when it is already liked and playing outside
/// Liked Songs
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkipLikedConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "interval")]
    pub interval: Duration,
}

impl Default for SkipLikedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spotify: SpotifyConfig,
    pub sync: SyncSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub jobs: Vec<JobConfig>,
    pub cleanup: CleanupConfig,
    pub skip_liked: SkipLikedConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=50).contains(&self.sync.page_size) {
            return Err(anyhow!("sync.page_size must be between 1 and 50"));
        }
        if !(1..=100).contains(&self.sync.max_batch) {
            return Err(anyhow!("sync.max_batch must be between 1 and 100"));
        }
        if self.sync.max_concurrent_requests == 0 {
            return Err(anyhow!("sync.max_concurrent_requests must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(anyhow!("cache.max_entries must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be positive"));
        }
        let mut names = std::collections::HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(anyhow!("duplicate job name {:?}", job.name));
            }
            if job.name.is_empty() || job.name.contains(['/', '\\']) {
                return Err(anyhow!("invalid job name {:?}", job.name));
            }
        }
        Ok(())
    }

    /// Apply `SPOTILS_*` environment overrides for credentials.
    fn apply_env(&mut self) {
        if let Ok(client_id) = std::env::var("SPOTILS_CLIENT_ID") {
            self.spotify.client_id = client_id;
        }
        if let Ok(redirect_uri) = std::env::var("SPOTILS_REDIRECT_URI") {
            self.spotify.redirect_uri = redirect_uri;
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

/// Platform locations used by the application
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn platform() -> Result<Self> {
        let config_dir = dirs::config_dir().context("no config directory on this platform")?;
        let data_dir = dirs::data_dir().context("no data directory on this platform")?;
        let cache_dir = dirs::cache_dir().context("no cache directory on this platform")?;
        Ok(Self {
            config_file: config_dir.join(APP_NAME).join("config.json"),
            data_dir: data_dir.join(APP_NAME),
            cache_dir: cache_dir.join(APP_NAME),
        })
    }

    #[cfg(test)]
    pub fn rooted(root: &std::path::Path) -> Self {
        Self {
            config_file: root.join("config.json"),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn snapshot_file(&self, job: &str) -> PathBuf {
        self.data_dir.join("snapshots").join(format!("{job}.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn refresh_token_file(&self) -> PathBuf {
        self.data_dir.join("refresh_token")
    }

    pub fn http_cache_file(&self) -> PathBuf {
        self.cache_dir.join("http-cache.json")
    }
}

/// Read the user config, creating an empty one on first run.
pub fn load(paths: &AppPaths) -> Result<Config> {
    let mut config = match std::fs::read_to_string(&paths.config_file) {
        Ok(raw) => Config::from_json(&raw)
            .with_context(|| format!("invalid config file {}", paths.config_file.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = paths.config_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&paths.config_file, "{}")?;
            tracing::info!(path = %paths.config_file.display(), "Created empty config file");
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };
    config.apply_env();
    Ok(config)
}
