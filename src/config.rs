use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

use crate::event_log::DEFAULT_LOG_CAPACITY;
use crate::report::{DEFAULT_RECENT_LIMIT, DEFAULT_WINDOW};
use crate::scheduler::DEFAULT_REPORT_INTERVAL;
use crate::sink::{Collections, DEFAULT_DATABASE, DEFAULT_FIRESTORE_ENDPOINT};
use crate::stream::{StreamSettings, DEFAULT_SAMPLE_EVERY, DEFAULT_TARGET_FPS};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_STREAM_SOURCE: &str = "stub://front_bin";
const DEFAULT_IPIFY_URL: &str = "https://api.ipify.org";
const DEFAULT_HTTPBIN_URL: &str = "https://httpbin.org/ip";
const DEFAULT_IPAPI_URL: &str = "https://ipapi.co";
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const DEFAULT_USER_AGENT: &str = "overflow-monitor/0.3";
const DEFAULT_PUBLIC_IP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SINK_TIMEOUT_SECS: u64 = 10;
const MAX_WINDOW_SECS: u64 = 60 * 60 * 24;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "OVERFLOW_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    api_addr: Option<String>,
    log_capacity: Option<usize>,
    stream: Option<StreamConfigFile>,
    report: Option<ReportConfigFile>,
    location: Option<LocationConfigFile>,
    sink: Option<SinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    source: Option<String>,
    sample_every: Option<u32>,
    target_fps: Option<u32>,
    autostart: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReportConfigFile {
    window_secs: Option<u64>,
    interval_secs: Option<u64>,
    recent_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LocationConfigFile {
    ipify_url: Option<String>,
    httpbin_url: Option<String>,
    ipapi_url: Option<String>,
    nominatim_url: Option<String>,
    user_agent: Option<String>,
    public_ip_timeout_secs: Option<u64>,
    lookup_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SinkConfigFile {
    firestore_project: Option<String>,
    firestore_endpoint: Option<String>,
    firestore_database: Option<String>,
    api_key: Option<String>,
    access_token: Option<String>,
    timeout_secs: Option<u64>,
    local_db: Option<PathBuf>,
    detection_log_collection: Option<String>,
    report_collection: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_addr: String,
    pub log_capacity: usize,
    pub stream: StreamSettings,
    pub autostart: bool,
    pub report: ReportSettings,
    pub location: LocationSettings,
    pub sink: SinkSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub window: Duration,
    pub interval: Duration,
    pub recent_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSettings {
    pub ipify_url: String,
    pub httpbin_url: String,
    pub ipapi_url: String,
    pub nominatim_url: String,
    pub user_agent: String,
    pub public_ip_timeout: Duration,
    pub lookup_timeout: Duration,
}

#[derive(Clone)]
pub struct SinkSettings {
    pub firestore_project: Option<String>,
    pub firestore_endpoint: String,
    pub firestore_database: String,
    pub api_key: Option<Zeroizing<String>>,
    pub access_token: Option<Zeroizing<String>>,
    pub timeout: Duration,
    pub local_db: Option<PathBuf>,
    pub collections: Collections,
}

impl std::fmt::Debug for SinkSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSettings")
            .field("firestore_project", &self.firestore_project)
            .field("firestore_endpoint", &self.firestore_endpoint)
            .field("firestore_database", &self.firestore_database)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("local_db", &self.local_db)
            .field("collections", &self.collections)
            .finish()
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// File named by `OVERFLOW_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => MonitorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let report = file.report.unwrap_or_default();
        let location = file.location.unwrap_or_default();
        let sink = file.sink.unwrap_or_default();
        let default_collections = Collections::default();

        Self {
            api_addr: file
                .api_addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            log_capacity: file.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY),
            stream: StreamSettings {
                source: stream
                    .source
                    .unwrap_or_else(|| DEFAULT_STREAM_SOURCE.to_string()),
                sample_every: stream.sample_every.unwrap_or(DEFAULT_SAMPLE_EVERY),
                target_fps: stream.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            },
            autostart: stream.autostart.unwrap_or(false),
            report: ReportSettings {
                window: report
                    .window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_WINDOW),
                interval: report
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_REPORT_INTERVAL),
                recent_limit: report.recent_limit.unwrap_or(DEFAULT_RECENT_LIMIT),
            },
            location: LocationSettings {
                ipify_url: location
                    .ipify_url
                    .unwrap_or_else(|| DEFAULT_IPIFY_URL.to_string()),
                httpbin_url: location
                    .httpbin_url
                    .unwrap_or_else(|| DEFAULT_HTTPBIN_URL.to_string()),
                ipapi_url: location
                    .ipapi_url
                    .unwrap_or_else(|| DEFAULT_IPAPI_URL.to_string()),
                nominatim_url: location
                    .nominatim_url
                    .unwrap_or_else(|| DEFAULT_NOMINATIM_URL.to_string()),
                user_agent: location
                    .user_agent
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
                public_ip_timeout: Duration::from_secs(
                    location
                        .public_ip_timeout_secs
                        .unwrap_or(DEFAULT_PUBLIC_IP_TIMEOUT_SECS),
                ),
                lookup_timeout: Duration::from_secs(
                    location
                        .lookup_timeout_secs
                        .unwrap_or(DEFAULT_LOOKUP_TIMEOUT_SECS),
                ),
            },
            sink: SinkSettings {
                firestore_project: non_empty(sink.firestore_project),
                firestore_endpoint: sink
                    .firestore_endpoint
                    .unwrap_or_else(|| DEFAULT_FIRESTORE_ENDPOINT.to_string()),
                firestore_database: sink
                    .firestore_database
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                api_key: non_empty(sink.api_key).map(Zeroizing::new),
                access_token: non_empty(sink.access_token).map(Zeroizing::new),
                timeout: Duration::from_secs(sink.timeout_secs.unwrap_or(DEFAULT_SINK_TIMEOUT_SECS)),
                local_db: sink.local_db,
                collections: Collections {
                    detection_log: sink
                        .detection_log_collection
                        .unwrap_or(default_collections.detection_log),
                    report: sink
                        .report_collection
                        .unwrap_or(default_collections.report),
                },
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("OVERFLOW_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(source) = env_value("OVERFLOW_STREAM_SOURCE") {
            self.stream.source = source;
        }
        if let Some(every) = env_value("OVERFLOW_SAMPLE_EVERY") {
            self.stream.sample_every = every
                .parse()
                .map_err(|_| anyhow!("OVERFLOW_SAMPLE_EVERY must be a positive integer"))?;
        }
        if let Some(capacity) = env_value("OVERFLOW_LOG_CAPACITY") {
            self.log_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("OVERFLOW_LOG_CAPACITY must be a positive integer"))?;
        }
        if let Some(window) = env_value("OVERFLOW_WINDOW_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("OVERFLOW_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.report.window = Duration::from_secs(seconds);
        }
        if let Some(interval) = env_value("OVERFLOW_REPORT_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("OVERFLOW_REPORT_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.report.interval = Duration::from_secs(seconds);
        }
        if let Some(project) = env_value("OVERFLOW_FIRESTORE_PROJECT") {
            self.sink.firestore_project = Some(project);
        }
        if let Some(key) = env_value("OVERFLOW_FIRESTORE_API_KEY") {
            self.sink.api_key = Some(Zeroizing::new(key));
        }
        if let Some(token) = env_value("OVERFLOW_FIRESTORE_ACCESS_TOKEN") {
            self.sink.access_token = Some(Zeroizing::new(token));
        }
        if let Some(path) = env_value("OVERFLOW_LOCAL_DB") {
            self.sink.local_db = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api_addr must be a socket address (got '{}')", self.api_addr))?;
        if self.log_capacity == 0 {
            return Err(anyhow!("log_capacity must be greater than zero"));
        }
        if self.stream.sample_every == 0 {
            return Err(anyhow!("sample_every must be greater than zero"));
        }
        if self.stream.source.trim().is_empty() {
            return Err(anyhow!("stream source must not be empty"));
        }
        let window = self.report.window.as_secs();
        if window == 0 || window > MAX_WINDOW_SECS {
            return Err(anyhow!(
                "report window must be between 1 and {} seconds",
                MAX_WINDOW_SECS
            ));
        }
        if self.report.interval.is_zero() {
            return Err(anyhow!("report interval must be greater than zero"));
        }
        if self.report.recent_limit == 0 {
            return Err(anyhow!("recent_limit must be greater than zero"));
        }
        if self.location.public_ip_timeout.is_zero()
            || self.location.lookup_timeout.is_zero()
            || self.sink.timeout.is_zero()
        {
            return Err(anyhow!("network timeouts must be greater than zero"));
        }
        for (name, value) in [
            ("ipify_url", &self.location.ipify_url),
            ("httpbin_url", &self.location.httpbin_url),
            ("ipapi_url", &self.location.ipapi_url),
            ("nominatim_url", &self.location.nominatim_url),
            ("firestore_endpoint", &self.sink.firestore_endpoint),
        ] {
            validate_http_url(name, value)?;
        }
        for collection in [
            &self.sink.collections.detection_log,
            &self.sink.collections.report,
        ] {
            if collection.trim().is_empty() || collection.contains('/') {
                return Err(anyhow!("invalid collection name '{}'", collection));
            }
        }
        if self.sink.api_key.is_some() && self.sink.firestore_project.is_none() {
            log::warn!("firestore api key configured without a project; REST sink disabled");
        }
        Ok(())
    }

    pub fn aggregation(&self) -> crate::report::AggregationParams {
        crate::report::AggregationParams {
            window: self.report.window,
            recent_limit: self.report.recent_limit,
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn validate_http_url(name: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| anyhow!("{} is not a valid URL: {}", name, e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{} must use http or https (got {})", name, other)),
    }
}
