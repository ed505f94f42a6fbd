//! Server configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

use agent_core::ToolEndpoint;
use agent_runtime::OllamaConfig;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Log,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tool_servers: Vec<ToolEndpoint>,
    pub session_backend: SessionBackend,
    pub session_dir: PathBuf,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub window_max_pairs: usize,
    pub tool_timeout: Duration,
    pub query_timeout: Duration,
    pub structured_output: bool,
    pub telemetry: TelemetryMode,
    pub ollama: OllamaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            tool_servers: Vec::new(),
            session_backend: SessionBackend::Memory,
            session_dir: PathBuf::from("data/sessions"),
            session_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            window_max_pairs: 10,
            tool_timeout: Duration::from_secs(15),
            query_timeout: Duration::from_secs(120),
            structured_output: true,
            telemetry: TelemetryMode::Log,
            ollama: OllamaConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `lookup`; unset keys keep their defaults, malformed ones fail
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let tool_servers = match get("TOOL_SERVERS") {
            Some(raw) => parse_tool_servers(&raw)?,
            None => defaults.tool_servers,
        };

        let session_backend = match get("SESSION_BACKEND").as_deref() {
            None | Some("memory") => SessionBackend::Memory,
            Some("file") => SessionBackend::File,
            Some(other) => return Err(ConfigError::invalid("SESSION_BACKEND", other, "expected memory or file")),
        };

        let telemetry = match get("TELEMETRY").as_deref() {
            None | Some("log") => TelemetryMode::Log,
            Some("off") => TelemetryMode::Off,
            Some(other) => return Err(ConfigError::invalid("TELEMETRY", other, "expected off or log")),
        };

        let structured_output = match get("STRUCTURED_OUTPUT") {
            Some(raw) => parse_bool("STRUCTURED_OUTPUT", &raw)?,
            None => defaults.structured_output,
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            tool_servers,
            session_backend,
            session_dir: get("SESSION_DIR").map_or(defaults.session_dir, PathBuf::from),
            session_ttl: parse_number(&get, "SESSION_TTL_MINUTES")?
                .map_or(defaults.session_ttl, |m| Duration::from_secs(m * 60)),
            sweep_interval: parse_number(&get, "SWEEP_INTERVAL_SECS")?
                .map_or(defaults.sweep_interval, Duration::from_secs),
            window_max_pairs: parse_number(&get, "WINDOW_MAX_PAIRS")?
                .map_or(defaults.window_max_pairs, |n| n as usize),
            tool_timeout: parse_number(&get, "TOOL_TIMEOUT_MS")?
                .map_or(defaults.tool_timeout, Duration::from_millis),
            query_timeout: parse_number(&get, "QUERY_TIMEOUT_MS")?
                .map_or(defaults.query_timeout, Duration::from_millis),
            structured_output,
            telemetry,
            ollama: OllamaConfig::from_lookup(&lookup),
        })
    }
}

fn parse_number(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) => Err(ConfigError::invalid(key, &raw, "must be greater than zero")),
            Ok(n) => Ok(Some(n)),
            Err(e) => Err(ConfigError::invalid(key, &raw, e.to_string())),
        },
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected true or false")),
    }
}

/// `id=url[!],id=url[!]`; a trailing `!` marks the server required
pub fn parse_tool_servers(raw: &str) -> Result<Vec<ToolEndpoint>, ConfigError> {
    let mut endpoints: Vec<ToolEndpoint> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, url) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::invalid("TOOL_SERVERS", entry, "expected id=url"))?;
        let id = id.trim();
        let (url, required) = match url.trim().strip_suffix('!') {
            Some(url) => (url.trim(), true),
            None => (url.trim(), false),
        };

        if id.is_empty() || id.contains("__") {
            return Err(ConfigError::invalid("TOOL_SERVERS", entry, "server id must be non-empty without '__'"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid("TOOL_SERVERS", entry, "url must be http(s)"));
        }
        if endpoints.iter().any(|e| e.id == id) {
            return Err(ConfigError::invalid("TOOL_SERVERS", entry, "duplicate server id"));
        }

        let endpoint = ToolEndpoint::new(id, url);
        endpoints.push(if required { endpoint.required() } else { endpoint });
    }

    Ok(endpoints)
}
