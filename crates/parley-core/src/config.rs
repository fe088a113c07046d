//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{InputAudioTranscription, SessionConfiguration, TurnDetection};
use crate::types::{Endpoint, Modality};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub session: SessionDefaults,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Extra handshake headers, sent after the auth headers.
    pub headers: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            headers: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// How long the post-handshake ping may wait for its pong.
    pub liveness_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            liveness_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Largest `input_audio_buffer.append` payload, in raw PCM bytes.
    pub chunk_bytes: usize,
    /// Cap on audio held locally while disconnected.
    pub max_buffer_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::protocol::DEFAULT_SAMPLE_RATE,
            chunk_bytes: 4_800,
            max_buffer_bytes: 1024 * 1024,
        }
    }
}

/// Defaults applied to the first `session.update` of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub voice: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    pub modalities: Vec<Modality>,

    /// `null` disables server-side turn detection.
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,

    /// Model used to transcribe user speech (e.g. "whisper-1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        let base = SessionConfiguration::default();
        Self {
            voice: base.voice.unwrap_or_else(|| "alloy".into()),
            instructions: None,
            modalities: base.modalities,
            turn_detection: base.turn_detection,
            temperature: base.temperature,
            max_response_output_tokens: None,
            transcription_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_ms: u64,
    pub history_capacity: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            history_capacity: 100,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_transport=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted).map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file location: `~/.parley/config.json5`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    /// Expand `~` in a user-supplied config path.
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    /// Connection endpoint with auth and protocol headers.
    pub fn endpoint(&self) -> Endpoint {
        let conn = &self.connection;
        let url = if conn.model.is_empty() || conn.url.contains("model=") {
            conn.url.clone()
        } else {
            let sep = if conn.url.contains('?') { '&' } else { '?' };
            format!("{}{sep}model={}", conn.url, conn.model)
        };

        let mut endpoint = Endpoint::new(url);
        if let Some(key) = conn.resolve_api_key() {
            endpoint = endpoint.with_header("Authorization", format!("Bearer {key}"));
        }
        endpoint = endpoint.with_header("OpenAI-Beta", "realtime=v1");
        for (name, value) in &conn.headers {
            endpoint = endpoint.with_header(name.clone(), value.clone());
        }
        endpoint
    }

    /// Initial session configuration built from the `session` section.
    pub fn session_configuration(&self) -> SessionConfiguration {
        let defaults = &self.session;
        SessionConfiguration {
            model: Some(self.connection.model.clone()).filter(|m| !m.is_empty()),
            voice: Some(defaults.voice.clone()),
            instructions: defaults.instructions.clone(),
            turn_detection: defaults.turn_detection.clone(),
            modalities: defaults.modalities.clone(),
            input_audio_transcription: defaults
                .transcription_model
                .clone()
                .map(|model| InputAudioTranscription { model }),
            temperature: defaults.temperature,
            max_response_output_tokens: defaults.max_response_output_tokens,
            ..SessionConfiguration::default()
        }
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.connection.resolve_api_key().is_none() {
            warnings.push("No API key configured (set connection.api_key or its env var)".into());
        }
        if !self.connection.url.starts_with("ws://") && !self.connection.url.starts_with("wss://")
        {
            errors.push(format!(
                "connection.url must be a ws:// or wss:// URL: {}",
                self.connection.url
            ));
        }

        if self.audio.chunk_bytes == 0 {
            errors.push("audio.chunk_bytes cannot be 0".into());
        }
        if self.audio.max_buffer_bytes == 0 {
            errors.push("audio.max_buffer_bytes cannot be 0".into());
        }
        if self.audio.chunk_bytes % 2 != 0 {
            warnings.push("audio.chunk_bytes is odd; PCM16 frames will be split".into());
        }
        if self.audio.sample_rate != crate::protocol::DEFAULT_SAMPLE_RATE {
            warnings.push(format!(
                "audio.sample_rate is {} Hz; pcm16 sessions exchange {} Hz audio",
                self.audio.sample_rate,
                crate::protocol::DEFAULT_SAMPLE_RATE
            ));
        }

        let reconnect = &self.transport.reconnect;
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            errors.push(format!(
                "transport.reconnect.base_delay_ms ({}) exceeds max_delay_ms ({})",
                reconnect.base_delay_ms, reconnect.max_delay_ms
            ));
        }
        if self.transport.heartbeat_interval_ms == 0 {
            errors.push("transport.heartbeat_interval_ms cannot be 0".into());
        }

        if self.tools.history_capacity == 0 {
            warnings.push("tools.history_capacity is 0; no executions will be kept".into());
        }
        if !matches!(self.logging.format.as_str(), "plain" | "json") {
            errors.push(format!("Unknown logging.format: {}", self.logging.format));
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
