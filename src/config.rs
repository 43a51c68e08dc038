//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "MCP_DISPATCH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Streaming configuration
    pub streaming: StreamingConfig,
    /// Inbound webhook configuration
    pub webhook: WebhookConfig,
    /// Validation/execution pipeline configuration
    pub pipeline: PipelineConfig,
    /// Backend tool servers by name
    pub backends: HashMap<String, BackendConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !self.webhook.path.starts_with('/') {
            return Err(Error::Config(format!(
                "webhook.path must start with '/': {}",
                self.webhook.path
            )));
        }
        if self.streaming.buffer_size == 0 {
            return Err(Error::Config("streaming.buffer_size must be > 0".to_string()));
        }
        for (name, backend) in self.enabled_backends() {
            match &backend.transport {
                TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                    return Err(Error::Config(format!("backend '{name}': empty command")));
                }
                TransportConfig::Http { http_url } if http_url.trim().is_empty() => {
                    return Err(Error::Config(format!("backend '{name}': empty http_url")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in backend env, headers and
    /// args, and in string values of the webhook reply credentials
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("Invalid env pattern: {e}")))?;

        for backend in self.backends.values_mut() {
            for value in backend.env.values_mut() {
                *value = Self::expand_string(&re, value);
            }
            for value in backend.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
            if let TransportConfig::Stdio { args, .. } = &mut backend.transport {
                for arg in args.iter_mut() {
                    *arg = Self::expand_string(&re, arg);
                }
            }
        }

        Self::expand_value(&re, &mut self.webhook.reply_credentials);

        Ok(())
    }

    fn expand_value(re: &Regex, value: &mut Value) {
        match value {
            Value::String(s) => *s = Self::expand_string(re, s),
            Value::Array(items) => items.iter_mut().for_each(|v| Self::expand_value(re, v)),
            Value::Object(map) => map.values_mut().for_each(|v| Self::expand_value(re, v)),
            _ => {}
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Enabled backends, sorted by name so startup order is deterministic
    #[must_use]
    pub fn enabled_backends(&self) -> Vec<(&String, &BackendConfig)> {
        let mut enabled: Vec<_> = self.backends.iter().filter(|(_, b)| b.enabled).collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));
        enabled
    }
}

/// Resolve a `env:VAR_NAME` reference, falling back to the literal value
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// How long shutdown waits for in-flight dispatches before closing backends
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            max_body_size: 10 * 1024 * 1024, // 10MB
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum gap between two frames before the stream is closed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Frame buffer size per stream
    pub buffer_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            buffer_size: 1024,
        }
    }
}

/// Inbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Mount the webhook endpoint
    pub enabled: bool,
    /// Route path
    pub path: String,
    /// Header carrying the base64 HMAC-SHA256 signature
    pub signature_header: String,
    /// Shared channel secret (literal or `env:VAR_NAME`)
    pub channel_secret: String,
    /// Backend that delivers replies to the platform
    pub reply_server: String,
    /// Client identifier used for synthesized requests
    pub reply_client: String,
    /// Tool invoked on `reply_server` to send a text message
    pub reply_tool: String,
    /// Credentials forwarded to `reply_server`
    pub reply_credentials: Value,
    /// Message sent when a user follows the account
    pub welcome_message: String,
    /// Reply to a text message; `{text}` is replaced with the received text
    pub reply_template: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/webhook".to_string(),
            signature_header: "X-Signature".to_string(),
            channel_secret: "env:LINE_CHANNEL_SECRET".to_string(),
            reply_server: "LINE_MCP".to_string(),
            reply_client: "MCP_CLIENT_GEMINI".to_string(),
            reply_tool: "send_text_message".to_string(),
            reply_credentials: Value::Object(serde_json::Map::new()),
            welcome_message: "Welcome! I'm your AI assistant powered by MCP servers. \
                              I can help with math calculations, email management, and more!"
                .to_string(),
            reply_template: "Thanks for your message: '{text}'. I'm your MCP-powered assistant!"
                .to_string(),
        }
    }
}

impl WebhookConfig {
    /// Resolve the channel secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        resolve_secret(&self.channel_secret)
    }
}

/// Validation/execution pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Accepted `selected_client` identifiers
    pub clients: Vec<String>,
    /// Require a credentials object for every selected server
    pub require_credentials: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clients: vec![
                "MCP_CLIENT_AZURE_AI".to_string(),
                "MCP_CLIENT_OPENAI".to_string(),
                "MCP_CLIENT_GEMINI".to_string(),
            ],
            require_credentials: true,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable description
    pub description: String,
    /// Whether backend is enabled
    pub enabled: bool,
    /// Transport type
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Request timeout for this backend
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Environment variables (for stdio)
    pub env: HashMap<String, String>,
    /// HTTP headers (for http)
    pub headers: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
            headers: HashMap::new(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Stdio transport (subprocess)
    Stdio {
        /// Program to execute
        command: String,
        /// Program arguments
        #[serde(default)]
        args: Vec<String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Streamable HTTP transport
    Http {
        /// HTTP URL
        http_url: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            http_url: String::new(),
        }
    }
}

impl TransportConfig {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s" or "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
