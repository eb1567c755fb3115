//! Configuration for the proxy.
//!
//! The proxy is configured via a TOML file with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Every knob has a
//! documented default; a minimal deployment only needs a provider key and
//! one registry entry.
//!
//! # Example
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [providers.openai]
//! type = "open_ai"
//! base_url = "https://api.openai.com/v1"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [[registry.projects]]
//! token = "${WATCHLLM_DEMO_TOKEN}"
//! id = "p-demo"
//! plan = "free"
//! ```

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::observability::LogFormat;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Project registry seed data and refresh behavior.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Response cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Embedding provider used for semantic lookups.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Upstream provider configurations, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Model-to-provider routing.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Request deadlines and coalescing bounds.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Pricing table used for cost accounting.
    #[serde(default)]
    pub pricing: crate::pricing::PricingTableConfig,

    /// Telemetry egress configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded;
    /// missing variables are an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: ProxyConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for project in &self.registry.projects {
            if project.token.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "registry project '{}' has an empty token",
                    project.id
                )));
            }
            if let Some(threshold) = project.similarity_threshold
                && !(0.85..=0.99).contains(&threshold)
            {
                return Err(ConfigError::Validation(format!(
                    "project '{}': similarity_threshold {} outside [0.85, 0.99]",
                    project.id, threshold
                )));
            }
        }

        if let Some(default) = &self.routing.default_provider
            && !self.providers.contains_key(default)
        {
            return Err(ConfigError::Validation(format!(
                "routing.default_provider '{}' is not a configured provider",
                default
            )));
        }
        for (pattern, provider) in &self.routing.routes {
            if !self.providers.contains_key(provider) {
                return Err(ConfigError::Validation(format!(
                    "routing entry '{}' points at unknown provider '{}'",
                    pattern, provider
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub listen: String,

    /// Maximum accepted request body size in bytes.
    pub request_body_limit_bytes: usize,

    /// Default tracing filter directive when RUST_LOG is unset.
    pub log_directive: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_body_limit_bytes: 2 * 1024 * 1024,
            log_directive: "watchllm=info,tower_http=warn".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry seed data. In production the control plane provisions projects;
/// the proxy only ever reads them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Seed projects loaded at startup.
    pub projects: Vec<ProjectSeed>,

    /// How often the registry re-reads its source. 0 disables refresh.
    pub refresh_interval_secs: u64,
}

/// A project as provisioned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSeed {
    /// Opaque API token presented by clients as a bearer credential.
    pub token: String,

    /// Stable project identifier.
    pub id: String,

    /// Plan tier; supplies limit defaults when not set explicitly.
    #[serde(default)]
    pub plan: crate::registry::Plan,

    /// Monthly request limit override.
    #[serde(default)]
    pub monthly_request_limit: Option<u64>,

    /// Per-minute request limit override.
    #[serde(default)]
    pub per_minute_limit: Option<u32>,

    /// Cache entry TTL override in seconds.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Semantic similarity threshold, within [0.85, 0.99].
    #[serde(default)]
    pub similarity_threshold: Option<f64>,

    /// Whether responses for this project are cached at all.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Suspended projects authenticate but are refused service.
    #[serde(default)]
    pub suspended: bool,

    /// Per-provider credentials overriding the static provider keys.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch for response caching.
    pub enabled: bool,

    /// Default TTL for cache entries, in seconds. Projects may override.
    pub ttl_secs: u64,

    /// Maximum entries held per project before LRU eviction.
    pub max_entries_per_project: usize,

    /// Interval between background sweeps of expired entries.
    pub sweep_interval_secs: u64,

    /// Semantic (embedding-based) matching.
    pub semantic: SemanticCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries_per_project: 10_000,
            sweep_interval_secs: 60,
            semantic: SemanticCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticCacheConfig {
    /// Whether semantic matching is attempted on exact miss.
    pub enabled: bool,

    /// Fallback similarity threshold for projects without an override.
    pub default_threshold: f64,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_threshold: 0.92,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Base URL of the OpenAI-compatible embeddings endpoint.
    pub endpoint: String,

    /// Embedding model name.
    pub model: String,

    /// Expected vector dimensions.
    pub dimensions: usize,

    /// API key for the embedding endpoint.
    pub api_key: Option<String>,

    /// Call deadline. On timeout the request degrades to exact-match only.
    pub deadline_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            api_key: None,
            deadline_ms: 2000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers & routing
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProviderConfig {
    /// Any OpenAI-compatible endpoint (OpenAI, Groq, self-hosted gateways).
    OpenAi(OpenAiProviderConfig),
    /// Anthropic Messages API.
    Anthropic(AnthropicProviderConfig),
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        match self {
            ProviderConfig::OpenAi(c) => &c.base_url,
            ProviderConfig::Anthropic(c) => &c.base_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiProviderConfig {
    /// Base URL including the version prefix, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Bearer key; per-project credentials take precedence.
    pub api_key: Option<String>,

    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,

    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for OpenAiProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            headers: HashMap::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnthropicProviderConfig {
    /// Base URL, e.g. `https://api.anthropic.com`.
    pub base_url: String,

    /// `x-api-key` value; per-project credentials take precedence.
    pub api_key: Option<String>,

    /// `anthropic-version` header value.
    pub version: String,

    /// Default max_tokens when the request does not set one (required by
    /// the Messages API).
    pub default_max_tokens: u64,

    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for AnthropicProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            version: "2023-06-01".to_string(),
            default_max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Explicit model-to-provider routes. Keys may end with `*` for prefix
    /// wildcard matching, e.g. `"gpt-4*" = "openai"`.
    pub routes: HashMap<String, String>,

    /// Provider used when no route or family prefix matches.
    pub default_provider: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Limits, deadlines, coalescing, replay
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// End-to-end deadline for unary requests.
    pub unary_deadline_secs: u64,

    /// End-to-end deadline for streaming requests.
    pub streaming_deadline_secs: u64,

    /// Followers attach to a leader only while it is younger than this.
    pub coalesce_leader_max_age_secs: u64,

    /// Per-chunk replay delay floor.
    pub replay_min_delay_ms: u64,

    /// Per-chunk replay delay ceiling.
    pub replay_max_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            unary_deadline_secs: 60,
            streaming_deadline_secs: 300,
            coalesce_leader_max_age_secs: 30,
            replay_min_delay_ms: 1,
            replay_max_delay_ms: 50,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// URL of the external event sink (NDJSON over HTTP POST). When unset,
    /// events are counted and discarded.
    pub sink_url: Option<String>,

    /// Maximum buffered events before new ones are dropped.
    pub max_pending_events: usize,

    /// Maximum events per flush batch.
    pub batch_size: usize,

    /// Flush interval in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sink_url: None,
            max_pending_events: 10_000,
            batch_size: 500,
            flush_interval_ms: 1000,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Expand `${VAR_NAME}` references outside of comments.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let whole = cap.get(0).expect("capture 0 always present");
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);
            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
