use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Environment variables holding provider credentials and model overrides
pub const PROVIDER_SECRET_VARS: [&str; 5] = [
    "LOVABLE_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "OPENAI_MODEL",
    "ANTHROPIC_MODEL",
];

/// 主配置结构体
///
/// 包含AI聊天代理的所有配置信息，从默认值、配置文件和环境变量加载
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// 运行环境（development 环境下错误响应会携带详细信息）
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub server: ServerConfig,
    /// 上游调用的超时设置
    #[serde(default)]
    pub relay: RelayConfig,
    /// 提供商凭据与覆盖项（按固定优先级排列）
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size_bytes: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RelayConfig {
    /// Time allowed for one provider to answer with response headers
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,
    /// Longest silence tolerated between two chunks of a relayed stream
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub lovable: ProviderSlot,
    #[serde(default)]
    pub openai: ProviderSlot,
    #[serde(default)]
    pub anthropic: ProviderSlot,
}

/// One provider slot; it is active only when `api_key` is non-blank
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProviderSlot {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub normalize_stream: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default = "default_cors_max_age")]
    pub max_age_seconds: u64,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_request_size() -> usize { 1024 * 1024 } // 1MB
fn default_provider_timeout() -> u64 { 30 }
fn default_stream_idle_timeout() -> u64 { 30 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_cors_max_age() -> u64 { 86400 }
fn default_allowed_headers() -> Vec<String> {
    ["authorization", "x-client-info", "apikey", "content-type"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size_bytes: default_max_request_size(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            provider_timeout_seconds: default_provider_timeout(),
            stream_idle_timeout_seconds: default_stream_idle_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_headers: default_allowed_headers(),
            max_age_seconds: default_cors_max_age(),
        }
    }
}

/// 加载配置文件和环境变量
///
/// ## 功能说明
/// 按优先级合并四个配置源，后者覆盖前者：
/// 1. 内置默认值
/// 2. TOML配置文件（默认 `config.toml`，文件不存在时跳过）
/// 3. 以 `AI_CHAT_` 为前缀的环境变量，使用 `__` 表示嵌套（如 `AI_CHAT_SERVER__PORT`）
/// 4. 提供商凭据环境变量（`LOVABLE_API_KEY`、`OPENAI_API_KEY`、`ANTHROPIC_API_KEY`、
///    `OPENAI_MODEL`、`ANTHROPIC_MODEL`）
///
/// ## 执行例子
/// ```rust,no_run
/// let config = ai_chat_proxy::load_config(None)?;
/// println!("Proxy will listen on {}:{}", config.server.host, config.server.port);
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// ## 错误处理
/// - 配置文件格式错误时返回解析错误
/// - 配置验证失败时返回验证错误
/// - 未配置任何提供商不是错误：代理启动后对聊天请求返回503
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let file = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(&file))
        .merge(Env::prefixed("AI_CHAT_").split("__"))
        .merge(provider_secrets())
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {} or environment variables",
                file.display()
            )
        })?;

    config.validate().context("Configuration validation failed")?;

    Ok(config)
}

/// Map the well-known credential variables onto `providers.*` keys
fn provider_secrets() -> Env {
    Env::raw().only(&PROVIDER_SECRET_VARS).map(|key| {
        let target = match key.as_str().to_ascii_uppercase().as_str() {
            "LOVABLE_API_KEY" => "providers.lovable.api_key",
            "OPENAI_API_KEY" => "providers.openai.api_key",
            "ANTHROPIC_API_KEY" => "providers.anthropic.api_key",
            "OPENAI_MODEL" => "providers.openai.model",
            "ANTHROPIC_MODEL" => "providers.anthropic.model",
            other => return other.to_ascii_lowercase().into(),
        };
        target.into()
    })
}

impl Config {
    /// 验证整个配置的有效性
    ///
    /// 逐个验证服务器、中继、提供商、日志和CORS配置，返回第一个带上下文的错误
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
            .context("Server configuration validation failed")?;
        self.relay.validate()
            .context("Relay configuration validation failed")?;
        self.providers.validate()
            .context("Provider configuration validation failed")?;
        self.logging.validate()
            .context("Logging configuration validation failed")?;
        self.cors.validate()
            .context("CORS configuration validation failed")?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.max_request_size_bytes == 0 {
            return Err(anyhow::anyhow!("Max request size must be greater than 0"));
        }

        // 100MB 上限
        if self.max_request_size_bytes > 100 * 1024 * 1024 {
            return Err(anyhow::anyhow!("Max request size cannot exceed 100MB"));
        }

        Ok(())
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("Provider timeout", self.provider_timeout_seconds),
            ("Stream idle timeout", self.stream_idle_timeout_seconds),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be greater than 0", name));
            }
            if value > 300 {
                return Err(anyhow::anyhow!("{} cannot exceed 300 seconds", name));
            }
        }
        Ok(())
    }
}

impl ProvidersConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, slot) in self.slots() {
            slot.validate()
                .with_context(|| format!("Provider '{}' configuration validation failed", name))?;
        }
        Ok(())
    }

    /// Slots in priority order
    pub fn slots(&self) -> [(&'static str, &ProviderSlot); 3] {
        [
            ("lovable", &self.lovable),
            ("openai", &self.openai),
            ("anthropic", &self.anthropic),
        ]
    }
}

impl ProviderSlot {
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(anyhow::anyhow!("Provider endpoint must start with http:// or https://"));
            }
        }

        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(anyhow::anyhow!("Provider model name cannot be empty"));
            }
        }

        Ok(())
    }

    /// Trimmed API key, `None` when unset or blank
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}': must be one of {:?}",
                self.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}': must be one of {:?}",
                self.format, valid_formats
            ));
        }

        Ok(())
    }
}

impl CorsConfig {
    pub fn validate(&self) -> Result<()> {
        for header in &self.allowed_headers {
            if header.is_empty() {
                return Err(anyhow::anyhow!("Allowed header cannot be empty"));
            }
            axum::http::HeaderName::from_bytes(header.as_bytes())
                .with_context(|| format!("Allowed header '{}' is not a valid header name", header))?;
        }
        Ok(())
    }
}
