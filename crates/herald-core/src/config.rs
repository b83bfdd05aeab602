use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{HeraldError, Result};

// Fixed multipliers from the provider's price sheet — not configurable.
pub const CACHE_READ_MULTIPLIER: &str = "0.1";
pub const CACHE_WRITE_MULTIPLIER: &str = "1.25";
/// Provider refuses to cache system blocks below this many tokens.
pub const PROMPT_CACHE_MIN_TOKENS: u32 = 1024;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeraldConfig {
    pub telegram: TelegramConfig,
    pub anthropic: AnthropicConfig,
    #[serde(default = "default_models")]
    pub models: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub critique: CritiqueConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

impl HeraldConfig {
    /// Load order: explicit path > `HERALD_CONFIG` env > `./herald.toml`,
    /// then `HERALD_*` env vars override individual keys.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("HERALD_CONFIG").ok())
            .unwrap_or_else(|| "herald.toml".to_string());

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| HeraldError::Config(e.to_string()))
    }

    /// Resolve a model key to its spec, falling back to the default model.
    pub fn model(&self, key: Option<&str>) -> Result<(&str, &ModelSpec)> {
        let key = key.unwrap_or(&self.anthropic.default_model);
        match self.models.get_key_value(key) {
            Some((k, spec)) => Ok((k.as_str(), spec)),
            None => Err(HeraldError::InvalidModel(key.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Telegram user ids allowed to run admin commands.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    /// Minimum milliseconds between draft edits (first edit is immediate).
    #[serde(default = "default_draft_edit_ms")]
    pub draft_edit_ms: u64,
    /// Hard frontend limit per message; longer finals are split.
    #[serde(default = "default_message_char_limit")]
    pub message_char_limit: usize,
    /// Batch window from the first unfinalized message of a burst.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_upload_limit")]
    pub upload_limit_bytes: u64,
    #[serde(default = "default_premium_upload_limit")]
    pub premium_upload_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_key")]
    pub default_model: String,
    /// Provider-side file retention; `UserFile.expires_at = uploaded_at + this`.
    #[serde(default = "default_files_ttl_hours")]
    pub files_ttl_hours: i64,
    /// Outer timeout wrapping one streaming turn.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// N_MAX — continuation iterations per agent loop.
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,
}

/// Per-model registry entry. Prices are USD per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub context_window: u32,
    pub max_output: u32,
    #[serde(default)]
    pub thinking_budget: u32,
    pub input_price: Decimal,
    pub output_price: Decimal,
    #[serde(default)]
    pub supports_thinking: bool,
    #[serde(default)]
    pub supports_effort: bool,
    #[serde(default)]
    pub supports_interleaved_thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Sandbox wall-clock, USD per second.
    #[serde(default = "default_sandbox_per_second")]
    pub sandbox_per_second: Decimal,
    /// Transcription, USD per audio minute.
    #[serde(default = "default_transcription_per_minute")]
    pub transcription_per_minute: Decimal,
    /// Image generation, USD per image.
    #[serde(default = "default_image_price")]
    pub image_generation: Decimal,
    /// Server-side web search, USD per call.
    #[serde(default = "default_web_search_price")]
    pub web_search: Decimal,
    #[serde(default = "default_latex_price")]
    pub latex_render: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            sandbox_per_second: default_sandbox_per_second(),
            transcription_per_minute: default_transcription_per_minute(),
            image_generation: default_image_price(),
            web_search: default_web_search_price(),
            latex_render: default_latex_price(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When unset, the in-memory backend is used.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_hour_secs")]
    pub user_ttl_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub thread_ttl_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub messages_ttl_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub files_ttl_secs: u64,
    #[serde(default = "default_bytes_ttl_secs")]
    pub bytes_ttl_secs: u64,
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,
    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,
    #[serde(default = "default_breaker_open_secs")]
    pub breaker_open_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            user_ttl_secs: default_hour_secs(),
            thread_ttl_secs: default_hour_secs(),
            messages_ttl_secs: default_hour_secs(),
            files_ttl_secs: default_hour_secs(),
            bytes_ttl_secs: default_bytes_ttl_secs(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
            breaker_failures: default_breaker_failures(),
            breaker_open_secs: default_breaker_open_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_flush_batch")]
    pub flush_batch: usize,
    /// Flush attempts per item before dead-lettering.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_batch: default_flush_batch(),
            write_retries: default_write_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueConfig {
    /// Fixed premium model for the subordinate critique session.
    #[serde(default = "default_critique_model")]
    pub model: String,
    /// Minimum balance required to start a critique.
    #[serde(default = "default_critique_min_balance")]
    pub min_balance: Decimal,
    #[serde(default = "default_critique_max_iterations")]
    pub max_iterations: u32,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            model: default_critique_model(),
            min_balance: default_critique_min_balance(),
            max_iterations: default_critique_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub sandbox: ServiceEndpoint,
    #[serde(default)]
    pub transcription: ServiceEndpoint,
    #[serde(default)]
    pub image_generation: ServiceEndpoint,
    #[serde(default)]
    pub latex: ServiceEndpoint,
    /// Default sandbox execution timeout. Hard cap below.
    #[serde(default = "default_python_timeout_secs")]
    pub python_timeout_secs: u64,
    #[serde(default = "default_python_timeout_cap_secs")]
    pub python_timeout_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptConfig {
    /// Operator-authored global instructions, prepended to every request.
    #[serde(default)]
    pub system: String,
    /// Optional file path; when set it overrides `system`.
    #[serde(default)]
    pub system_path: Option<String>,
}

fn default_draft_edit_ms() -> u64 {
    600
}
fn default_message_char_limit() -> usize {
    4096
}
fn default_batch_window_ms() -> u64 {
    200
}
fn default_upload_limit() -> u64 {
    20 * 1024 * 1024
}
fn default_premium_upload_limit() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_model_key() -> String {
    "sonnet".to_string()
}
fn default_files_ttl_hours() -> i64 {
    168
}
fn default_stream_timeout_secs() -> u64 {
    300
}
fn default_max_continuations() -> u32 {
    10
}
fn default_sandbox_per_second() -> Decimal {
    dec!(0.0003)
}
fn default_transcription_per_minute() -> Decimal {
    dec!(0.006)
}
fn default_image_price() -> Decimal {
    dec!(0.134)
}
fn default_web_search_price() -> Decimal {
    dec!(0.01)
}
fn default_latex_price() -> Decimal {
    dec!(0.002)
}
fn default_hour_secs() -> u64 {
    3600
}
fn default_bytes_ttl_secs() -> u64 {
    900
}
fn default_artifact_ttl_secs() -> u64 {
    1800
}
fn default_breaker_failures() -> u32 {
    3
}
fn default_breaker_open_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    "herald.db".to_string()
}
fn default_flush_interval_secs() -> u64 {
    5
}
fn default_flush_batch() -> usize {
    100
}
fn default_write_retries() -> u32 {
    5
}
fn default_critique_model() -> String {
    "opus".to_string()
}
fn default_critique_min_balance() -> Decimal {
    dec!(0.50)
}
fn default_critique_max_iterations() -> u32 {
    8
}
fn default_python_timeout_secs() -> u64 {
    180
}
fn default_python_timeout_cap_secs() -> u64 {
    3600
}
fn default_service_timeout_secs() -> u64 {
    120
}

fn default_models() -> BTreeMap<String, ModelSpec> {
    let mut m = BTreeMap::new();
    m.insert(
        "sonnet".to_string(),
        ModelSpec {
            id: "claude-sonnet-4-5".to_string(),
            context_window: 200_000,
            max_output: 16_384,
            thinking_budget: 8_192,
            input_price: dec!(3),
            output_price: dec!(15),
            supports_thinking: true,
            supports_effort: false,
            supports_interleaved_thinking: true,
        },
    );
    m.insert(
        "haiku".to_string(),
        ModelSpec {
            id: "claude-haiku-4-5".to_string(),
            context_window: 200_000,
            max_output: 8_192,
            thinking_budget: 0,
            input_price: dec!(1),
            output_price: dec!(5),
            supports_thinking: false,
            supports_effort: false,
            supports_interleaved_thinking: false,
        },
    );
    m.insert(
        "opus".to_string(),
        ModelSpec {
            id: "claude-opus-4-1".to_string(),
            context_window: 200_000,
            max_output: 32_000,
            thinking_budget: 16_384,
            input_price: dec!(15),
            output_price: dec!(75),
            supports_thinking: true,
            supports_effort: true,
            supports_interleaved_thinking: true,
        },
    );
    m
}
