use std::time::Duration;

use bevy::prelude::Resource;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// simulated latency of each tool and purchase stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub list_stocks: Duration,
    pub show_stock_price: Duration,
    pub show_stock_purchase_ui: Duration,
    /// "purchasing..." -> "just a moment..."
    pub purchase_update: Duration,
    /// "just a moment..." -> confirmed
    pub purchase_confirm: Duration,
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            list_stocks: Duration::from_secs(1),
            show_stock_price: Duration::from_secs(1),
            show_stock_purchase_ui: Duration::from_secs(2),
            purchase_update: Duration::from_secs(2),
            purchase_confirm: Duration::from_secs(1),
        }
    }
}

impl Latency {
    /// no simulated waiting at all (replays, tests).
    pub fn instant() -> Self {
        Self {
            list_stocks: Duration::ZERO,
            show_stock_price: Duration::ZERO,
            show_stock_purchase_ui: Duration::ZERO,
            purchase_update: Duration::ZERO,
            purchase_confirm: Duration::ZERO,
        }
    }
}

/// provider + pacing settings. inserted as a resource by the app.
#[derive(Resource, Debug, Clone, PartialEq)]
pub struct StockbotConfig {
    pub base_url: String,
    /// visible for demo simplicity
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// try structured streaming before one-shot chat.
    pub stream: bool,
    pub latency: Latency,
}

impl Default for StockbotConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            stream: true,
            latency: Latency::default(),
        }
    }
}

impl StockbotConfig {
    /// env:
    ///   OPENAI_API_KEY   (key)
    ///   LLM_BASE_URL     (default https://api.openai.com)
    ///   LLM_MODEL        (default gpt-3.5-turbo)
    ///   LLM_TEMPERATURE  (default 0.2)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            base_url: non_empty("LLM_BASE_URL").unwrap_or(defaults.base_url),
            api_key: lookup("OPENAI_API_KEY").unwrap_or_default(),
            model: non_empty("LLM_MODEL").unwrap_or(defaults.model),
            temperature: non_empty("LLM_TEMPERATURE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.temperature),
            ..defaults
        }
    }

    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// base url in the shape the openai backend joins endpoints onto.
    pub fn provider_base_url(&self) -> String {
        format!("{}/", normalize_oai_base(&self.base_url))
    }
}

/// provider requires base to include `/v1` (this avoids 404s on chat endpoints).
pub fn normalize_oai_base(base: &str) -> String {
    let b = base.trim_end_matches('/');
    if b.ends_with("/v1") { b.to_string() } else { format!("{}/v1", b) }
}
