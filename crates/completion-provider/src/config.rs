//! Provider configuration

use crate::pricing::Wei;
use crate::protocol::{Offer, Price};
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Provider configuration, loaded from a TOML file
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Marketplace RPC host
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,
    /// Marketplace RPC port
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Address the job-connection listener binds to
    #[serde(default = "default_job_listen_addr")]
    pub job_listen_addr: String,
    /// Base URL of the OpenAI-compatible API, e.g. "https://api.openai.com/v1"
    pub openai_base_url: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    /// SQLite database path
    pub database_url: String,
    /// Upstream request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long a finished job stays in the live registry
    #[serde(default = "default_registry_grace_secs")]
    pub registry_grace_secs: u64,
    /// Offers keyed by offer id
    #[serde(default)]
    pub offers: BTreeMap<String, OfferConfig>,
}

/// An offer as written in the config file, with decimal prices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferConfig {
    pub model_id: String,
    pub context_size: u32,
    #[serde(default)]
    pub description: Option<String>,
    pub input_token_price: PriceConfig,
    pub output_token_price: PriceConfig,
    #[serde(default)]
    pub trial: Option<PriceConfig>,
}

/// Decimal price, e.g. `{ "$pol" = "0.00000015" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    #[serde(rename = "$pol")]
    pub amount: String,
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    4269
}

fn default_job_listen_addr() -> String {
    "127.0.0.1:4270".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_registry_grace_secs() -> u64 {
    600
}

impl ProviderConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ProviderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.openai_base_url)
            .with_context(|| format!("Invalid openai_base_url {:?}", self.openai_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("openai_base_url must be an http(s) URL, got {:?}", url.scheme());
        }
        if self.database_url.trim().is_empty() {
            bail!("database_url must not be empty");
        }
        if self.offers.is_empty() {
            bail!("At least one offer must be configured");
        }
        self.offers()?;
        Ok(())
    }

    /// Offers with prices parsed to fixed point
    pub fn offers(&self) -> anyhow::Result<BTreeMap<String, Offer>> {
        self.offers
            .iter()
            .map(|(id, offer)| {
                let offer = offer
                    .to_offer()
                    .with_context(|| format!("Invalid offer {:?}", id))?;
                Ok((id.clone(), offer))
            })
            .collect()
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }
}

impl OfferConfig {
    pub fn to_offer(&self) -> anyhow::Result<Offer> {
        if self.model_id.is_empty() {
            bail!("model_id must not be empty");
        }
        if self.context_size < 1 {
            bail!("context_size must be at least 1");
        }

        Ok(Offer {
            model_id: self.model_id.clone(),
            context_size: self.context_size,
            description: self.description.clone(),
            input_token_price: self
                .input_token_price
                .to_price()
                .context("input_token_price")?,
            output_token_price: self
                .output_token_price
                .to_price()
                .context("output_token_price")?,
            trial: self
                .trial
                .as_ref()
                .map(PriceConfig::to_price)
                .transpose()
                .context("trial")?,
        })
    }
}

impl PriceConfig {
    pub fn to_price(&self) -> anyhow::Result<Price> {
        Ok(Price::new(Wei::parse_decimal(&self.amount)?))
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("rpc_host", &self.rpc_host)
            .field("rpc_port", &self.rpc_port)
            .field("job_listen_addr", &self.job_listen_addr)
            .field("openai_base_url", &self.openai_base_url)
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_url", &self.database_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("registry_grace_secs", &self.registry_grace_secs)
            .field("offers", &self.offers)
            .finish()
    }
}
