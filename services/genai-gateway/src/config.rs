//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the GENAI_API_KEYS env var or `api_keys_file`,
//! never from the TOML itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use credential_pool::{CooldownPolicy, GatePolicy, GateTier, MAX_COOLDOWN};
use dispatch::{BatchPolicy, DispatchPolicy, GenerationDefaults};
use serde::Deserialize;

/// Env var holding API keys, separated by commas or newlines.
const API_KEYS_ENV: &str = "GENAI_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rate_gate: RateGateConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Generative backend endpoint and sampling defaults
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: provider::gemini::DEFAULT_BASE_URL.into(),
            model: "gemini-2.5-flash".into(),
            temperature: provider::CallRequest::DEFAULT_TEMPERATURE,
            max_output_tokens: provider::CallRequest::DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

/// Credential set and cooldown tuning
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// File with one key per line (alternative to GENAI_API_KEYS)
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
    pub cooldown_base_secs: u64,
    pub cooldown_cap_multiplier: u32,
    pub quota_window_secs: u64,
    pub reset_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            api_keys_file: None,
            api_keys: Vec::new(),
            cooldown_base_secs: 5,
            cooldown_cap_multiplier: 8,
            quota_window_secs: 3600,
            reset_interval_secs: 86_400,
        }
    }
}

/// Optional override of the alive-count → interval table
#[derive(Debug, Default, Deserialize)]
pub struct RateGateConfig {
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierConfig {
    pub min_credentials: usize,
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    /// Passes over the pool one call may make before giving up.
    pub rotations: u32,
    pub request_timeout_secs: u64,
    /// Zero disables the idle timeout between stream chunks.
    pub stream_idle_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rotations: 1,
            request_timeout_secs: 120,
            stream_idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub delay_ms: u64,
    /// Largest batch request the gateway accepts.
    pub max_items: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 3,
            delay_ms: 2000,
            max_items: 50,
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. GENAI_API_KEYS env var
    /// 2. api_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let raw = match std::env::var(API_KEYS_ENV) {
            Ok(keys) => keys,
            Err(_) => match config.pool.api_keys_file {
                Some(ref file) => std::fs::read_to_string(file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read api_keys_file {}: {e}",
                        file.display()
                    ))
                })?,
                None => String::new(),
            },
        };
        config.pool.api_keys = parse_keys(&raw).into_iter().map(Secret::new).collect();

        if config.pool.api_keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no API keys configured: set {API_KEYS_ENV} or pool.api_keys_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |msg: &str| Err(common::Error::Config(msg.into()));

        if !self.backend.base_url.starts_with("http://")
            && !self.backend.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.backend.base_url
            )));
        }
        if self.backend.model.trim().is_empty() {
            return invalid("backend.model must not be empty");
        }
        if self.server.max_connections == 0 {
            return invalid("max_connections must be greater than 0");
        }
        if self.dispatch.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be greater than 0");
        }
        if self.dispatch.max_attempts == 0 {
            return invalid("max_attempts must be greater than 0");
        }
        if self.dispatch.rotations == 0 {
            return invalid("rotations must be greater than 0");
        }
        if self.batch.size == 0 {
            return invalid("batch.size must be greater than 0");
        }
        if self.batch.max_items == 0 {
            return invalid("batch.max_items must be greater than 0");
        }
        if self.pool.reset_interval_secs == 0 {
            return invalid("reset_interval_secs must be greater than 0");
        }
        if self.reset_interval() > MAX_COOLDOWN {
            return Err(common::Error::Config(format!(
                "reset_interval_secs must not exceed {}",
                MAX_COOLDOWN.as_secs()
            )));
        }
        self.cooldown_policy()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        self.gate_policy()?;
        Ok(())
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            base: Duration::from_secs(self.pool.cooldown_base_secs),
            cap_multiplier: self.pool.cooldown_cap_multiplier,
            quota_window: Duration::from_secs(self.pool.quota_window_secs),
        }
    }

    /// Configured tiers, or the built-in table when none are given.
    pub fn gate_policy(&self) -> common::Result<GatePolicy> {
        if self.rate_gate.tiers.is_empty() {
            return Ok(GatePolicy::default());
        }
        let tiers = self
            .rate_gate
            .tiers
            .iter()
            .map(|t| GateTier {
                min_credentials: t.min_credentials,
                interval: Duration::from_millis(t.interval_ms),
            })
            .collect();
        GatePolicy::new(tiers).map_err(|e| common::Error::Config(e.to_string()))
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: self.dispatch.max_attempts,
            rotations: self.dispatch.rotations,
            request_timeout: Duration::from_secs(self.dispatch.request_timeout_secs),
            stream_idle_timeout: match self.dispatch.stream_idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            size: self.batch.size,
            delay: Duration::from_millis(self.batch.delay_ms),
        }
    }

    pub fn generation_defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            temperature: self.backend.temperature,
            max_output_tokens: self.backend.max_output_tokens,
        }
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.pool.reset_interval_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("genai-gateway.toml")
    }
}

/// Split a key list on commas and newlines. Blank entries and `#` comment
/// lines are skipped; duplicates keep their first position.
fn parse_keys(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        for key in line.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_owned());
            }
        }
    }
    keys
}
