use std::time::Duration;

use egress_protocol::RequestKind;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::util::{env_parse, env_string};

/// Static per-kind CPU cost estimates, in cores.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CpuCostConfig {
    pub room_composite_cpu_cost: f64,
    pub web_cpu_cost: f64,
    pub track_composite_cpu_cost: f64,
    pub track_cpu_cost: f64,
}

impl Default for CpuCostConfig {
    fn default() -> Self {
        Self {
            room_composite_cpu_cost: 3.0,
            web_cpu_cost: 3.0,
            track_composite_cpu_cost: 2.0,
            track_cpu_cost: 1.0,
        }
    }
}

impl CpuCostConfig {
    pub fn cost(&self, kind: RequestKind) -> f64 {
        match kind {
            RequestKind::RoomComposite => self.room_composite_cpu_cost,
            RequestKind::Web => self.web_cpu_cost,
            RequestKind::TrackComposite => self.track_composite_cpu_cost,
            RequestKind::Track => self.track_cpu_cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct AdmissionConfig {
    /// How long a start reservation holds CPU before it is released.
    pub reservation_release_ms: u64,
    /// CPU sampling period.
    pub sample_interval_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            reservation_release_ms: 1_000,
            sample_interval_ms: 500,
        }
    }
}

impl AdmissionConfig {
    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.reservation_release_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(50))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound on a graceful shutdown drain before jobs are force-terminated.
    pub drain_timeout_secs: u64,
    /// How long terminal jobs stay listed before eviction.
    pub terminal_retention_secs: u64,
    /// Maximum inbound bus messages handled concurrently.
    pub request_concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 60,
            terminal_retention_secs: 30,
            request_concurrency: 64,
        }
    }
}

impl ServiceConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Local,
    Nats,
}

impl std::str::FromStr for BusBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BusBackend::Local),
            "nats" => Ok(BusBackend::Nats),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct BusConfig {
    /// Message bus backend: "local" (default) or "nats".
    #[serde(default)]
    pub backend: BusBackend,
    /// NATS connection URL, e.g. <nats://127.0.0.1:4222>
    #[serde(default)]
    pub nats_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PipelineConfig {
    /// External pipeline program and its arguments.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    /// Optional explicit node id (generated when absent)
    #[serde(default)]
    pub node_id: Option<String>,
    /// Health/status HTTP port; the surface is disabled when unset
    #[serde(default)]
    pub health_port: Option<u16>,
    #[serde(default)]
    pub cpu_cost: CpuCostConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

static CONFIG_SCHEMA: Lazy<Option<Validator>> = Lazy::new(|| {
    let schema_value = config_schema_json();
    match validator_for(&schema_value) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::error!(%err, "config schema failed to compile; validation disabled");
            None
        }
    }
});

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).unwrap_or_default()
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Parse and schema-validate TOML configuration text.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: toml::Table = toml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| ConfigError::Load(e.to_string()))?;
    if let Some(validator) = CONFIG_SCHEMA.as_ref() {
        let validation_errors: Vec<_> = validator
            .iter_errors(&json_value)
            .map(|e| e.to_string())
            .collect();
        if !validation_errors.is_empty() {
            return Err(ConfigError::Load(validation_errors.join(", ")));
        }
    }
    toml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Load(format!("{path}: {e}")))?;
    parse_config(&content)
}

/// Load from `EGRESS_CONFIG` (defaults when unset), then apply env overrides.
pub fn load_from_env() -> Result<Config, ConfigError> {
    let mut cfg = match env_string("EGRESS_CONFIG") {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    cfg.apply_env_overrides()?;
    if cfg.node_id.is_none() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        cfg.node_id = Some(format!("EN_{}", &id[..12]));
    }
    Ok(cfg)
}

impl Config {
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn invalid(key: &str, raw: String) -> ConfigError {
            ConfigError::Load(format!("invalid {key}: {raw:?}"))
        }
        if let Some(id) = env_string("EGRESS_NODE_ID") {
            self.node_id = Some(id);
        }
        if let Some(port) =
            env_parse::<u16>("EGRESS_HEALTH_PORT").map_err(|r| invalid("EGRESS_HEALTH_PORT", r))?
        {
            self.health_port = Some(port);
        }
        if let Some(backend) =
            env_parse::<BusBackend>("EGRESS_BUS").map_err(|r| invalid("EGRESS_BUS", r))?
        {
            self.bus.backend = backend;
        }
        if let Some(url) = env_string("EGRESS_NATS_URL") {
            self.bus.nats_url = Some(url);
        }
        if let Some(secs) = env_parse::<u64>("EGRESS_DRAIN_TIMEOUT_SECS")
            .map_err(|r| invalid("EGRESS_DRAIN_TIMEOUT_SECS", r))?
        {
            self.service.drain_timeout_secs = secs;
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or("egress")
    }
}
