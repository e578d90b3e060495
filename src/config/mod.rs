// src/config/mod.rs
//! Externally supplied configuration: thresholds, registry, limits, healing and alerting.

pub mod load;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::issue::IssueKind;
use crate::registry::{Category, Criticality};

pub use load::{load_default, load_from, parse_settings, validate};

pub const DEFAULT_CONFIG_PATH: &str = "config/feed_gate.toml";
pub const ENV_CONFIG_PATH: &str = "FEED_GATE_CONFIG_PATH";
pub const ENV_SUCCESS_THRESHOLD: &str = "FEED_GATE_SUCCESS_THRESHOLD";
pub const ENV_BIND: &str = "FEED_GATE_BIND";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gate: GateCfg,
    #[serde(default)]
    pub orchestrator: OrchestratorCfg,
    #[serde(default)]
    pub cache: CacheCfg,
    #[serde(default)]
    pub health: HealthCfg,
    #[serde(default)]
    pub healing: HealingCfg,
    #[serde(default)]
    pub escalation: EscalationCfg,
    #[serde(default)]
    pub providers: Vec<ProviderCfg>,
    #[serde(default)]
    pub sources: Vec<SourceCfg>,
    #[serde(default)]
    pub aliases: Vec<AliasCfg>,
    #[serde(default)]
    pub dependents: Vec<DependentCfg>,
}

fn default_success_threshold() -> f64 {
    0.80
}
fn default_pass_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCfg {
    /// Minimum share of successful sources for a pass. Defaults to 0.80.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    /// Hard deadline for one ingestion pass; unsettled sources score as failure.
    #[serde(default = "default_pass_timeout_secs")]
    pub pass_timeout_secs: u64,
}

impl Default for GateCfg {
    fn default() -> Self {
        Self {
            success_threshold: default_success_threshold(),
            pass_timeout_secs: default_pass_timeout_secs(),
        }
    }
}

impl GateCfg {
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorCfg {
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub pass_interval_secs: u64,
    /// Where rate-limit increases are persisted. `None` keeps them in memory only.
    pub rate_limit_state_path: Option<PathBuf>,
    pub backoff_step_ms: u64,
    pub backoff_factor: f64,
    pub max_extra_delay_ms: u64,
    pub audit_capacity: usize,
}

impl Default for OrchestratorCfg {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retry_attempts: 3,
            base_delay_ms: 500,
            request_timeout_secs: 15,
            pass_interval_secs: 900,
            rate_limit_state_path: Some(PathBuf::from("state/rate_limits.json")),
            backoff_step_ms: 1_000,
            backoff_factor: 2.0,
            max_extra_delay_ms: 60_000,
            audit_capacity: 2_000,
        }
    }
}

impl OrchestratorCfg {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheCfg {
    pub default_ttl_secs: u64,
    /// TTL of fast-tier entries restored from the durable tier.
    pub repair_ttl_secs: u64,
    pub read_timeout_ms: u64,
    /// JSON-lines ledger backing the durable tier. `None` uses an in-memory store.
    pub durable_path: Option<PathBuf>,
    pub max_fast_entries: usize,
    pub max_durable_backlog: usize,
}

impl Default for CacheCfg {
    fn default() -> Self {
        Self {
            default_ttl_secs: 900,
            repair_ttl_secs: 60,
            read_timeout_ms: 250,
            durable_path: Some(PathBuf::from("state/durable.jsonl")),
            max_fast_entries: 10_000,
            max_durable_backlog: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCfg {
    pub interval_secs: u64,
    /// A degraded key whose age reaches `ttl * unhealthy_factor` (inclusive) is unhealthy.
    pub unhealthy_factor: f64,
    pub probe_timeout_secs: u64,
}

impl Default for HealthCfg {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            unhealthy_factor: 2.0,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Re-fetch the source, validate it alone, write through the cache.
    Refetch,
    /// Copy the durable-tier entry back into the fast tier, flagged stale.
    RestoreFromDurable,
    RestartDependent,
    BackoffIncrease,
    EvictExpired,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_action_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCfg {
    pub name: String,
    pub kinds: Vec<IssueKind>,
    #[serde(default)]
    pub target_prefix: Option<String>,
    pub action: ActionKind,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingCfg {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyCfg>,
}

impl Default for HealingCfg {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
        }
    }
}

fn strategy(name: &str, kind: IssueKind, action: ActionKind) -> StrategyCfg {
    StrategyCfg {
        name: name.to_string(),
        kinds: vec![kind],
        target_prefix: None,
        action,
        max_attempts: default_max_attempts(),
        cooldown_secs: default_cooldown_secs(),
        timeout_secs: default_action_timeout_secs(),
    }
}

pub fn default_strategies() -> Vec<StrategyCfg> {
    vec![
        strategy("refetch-and-repair", IssueKind::StaleCache, ActionKind::Refetch),
        strategy(
            "restart-dependent",
            IssueKind::DependentUnresponsive,
            ActionKind::RestartDependent,
        ),
        strategy("backoff-increase", IssueKind::RateLimited, ActionKind::BackoffIncrease),
        strategy("evict-expired", IssueKind::ResourcePressure, ActionKind::EvictExpired),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleCfg {
    pub kind: IssueKind,
    pub threshold: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationCfg {
    pub default_threshold: u32,
    pub default_window_secs: u64,
    pub rules: Vec<AlertRuleCfg>,
    /// How many closed incidents stay queryable.
    pub closed_capacity: usize,
}

impl Default for EscalationCfg {
    fn default() -> Self {
        Self {
            default_threshold: 5,
            default_window_secs: 600,
            rules: Vec::new(),
            closed_capacity: 200,
        }
    }
}

impl EscalationCfg {
    pub fn rule_for(&self, kind: IssueKind) -> (u32, Duration) {
        self.rules
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| (r.threshold, Duration::from_secs(r.window_secs)))
            .unwrap_or((
                self.default_threshold,
                Duration::from_secs(self.default_window_secs),
            ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Http,
    Static,
}

fn default_requests() -> u32 {
    60
}
fn default_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCfg {
    pub id: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// URL with `{series}` and `{api_key}` placeholders (http providers).
    #[serde(default)]
    pub url_template: Option<String>,
    /// Name of the env var holding the API key. Keys never live in the file.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// JSON pointer into the response body (e.g. `/observations/0/value`).
    #[serde(default)]
    pub value_pointer: Option<String>,
    #[serde(default = "default_requests")]
    pub requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Values served by `static` providers, keyed by series.
    #[serde(default)]
    pub values: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCfg {
    pub id: String,
    pub category: Category,
    #[serde(default)]
    pub criticality: Criticality,
    /// Provider-side series identifier; defaults to `id`.
    #[serde(default)]
    pub series: Option<String>,
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasCfg {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentCfg {
    pub name: String,
    pub health_url: String,
    /// argv of the restart command; empty disables restarts for this dependent.
    #[serde(default)]
    pub restart: Vec<String>,
}
