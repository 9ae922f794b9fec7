//! Runtime configuration, loaded from defaults, an optional TOML file, and
//! environment variables (prefix `NOESIS__`), matching the teacher's
//! `CoreConfig::load` precedence order: env path override > file > defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// Top-level runtime configuration. The only process-wide value the Design
/// Notes permit is the data-directory path; everything else is threaded
/// explicitly through component constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for the sled store and the credential blob.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// `"mock"` (default, deterministic) or a concrete transport name; the
    /// concrete transports themselves are an out-of-scope collaborator.
    #[serde(default = "default_llm_mode")]
    pub llm_mode: String,

    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_llm_mode() -> String {
    "mock".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            llm_mode: default_llm_mode(),
            privacy: PrivacyConfig::default(),
            gates: GateConfig::default(),
            monitor: MonitorConfig::default(),
            feedback: FeedbackConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration. Precedence: `NOESIS_CONFIG` path env var >
    /// `config/noesis.toml` (if present) > defaults > `NOESIS__`-prefixed
    /// environment overrides (double underscore separates nesting, e.g.
    /// `NOESIS__PRIVACY__DEFAULT_EPSILON_CAP`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("NOESIS_CONFIG").unwrap_or_else(|_| "config/noesis".to_string());

        let defaults = Config::default();
        let builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.clone())?
            .set_default("llm_mode", defaults.llm_mode.clone())?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("NOESIS").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn credential_path(&self) -> PathBuf {
        self.data_dir_path().join("credentials")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_epsilon_cap")]
    pub default_epsilon_cap: f64,
    #[serde(default = "default_query_cap")]
    pub default_query_cap: u64,
    #[serde(default = "default_query_epsilon_cost")]
    pub query_epsilon_cost: f64,
}

fn default_epsilon_cap() -> f64 {
    10.0
}
fn default_query_cap() -> u64 {
    1000
}
fn default_query_epsilon_cost() -> f64 {
    0.1
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            default_epsilon_cap: default_epsilon_cap(),
            default_query_cap: default_query_cap(),
            query_epsilon_cost: default_query_epsilon_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_autonomy_threshold")]
    pub autonomy_threshold: f32,
    #[serde(default = "default_humanity_threshold")]
    pub humanity_threshold: f32,
    #[serde(default = "default_oversight_threshold")]
    pub oversight_threshold: f32,
    #[serde(default = "default_alignment_threshold")]
    pub alignment_threshold: f32,
    #[serde(default = "default_tribunal_override_threshold")]
    pub tribunal_override_threshold: f32,
    #[serde(default)]
    pub protected_paths: Vec<String>,
}

fn default_autonomy_threshold() -> f32 {
    0.0
}
fn default_humanity_threshold() -> f32 {
    0.6
}
fn default_oversight_threshold() -> f32 {
    0.8
}
fn default_alignment_threshold() -> f32 {
    0.7
}
fn default_tribunal_override_threshold() -> f32 {
    0.5
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            autonomy_threshold: default_autonomy_threshold(),
            humanity_threshold: default_humanity_threshold(),
            oversight_threshold: default_oversight_threshold(),
            alignment_threshold: default_alignment_threshold(),
            tribunal_override_threshold: default_tribunal_override_threshold(),
            protected_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_delta_agency_alert")]
    pub delta_agency_alert_threshold: f32,
    #[serde(default = "default_bhir_alert")]
    pub bhir_alert_threshold: f32,
    #[serde(default = "default_skill_delta_alert")]
    pub skill_delta_alert_threshold: f32,
    #[serde(default = "default_reliance_alert")]
    pub reliance_alert_threshold: f32,
    #[serde(default = "default_true")]
    pub auto_resolve_verified: bool,
    /// RDI sub-score weights (semantic, factual, logical); user-configurable
    /// per SPEC_FULL §4.6. Normalized internally if they don't sum to 1.
    #[serde(default = "default_rdi_weights")]
    pub rdi_weights: (f32, f32, f32),
}

fn default_delta_agency_alert() -> f32 {
    -0.1
}
fn default_bhir_alert() -> f32 {
    0.8
}
fn default_skill_delta_alert() -> f32 {
    -0.15
}
fn default_reliance_alert() -> f32 {
    0.9
}
fn default_rdi_weights() -> (f32, f32, f32) {
    (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            delta_agency_alert_threshold: default_delta_agency_alert(),
            bhir_alert_threshold: default_bhir_alert(),
            skill_delta_alert_threshold: default_skill_delta_alert(),
            reliance_alert_threshold: default_reliance_alert(),
            auto_resolve_verified: true,
            rdi_weights: default_rdi_weights(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_min_feedback")]
    pub min_feedback_for_suggestion: u32,
    #[serde(default = "default_negative_ratio_threshold")]
    pub negative_ratio_threshold: f32,
    #[serde(default = "default_auto_implement_threshold")]
    pub auto_implement_threshold: f32,
    #[serde(default = "default_window_days")]
    pub rolling_window_days: i64,
}

fn default_min_feedback() -> u32 {
    5
}
fn default_negative_ratio_threshold() -> f32 {
    0.3
}
fn default_auto_implement_threshold() -> f32 {
    0.9
}
fn default_window_days() -> i64 {
    30
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_feedback_for_suggestion: default_min_feedback(),
            negative_ratio_threshold: default_negative_ratio_threshold(),
            auto_implement_threshold: default_auto_implement_threshold(),
            rolling_window_days: default_window_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_cost_reference")]
    pub cost_reference_per_1k: f64,
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: f32,
    #[serde(default = "default_local_timeout_s")]
    pub local_timeout_s: u64,
    #[serde(default = "default_remote_timeout_s")]
    pub remote_timeout_s: u64,
    #[serde(default = "default_fact_check_timeout_s")]
    pub fact_check_timeout_s: u64,
}

fn default_cost_reference() -> f64 {
    0.03
}
fn default_latency_reference_ms() -> f32 {
    5000.0
}
fn default_local_timeout_s() -> u64 {
    60
}
fn default_remote_timeout_s() -> u64 {
    30
}
fn default_fact_check_timeout_s() -> u64 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cost_reference_per_1k: default_cost_reference(),
            latency_reference_ms: default_latency_reference_ms(),
            local_timeout_s: default_local_timeout_s(),
            remote_timeout_s: default_remote_timeout_s(),
            fact_check_timeout_s: default_fact_check_timeout_s(),
        }
    }
}
