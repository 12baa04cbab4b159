//! Agent process configuration (§10 "Configuration").
//!
//! Layered config: typed defaults, optionally overlaid by a TOML file,
//! then by environment variables, with `clap` filling in anything the
//! caller passed as a flag. This is the *agent binary's own* flags (work
//! dir, stop-file path, pool sizing) — the user-facing submission CLI
//! stays out of scope (§1).

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{JoshuaError, JoshuaResult};

/// What to do with a run's captured output directory (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveOn {
    Always,
    Failure,
    Never,
}

impl SaveOn {
    pub fn should_save(self, code: i32) -> bool {
        match self {
            SaveOn::Always => true,
            SaveOn::Never => false,
            SaveOn::Failure => code != 0,
        }
    }
}

impl std::str::FromStr for SaveOn {
    type Err = JoshuaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(SaveOn::Always),
            "failure" => Ok(SaveOn::Failure),
            "never" => Ok(SaveOn::Never),
            other => Err(JoshuaError::Config(format!("invalid save_on value: {other}"))),
        }
    }
}

/// One worker's run-loop configuration (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub work_dir: PathBuf,
    pub store_path: PathBuf,
    pub store_root: Vec<String>,
    #[serde(default = "default_save_on")]
    pub save_on: SaveOn,
    pub agent_timeout: Option<u64>,
    pub agent_idle_timeout: Option<u64>,
    #[serde(default = "default_sanity_period")]
    pub sanity_period: u64,
    #[serde(default = "default_timeout_command_timeout")]
    pub timeout_command_timeout: u64,
    pub stop_file: PathBuf,
}

fn default_save_on() -> SaveOn {
    SaveOn::Failure
}
fn default_sanity_period() -> u64 {
    3600
}
fn default_timeout_command_timeout() -> u64 {
    60
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            work_dir: PathBuf::from("/tmp/joshua/work"),
            store_path: PathBuf::from("/tmp/joshua/store"),
            store_root: vec!["joshua".to_string()],
            save_on: default_save_on(),
            agent_timeout: None,
            agent_idle_timeout: None,
            sanity_period: default_sanity_period(),
            timeout_command_timeout: default_timeout_command_timeout(),
            stop_file: PathBuf::from("/tmp/joshua/stop"),
        }
    }
}

impl AgentConfig {
    /// Layer defaults → optional TOML file → environment variables.
    pub fn load(toml_path: Option<&std::path::Path>) -> JoshuaResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AgentConfig::default()).map_err(config_err)?);
        if let Some(path) = toml_path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }
        builder = builder.add_source(config::Environment::with_prefix("JOSHUA_AGENT").separator("__"));
        builder.build().map_err(config_err)?.try_deserialize().map_err(config_err)
    }
}

fn config_err(e: config::ConfigError) -> JoshuaError {
    JoshuaError::Config(e.to_string())
}

/// Pool manager configuration (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_agents: Option<usize>,
    #[serde(default = "default_free_cpus")]
    pub free_cpus: usize,
    #[serde(default = "default_free_space_gib")]
    pub free_space_gib: f64,
    #[serde(default = "default_growth_rate")]
    pub growth_rate: u32,
    #[serde(default = "default_mgr_sleep")]
    pub mgr_sleep_secs: u64,
    #[serde(default = "default_death_wait")]
    pub death_wait_secs: u64,
    #[serde(default = "default_max_death_wait")]
    pub max_death_wait_secs: u64,
    #[serde(default = "default_report_freq")]
    pub report_freq_mins: u64,
    pub stop_file: PathBuf,
}

fn default_free_cpus() -> usize {
    0
}
fn default_free_space_gib() -> f64 {
    5.0
}
fn default_growth_rate() -> u32 {
    50
}
fn default_mgr_sleep() -> u64 {
    10
}
fn default_death_wait() -> u64 {
    30
}
fn default_max_death_wait() -> u64 {
    600
}
fn default_report_freq() -> u64 {
    15
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_agents: None,
            free_cpus: default_free_cpus(),
            free_space_gib: default_free_space_gib(),
            growth_rate: default_growth_rate(),
            mgr_sleep_secs: default_mgr_sleep(),
            death_wait_secs: default_death_wait(),
            max_death_wait_secs: default_max_death_wait(),
            report_freq_mins: default_report_freq(),
            stop_file: PathBuf::from("/tmp/joshua/stop"),
        }
    }
}

impl PoolConfig {
    pub fn target_max_agents(&self) -> usize {
        self.max_agents
            .unwrap_or_else(|| num_cpus::get().saturating_sub(self.free_cpus).max(1))
    }
}

/// `joshua-agent` process flags (§10). Values here override config-file
/// and environment values when explicitly passed.
#[derive(Debug, Parser)]
#[command(name = "joshua-agent", about = "Joshua work-stealing test-run agent")]
pub struct AgentArgs {
    /// Path to a TOML config file layering over the built-in defaults.
    #[arg(long, env = "JOSHUA_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "JOSHUA_AGENT_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    #[arg(long, env = "JOSHUA_AGENT_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    #[arg(long, env = "JOSHUA_AGENT_STOP_FILE")]
    pub stop_file: Option<PathBuf>,

    #[arg(long, env = "JOSHUA_AGENT_MAX_AGENTS")]
    pub max_agents: Option<usize>,

    #[arg(long, env = "JOSHUA_AGENT_SAVE_ON", value_enum)]
    pub save_on: Option<SaveOn>,
}

impl clap::ValueEnum for SaveOn {
    fn value_variants<'a>() -> &'a [Self] {
        &[SaveOn::Always, SaveOn::Failure, SaveOn::Never]
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(match self {
            SaveOn::Always => "always",
            SaveOn::Failure => "failure",
            SaveOn::Never => "never",
        }))
    }
}

impl AgentArgs {
    /// Apply any explicitly-passed flags on top of a loaded `AgentConfig`
    /// — flags win over TOML/env, the more common CLI convention.
    pub fn apply_to(&self, mut cfg: AgentConfig) -> AgentConfig {
        if let Some(w) = &self.work_dir {
            cfg.work_dir = w.clone();
        }
        if let Some(s) = &self.store_path {
            cfg.store_path = s.clone();
        }
        if let Some(s) = &self.stop_file {
            cfg.stop_file = s.clone();
        }
        if let Some(s) = self.save_on {
            cfg.save_on = s;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case::test_case(SaveOn::Failure, 0, false; "failure policy skips a clean exit")]
    #[test_case::test_case(SaveOn::Failure, 1, true; "failure policy saves a non-zero exit")]
    #[test_case::test_case(SaveOn::Failure, -1, true; "failure policy saves a negative (signal) exit")]
    #[test_case::test_case(SaveOn::Always, 0, true; "always policy saves a clean exit too")]
    #[test_case::test_case(SaveOn::Never, 1, false; "never policy skips even a failing exit")]
    fn should_save_matches_policy(policy: SaveOn, code: i32, expected: bool) {
        assert_eq!(policy.should_save(code), expected);
    }

    #[test]
    fn default_agent_config_loads_without_a_file() {
        let cfg = AgentConfig::load(None).unwrap();
        assert_eq!(cfg.sanity_period, 3600);
    }

    #[test]
    fn pool_config_defaults_to_cpu_count_minus_free_cpus() {
        let cfg = PoolConfig::default();
        assert!(cfg.target_max_agents() >= 1);
    }
}
