//! Command-line surface (spec §6). A single flat `clap` derive struct,
//! matching the teacher's `Cli`/`#[derive(Parser)]` shape but without a
//! subcommand: this binary has exactly one mode of operation.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "occ-orchestrator")]
#[command(about = "HPC hyperparameter optimization orchestrator", long_about = None)]
#[command(rename_all = "snake_case")]
pub struct Cli {
    // ---- Required ----
    #[arg(long)]
    pub num_random_steps: Option<u64>,

    #[arg(long)]
    pub max_eval: u64,

    #[arg(long)]
    pub run_program: String,

    #[arg(long)]
    pub experiment_name: String,

    /// Directory under which `<experiment_name>/<N>/` run folders are
    /// created (spec §3).
    #[arg(long, default_value = "runs")]
    pub run_dir: PathBuf,

    #[arg(long)]
    pub mem_gb: u32,

    /// `NAME TYPE ...`, repeatable. Required for a fresh run; optional on
    /// `--continue_previous_job`, where it re-declares bounds against the
    /// parent run's space instead (narrowing is warned about, never applied
    /// silently — spec §4.2).
    #[arg(long = "parameter", num_args = 2..)]
    pub parameter: Vec<String>,

    #[arg(long)]
    pub continue_previous_job: Option<PathBuf>,

    /// `EXPR (<=|>=) EXPR`, repeatable.
    #[arg(long = "experiment_constraints")]
    pub experiment_constraints: Vec<String>,

    // ---- Objective ----
    #[arg(long, default_value_t = false)]
    pub maximize: bool,

    /// `name[=min|max] ...`
    #[arg(long = "result_names", num_args = 1..)]
    pub result_names: Vec<String>,

    // ---- Parallelism ----
    #[arg(long, default_value_t = 1)]
    pub num_parallel_jobs: usize,

    #[arg(long, default_value = "num_parallel_jobs")]
    pub max_parallelism: String,

    #[arg(long, default_value_t = false)]
    pub should_deduplicate: bool,

    // ---- Cluster ----
    #[arg(long)]
    pub partition: Option<String>,

    #[arg(long)]
    pub reservation: Option<String>,

    #[arg(long)]
    pub account: Option<String>,

    #[arg(long, default_value = "01:00:00")]
    pub time: String,

    #[arg(long, default_value_t = 0)]
    pub gpus: u32,

    #[arg(long, default_value_t = 1)]
    pub cpus_per_task: u32,

    #[arg(long, default_value_t = 1)]
    pub nodes_per_job: u32,

    #[arg(long, default_value_t = 60)]
    pub worker_timeout: u64,

    #[arg(long, default_value_t = 30)]
    pub slurm_signal_delay_s: u32,

    #[arg(long, default_value_t = false)]
    pub slurm_use_srun: bool,

    /// Comma-separated hostnames excluded from submission at startup.
    #[arg(long)]
    pub exclude: Option<String>,

    #[arg(long, default_value_t = false)]
    pub force_local_execution: bool,

    // ---- Model / strategy ----
    #[arg(long, value_enum, default_value_t = ModelKind::Sobol)]
    pub model: ModelKind,

    #[arg(long, default_value_t = false)]
    pub gridsearch: bool,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    #[arg(long, default_value_t = false)]
    pub enforce_sequential_optimization: bool,

    // ---- OCC ----
    #[arg(long, default_value_t = false)]
    pub occ: bool,

    #[arg(long, default_value = "euclid")]
    pub occ_type: String,

    #[arg(long, default_value_t = 2.0)]
    pub minkowski_p: f64,

    #[arg(long)]
    pub signed_weighted_euclidean_weights: Option<String>,

    // ---- Robustness ----
    #[arg(long)]
    pub orchestrator_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub auto_exclude_defective_hosts: bool,

    #[arg(long, default_value_t = 0)]
    pub max_nr_of_zero_results: u32,

    #[arg(long, default_value_t = false)]
    pub disable_search_space_exhaustion_detection: bool,

    // ---- Config files (mutually exclusive) ----
    #[arg(long, conflicts_with_all = ["config_toml", "config_json"])]
    pub config_yaml: Option<PathBuf>,

    #[arg(long, conflicts_with_all = ["config_yaml", "config_json"])]
    pub config_toml: Option<PathBuf>,

    #[arg(long, conflicts_with_all = ["config_yaml", "config_toml"])]
    pub config_json: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    #[value(name = "SOBOL")]
    Sobol,
    #[value(name = "GPEI")]
    Gpei,
    #[value(name = "FACTORIAL")]
    Factorial,
    #[value(name = "SAASBO")]
    Saasbo,
    #[value(name = "LEGACY_BOTORCH")]
    LegacyBotorch,
    #[value(name = "BOTORCH_MODULAR")]
    BotorchModular,
    #[value(name = "UNIFORM")]
    Uniform,
    #[value(name = "BO_MIXED")]
    BoMixed,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelKind::Sobol => "SOBOL",
            ModelKind::Gpei => "GPEI",
            ModelKind::Factorial => "FACTORIAL",
            ModelKind::Saasbo => "SAASBO",
            ModelKind::LegacyBotorch => "LEGACY_BOTORCH",
            ModelKind::BotorchModular => "BOTORCH_MODULAR",
            ModelKind::Uniform => "UNIFORM",
            ModelKind::BoMixed => "BO_MIXED",
        };
        write!(f, "{s}")
    }
}

/// One of `--config_yaml|--config_toml|--config_json`: applied first, then
/// any CLI flag the user also passed overrides its value (spec §6 — the
/// same "defaults, then override" shape the teacher uses for
/// `TelemetryConfig::from_env()` followed by CLI-flag overrides).
#[derive(Debug, Clone, serde::Deserialize, Default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub values: std::collections::BTreeMap<String, serde_json::Value>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| format!("invalid YAML config {}: {e}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| format!("invalid TOML config {}: {e}", path.display())),
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("invalid JSON config {}: {e}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
