//! Entry point: parses the CLI, resolves a fresh-run or continuation
//! experiment, wires the trial source/executor/dispatcher together, and
//! reports the result. One async `run` function, one terminal exit point
//! (spec §7), matching the teacher's `main` shape of "parse, delegate,
//! exit through a single function."

mod cli;
mod dispatcher;
mod errors;
mod executor;
mod model;
mod orchestrator;
mod paramspace;
mod progress;
mod results;
mod store;
mod telemetry;
mod trialsource;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use cli::{Cli, FileConfig, ModelKind};
use dispatcher::{Dispatcher, DispatcherConfig, TerminationReason};
use errors::OrchestratorError;
use executor::cluster::{ClusterExecutor, ClusterResources};
use executor::local::LocalExecutor;
use executor::JobExecutor;
use model::{Direction, GenerationMethod, IndexAllocator, ResultEntry, ResultSpec};
use orchestrator::OrchestratorRules;
use paramspace::{parse_cli_parameters, Constraint, ParameterSpace};
use progress::{best_result_table, write_failed_job_tables};
use results::occ::{self, OccFormula};
use store::{ExperimentStore, RunLayout};
use trialsource::grid::GridSource;
use trialsource::import::import_from_parent;
use trialsource::sobol::SobolSource;
use trialsource::TrialSource;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let telemetry_config = telemetry::TelemetryConfig::from_env();
    let _ = telemetry::init_telemetry(&telemetry_config);
    telemetry::print_banner_if_enabled(&telemetry_config);

    let on_cluster = !cli.force_local_execution;
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            warn!(error = %err, "run failed");
            err.exit_code()
        }
    };
    errors::terminate(code, on_cluster)
}

async fn run(mut cli: Cli) -> Result<i32, OrchestratorError> {
    if let Some(path) = config_file_path(&cli) {
        let file = FileConfig::load(&path).map_err(OrchestratorError::ConfigParse)?;
        apply_file_config(&mut cli, &file);
    }

    if cli.parameter.is_empty() && cli.continue_previous_job.is_none() {
        return Err(OrchestratorError::MissingRequiredArgument(
            "one of --parameter or --continue_previous_job is required".to_string(),
        ));
    }

    let run_program = executor::decode_run_program(&cli.run_program);
    let result_spec = build_result_spec(&cli)?;
    let directions: BTreeMap<String, Direction> = result_spec
        .entries
        .iter()
        .map(|e| (e.name.clone(), e.direction))
        .collect();
    let result_names: Vec<String> = result_spec.names().map(str::to_string).collect();
    let run_uuid = resolve_run_uuid()?;

    let (store, generation_method) = if let Some(parent_path) = cli.continue_previous_job.clone() {
        let layout = RunLayout::new(parent_path);
        if !layout.exists() {
            return Err(OrchestratorError::ContinuationFolderMissing(
                layout.root().display().to_string(),
            ));
        }
        let store = ExperimentStore::load_from(layout, run_uuid.clone()).await?;
        let loaded_space = store.parameter_space().await;

        let mut effective_space = if !cli.parameter.is_empty() {
            let redeclared = parse_declared_space(&cli, &result_names)?;
            let narrowed = redeclared.narrowed_from(&loaded_space);
            if !narrowed.is_empty() {
                warn!(
                    parameters = ?narrowed,
                    "continuation declared narrower bounds than the parent run"
                );
            }
            redeclared
        } else {
            loaded_space
        };
        let observed = observed_bounds(&store.trials_snapshot().await);
        effective_space.widen_to_observed(&observed);
        store.set_parameter_space(effective_space).await?;

        let method = match cli.model {
            ModelKind::Sobol => GenerationMethod::Sobol,
            ModelKind::Factorial => GenerationMethod::Grid,
            other => return Err(OrchestratorError::UnsupportedModel(other.to_string())),
        };
        (store, method)
    } else {
        if cli.num_random_steps.is_none() {
            return Err(OrchestratorError::NoRandomStepsFreshRun);
        }
        let mut space = parse_declared_space(&cli, &result_names)?;
        let use_grid = cli.gridsearch || matches!(cli.model, ModelKind::Factorial);
        if use_grid {
            space = space.into_gridsearch(cli.max_eval as usize);
        }
        let method = match cli.model {
            ModelKind::Sobol => GenerationMethod::Sobol,
            ModelKind::Factorial => GenerationMethod::Grid,
            other => return Err(OrchestratorError::UnsupportedModel(other.to_string())),
        };

        let layout = RunLayout::next_available(&cli.run_dir, &cli.experiment_name);
        if layout.exists() {
            return Err(OrchestratorError::RunFolderExists(
                layout.root().display().to_string(),
            ));
        }
        let store = ExperimentStore::create(layout, run_uuid.clone(), space).await?;
        write_global_vars(&store, &cli, &run_program, &result_spec).await?;
        (store, method)
    };

    let space = store.parameter_space().await;
    let parallelism = resolve_max_parallelism(&cli);

    let source: Arc<Mutex<dyn TrialSource>> = match cli.model {
        ModelKind::Sobol => {
            let capacity = std::cmp::max(parallelism as u64, cli.num_random_steps.unwrap_or(0)) as usize;
            Arc::new(Mutex::new(SobolSource::new(
                space.clone(),
                capacity,
                cli.seed,
                cli.should_deduplicate,
            )))
        }
        ModelKind::Factorial => Arc::new(Mutex::new(GridSource::new(&space))),
        other => return Err(OrchestratorError::UnsupportedModel(other.to_string())),
    };

    let imported = if cli.continue_previous_job.is_some() {
        let parent_trials = store.trials_snapshot().await;
        // A throwaway allocator: priming the source's internal dedup /
        // produced-quota bookkeeping must not burn indices from the
        // store's real, gapless sequence (spec §8).
        let priming_allocator = IndexAllocator::starting_at(0);
        let mut source_guard = source.lock().await;
        let (counters, restored) =
            import_from_parent(&parent_trials, &mut *source_guard, &priming_allocator)
                .await
                .map_err(|e| OrchestratorError::CheckpointMissing(e.to_string()))?;
        drop(source_guard);
        info!(
            restored = counters.restored,
            double_hash_skipped = counters.double_hash_skipped,
            missing_result_skipped = counters.missing_result_skipped,
            "imported trials from parent run"
        );
        restored.len() as u64
    } else {
        0
    };

    let rules = match &cli.orchestrator_file {
        Some(path) => Some(OrchestratorRules::load(path).map_err(OrchestratorError::OrchestratorFileInvalid)?),
        None => None,
    };

    let mut initial_excluded_hosts: Vec<String> = cli
        .exclude
        .as_deref()
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    if cli.auto_exclude_defective_hosts {
        if let Ok(contents) = tokio::fs::read_to_string(store.layout().defective_nodes()).await {
            for host in contents.lines().map(str::trim).filter(|s| !s.is_empty()) {
                if !initial_excluded_hosts.iter().any(|h| h == host) {
                    initial_excluded_hosts.push(host.to_string());
                }
            }
        }
    }

    let executor: Arc<dyn JobExecutor> = if cli.force_local_execution {
        Arc::new(LocalExecutor::new())
    } else {
        Arc::new(ClusterExecutor::new(ClusterResources {
            cores: cli.cpus_per_task,
            mem_gb: cli.mem_gb,
            gpus: cli.gpus,
            wall_time: cli.time.clone(),
            nodes: cli.nodes_per_job,
            signal_delay_s: cli.slurm_signal_delay_s,
            partition: cli.partition.clone(),
            account: cli.account.clone(),
            reservation: cli.reservation.clone(),
            use_srun: cli.slurm_use_srun,
        }))
    };
    executor.update_excluded_hosts(initial_excluded_hosts.clone()).await;

    let dispatcher_config = DispatcherConfig {
        parallelism,
        max_eval: cli.max_eval,
        imported,
        run_program,
        result_names: result_names.clone(),
        directions: directions.clone(),
        exhaustion_threshold: dispatcher::DEFAULT_EXHAUSTION_THRESHOLD,
        exhaustion_detection_disabled: cli.disable_search_space_exhaustion_detection,
        on_cluster: !cli.force_local_execution,
        generation_method,
    };

    let dispatcher = Dispatcher::new(
        dispatcher_config,
        &store,
        executor,
        source,
        rules,
        initial_excluded_hosts,
    );

    let outcome = dispatcher.run().await?;

    let final_excluded = dispatcher.excluded_hosts_snapshot().await;
    if !final_excluded.is_empty() {
        let _ = tokio::fs::write(store.layout().defective_nodes(), final_excluded.join("\n")).await;
    }

    let trials = store.trials_snapshot().await;
    if cli.occ {
        if let Err(err) = report_occ(&trials, &result_names, &cli) {
            warn!(error = %err, "failed to compute OCC column");
        }
    }

    let best_rows = best_result_table(&trials, &directions);
    for row in &best_rows {
        info!(result = %row.result_name, best_value = row.best_value, trial_index = row.trial_index, "best result");
    }
    if let Err(err) = write_failed_job_tables(store.layout(), &trials) {
        warn!(error = %err, "failed to write failed-jobs table");
    }
    if let Err(err) = outcome.worker_usage.flush(store.layout()) {
        warn!(error = %err, "failed to flush worker-usage samples");
    }

    Ok(match outcome.termination {
        TerminationReason::MaxEvalReached
        | TerminationReason::ProgressTotalReached
        | TerminationReason::GeneratorComplete => 0,
        TerminationReason::SearchSpaceExhausted => {
            let completed = trials.iter().filter(|t| t.status == model::TrialStatus::Completed).count() as u64;
            OrchestratorError::SearchSpaceExhausted {
                completed,
                max_eval: cli.max_eval,
            }
            .exit_code()
        }
        TerminationReason::Signal(kind) => {
            let signal = match kind {
                dispatcher::SignalKind::Int => errors::Signal::Int,
                dispatcher::SignalKind::Usr1 => errors::Signal::Usr1,
                dispatcher::SignalKind::Cont => errors::Signal::Cont,
            };
            signal.exit_code()
        }
    })
}

fn config_file_path(cli: &Cli) -> Option<PathBuf> {
    cli.config_yaml
        .clone()
        .or_else(|| cli.config_toml.clone())
        .or_else(|| cli.config_json.clone())
}

/// Config-file values only fill in CLI fields the user left at their
/// `Option::None` or empty-`Vec` default; any concrete CLI flag (including
/// one sitting at a non-`Option` clap default) takes precedence. Simpler
/// than introspecting `ArgMatches` for "was this flag explicitly passed,"
/// and the failure mode (a config value silently losing to a clap default
/// the user didn't ask for) is limited to fields with library defaults
/// rather than user-declared settings.
fn apply_file_config(cli: &mut Cli, file: &FileConfig) {
    use serde_json::Value;

    let get_str = |key: &str| file.values.get(key).and_then(Value::as_str).map(str::to_string);
    let get_str_list = |key: &str| -> Option<Vec<String>> {
        file.values.get(key).and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    };

    if cli.parameter.is_empty() {
        if let Some(values) = get_str_list("parameter") {
            cli.parameter = values;
        }
    }
    if cli.result_names.is_empty() {
        if let Some(values) = get_str_list("result_names") {
            cli.result_names = values;
        }
    }
    if cli.experiment_constraints.is_empty() {
        if let Some(values) = get_str_list("experiment_constraints") {
            cli.experiment_constraints = values;
        }
    }
    if cli.continue_previous_job.is_none() {
        if let Some(v) = get_str("continue_previous_job") {
            cli.continue_previous_job = Some(PathBuf::from(v));
        }
    }
    if cli.orchestrator_file.is_none() {
        if let Some(v) = get_str("orchestrator_file") {
            cli.orchestrator_file = Some(PathBuf::from(v));
        }
    }
    if cli.partition.is_none() {
        cli.partition = get_str("partition");
    }
    if cli.account.is_none() {
        cli.account = get_str("account");
    }
    if cli.reservation.is_none() {
        cli.reservation = get_str("reservation");
    }
    if cli.exclude.is_none() {
        cli.exclude = get_str("exclude");
    }
    if cli.signed_weighted_euclidean_weights.is_none() {
        cli.signed_weighted_euclidean_weights = get_str("signed_weighted_euclidean_weights");
    }
    if cli.num_random_steps.is_none() {
        if let Some(v) = file.values.get("num_random_steps").and_then(Value::as_u64) {
            cli.num_random_steps = Some(v);
        }
    }
}

/// Parses `--parameter`/`--experiment_constraints` into a validated space,
/// shared by the fresh-run path and the continuation re-declaration path
/// (spec §4.2).
fn parse_declared_space(cli: &Cli, result_names: &[String]) -> Result<ParameterSpace, OrchestratorError> {
    let parameters = parse_cli_parameters(&cli.parameter).map_err(OrchestratorError::ParameterDefinition)?;
    let constraints = cli
        .experiment_constraints
        .iter()
        .map(|raw| Constraint::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(OrchestratorError::ParameterDefinition)?;
    ParameterSpace::new(parameters, constraints, result_names).map_err(OrchestratorError::ParameterDefinition)
}

/// Per-parameter observed min/max across every historical trial's arm, fed
/// into `ParameterSpace::widen_to_observed` on continuation (spec §4.2).
fn observed_bounds(trials: &[model::Trial]) -> BTreeMap<String, (f64, f64)> {
    let mut bounds: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for trial in trials {
        for (name, value) in &trial.arm {
            let Some(v) = value.as_f64() else { continue };
            bounds
                .entry(name.clone())
                .and_modify(|(min, max)| {
                    if v < *min {
                        *min = v;
                    }
                    if v > *max {
                        *max = v;
                    }
                })
                .or_insert((v, v));
        }
    }
    bounds
}

fn build_result_spec(cli: &Cli) -> Result<ResultSpec, OrchestratorError> {
    let default_direction = if cli.maximize {
        Direction::Maximize
    } else {
        Direction::Minimize
    };
    let names = if cli.result_names.is_empty() {
        vec!["RESULT".to_string()]
    } else {
        cli.result_names.clone()
    };

    let mut entries = Vec::with_capacity(names.len());
    for raw in names {
        let (name, direction) = match raw.split_once('=') {
            Some((n, "min")) => (n.to_string(), Direction::Minimize),
            Some((n, "max")) => (n.to_string(), Direction::Maximize),
            Some((n, other)) => {
                return Err(OrchestratorError::ParameterDefinition(format!(
                    "result name '{n}' has invalid direction suffix '{other}'"
                )))
            }
            None => (raw, default_direction),
        };
        entries.push(ResultEntry { name, direction });
    }
    Ok(ResultSpec { entries })
}

/// Validates `RUN_UUID` if the caller (typically a resubmission wrapper)
/// set one, otherwise mints a fresh v4 (spec §4.1).
fn resolve_run_uuid() -> Result<String, OrchestratorError> {
    match std::env::var("RUN_UUID") {
        Ok(val) if !val.is_empty() => {
            let parsed = uuid::Uuid::parse_str(&val).map_err(|_| {
                OrchestratorError::ConfigParse(format!("RUN_UUID '{val}' is not a valid UUID"))
            })?;
            if parsed.get_version_num() != 4 {
                return Err(OrchestratorError::ConfigParse(format!(
                    "RUN_UUID '{val}' is not a UUIDv4"
                )));
            }
            Ok(val)
        }
        _ => Ok(uuid::Uuid::new_v4().to_string()),
    }
}

/// `--max_parallelism` only bounds a real Bayesian generation phase this
/// crate does not implement (spec §2 Non-goal); kept for CLI-surface and
/// logging fidelity, resolving to `num_parallel_jobs` whenever it isn't a
/// concrete override.
fn resolve_max_parallelism(cli: &Cli) -> usize {
    match cli.max_parallelism.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => cli.num_parallel_jobs.max(1),
    }
}

async fn write_global_vars(
    store: &ExperimentStore,
    cli: &Cli,
    run_program: &str,
    result_spec: &ResultSpec,
) -> Result<(), OrchestratorError> {
    let doc = serde_json::json!({
        "experiment_name": cli.experiment_name,
        "run_program": run_program,
        "mem_gb": cli.mem_gb,
        "time": cli.time,
        "num_parallel_jobs": cli.num_parallel_jobs,
        "model": cli.model.to_string(),
    });
    let json = serde_json::to_string_pretty(&doc)
        .map_err(|e| OrchestratorError::ConfigParse(format!("failed to serialize global_vars.json: {e}")))?;
    tokio::fs::write(store.layout().global_vars(), json)
        .await
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

    let env_dump = std::env::vars()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(store.layout().env_snapshot(), env_dump)
        .await
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

    let result_names = result_spec.names().collect::<Vec<_>>().join("\n");
    tokio::fs::write(store.layout().result_names_file(), result_names)
        .await
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

    let result_min_max = result_spec
        .entries
        .iter()
        .map(|e| {
            let direction = match e.direction {
                Direction::Minimize => "min",
                Direction::Maximize => "max",
            };
            format!("{}: {direction}", e.name)
        })
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(store.layout().result_min_max_file(), result_min_max)
        .await
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

    Ok(())
}

/// Computes the post-hoc `"occ"` scalarization column over completed
/// trials (spec §4.7). There is no real Bayesian step in this crate for
/// OCC to steer, so it is reported rather than optimized against — an
/// explicit simplification, not a silent no-op of `--occ`.
fn report_occ(trials: &[model::Trial], result_names: &[String], cli: &Cli) -> Result<(), String> {
    if result_names.len() < 2 {
        return Ok(());
    }
    let formula = OccFormula::parse(&cli.occ_type)?;
    let weights = cli
        .signed_weighted_euclidean_weights
        .as_deref()
        .map(|spec| occ::parse_weights(spec, result_names.len()))
        .unwrap_or_else(|| vec![1.0; result_names.len()]);

    for trial in trials {
        if trial.status != model::TrialStatus::Completed {
            continue;
        }
        let values: Vec<f64> = result_names
            .iter()
            .map(|name| trial.raw_results.get(name).copied().unwrap_or(0.0))
            .collect();
        let score = occ::evaluate(formula, &values, cli.minkowski_p, &weights)?;
        info!(trial_index = trial.index, occ = score, "occ");
    }
    Ok(())
}
