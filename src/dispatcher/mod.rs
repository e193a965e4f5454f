//! Dispatcher / Control Loop (spec §4.5): the bounded-parallelism pump
//! driving the whole run. Grounded in the teacher's `planner::DagPlanner`
//! (a `tokio::sync::Semaphore` + `tokio::task::JoinSet` bounded executor
//! over a dependency graph), generalized here from a static DAG to an
//! open-ended pump that keeps asking the Trial Source for more work until
//! one of the termination conditions fires.

pub mod shutdown;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::warn;

use crate::errors::{OrchestratorError, Signal};
use crate::executor::{substitute_placeholders, Job, JobExecutor, JobOutcome};
use crate::model::{Arm, Direction, GenerationMethod, TrialIndex};
use crate::orchestrator::{decide, OrchestratorRules, PendingCheck, PendingChecks, PolicyDecision};
use crate::progress::WorkerUsageTracker;
use crate::results::{all_results_found, parse_output, resolve_with_sentinel};
use crate::store::{CounterFile, ExperimentStore};
use crate::trialsource::{GenerationOutcome, TrialSource};

/// Disabled via `--disable_search_space_exhaustion_detection`; default 20
/// per spec §4.5.
pub const DEFAULT_EXHAUSTION_THRESHOLD: usize = 20;

pub struct DispatcherConfig {
    pub parallelism: usize,
    pub max_eval: u64,
    pub imported: u64,
    pub run_program: String,
    pub result_names: Vec<String>,
    pub directions: BTreeMap<String, Direction>,
    pub exhaustion_threshold: usize,
    pub exhaustion_detection_disabled: bool,
    pub on_cluster: bool,
    /// Tag recorded on every trial this dispatcher submits. Set by the
    /// caller to match whichever `TrialSource` is wired in (spec §3's
    /// generation-method identity field isn't carried on
    /// `GenerationOutcome` itself, since the source may delegate to an
    /// out-of-scope model backend).
    pub generation_method: GenerationMethod,
}

impl DispatcherConfig {
    /// "progress_total" (spec §4.5) is the total number of trials the run
    /// plans to reach, counting trials restored from a previous run.
    fn progress_total(&self) -> u64 {
        self.max_eval + self.imported
    }

    /// Which phase counter a freshly generated trial counts against (spec
    /// §3, §4.8): the Sobol warm-up step is "random", everything else
    /// (grid or model-driven) is "systematic".
    fn phase_counter_name(&self) -> &'static str {
        match self.generation_method {
            GenerationMethod::Sobol => "phase_random_steps",
            _ => "phase_systematic_steps",
        }
    }
}

struct Outstanding {
    trial_index: TrialIndex,
    arm: Arm,
    job: Job,
}

pub struct DispatcherOutcome {
    pub termination: TerminationReason,
    pub worker_usage: WorkerUsageTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxEvalReached,
    ProgressTotalReached,
    GeneratorComplete,
    SearchSpaceExhausted,
    Signal(SignalKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Int,
    Usr1,
    Cont,
}

/// What a `finalize` call found out about the trial it just closed out.
struct FinalizeResult {
    completed_delta: u64,
    /// Set when the orchestrator policy decided the arm should run again,
    /// either on the same pool of hosts (`Restart`) or with the offending
    /// host now excluded (`RestartOnDifferentNode`) — spec §4.6.
    resubmit: Option<Arm>,
}

pub struct Dispatcher<'a> {
    config: DispatcherConfig,
    store: &'a ExperimentStore,
    executor: Arc<dyn JobExecutor>,
    source: Arc<Mutex<dyn TrialSource + 'a>>,
    rules: Option<OrchestratorRules>,
    excluded_hosts: Mutex<Vec<String>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: DispatcherConfig,
        store: &'a ExperimentStore,
        executor: Arc<dyn JobExecutor>,
        source: Arc<Mutex<dyn TrialSource + 'a>>,
        rules: Option<OrchestratorRules>,
        initial_excluded_hosts: Vec<String>,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            source,
            rules,
            excluded_hosts: Mutex::new(initial_excluded_hosts),
        }
    }

    pub async fn excluded_hosts_snapshot(&self) -> Vec<String> {
        self.excluded_hosts.lock().await.clone()
    }

    pub async fn run(&self) -> Result<DispatcherOutcome, OrchestratorError> {
        let mut signals = shutdown::spawn_signal_listener();
        let mut outstanding: BTreeMap<String, Outstanding> = BTreeMap::new();
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let (done_tx, mut done_rx) = mpsc::channel::<(String, JobOutcome)>(self.config.parallelism.max(1) * 2);
        let mut pending_checks = PendingChecks::default();

        let mut submitted: u64 = 0;
        let mut completed: u64 = 0;
        let mut exhaustion_counter = 0usize;
        let mut worker_usage = WorkerUsageTracker::default();

        let termination = loop {
            if let Ok(signal) = signals.try_recv() {
                self.abandon_all(&mut outstanding).await;
                return Ok(DispatcherOutcome {
                    termination: TerminationReason::Signal(match signal {
                        Signal::Int => SignalKind::Int,
                        Signal::Usr1 => SignalKind::Usr1,
                        Signal::Cont => SignalKind::Cont,
                    }),
                    worker_usage,
                });
            }

            // Step 1: finalize any done jobs.
            while let Ok((job_id, outcome)) = done_rx.try_recv() {
                if let Some(job) = outstanding.remove(&job_id) {
                    let stdout_path = job.job.working_dir.join("stdout.log");
                    let defer_policy =
                        self.rules.is_some() && outcome.stdout.is_empty() && !stdout_path.exists();
                    if defer_policy {
                        pending_checks.push(PendingCheck {
                            trial_index: job.trial_index,
                            arm: job.arm.clone(),
                            stdout_path,
                        });
                    }
                    let result = self.finalize(&job, outcome, !defer_policy).await?;
                    completed += result.completed_delta;
                    self.handle_resubmit(result.resubmit, &mut outstanding, &done_tx, &semaphore, &mut submitted)
                        .await?;
                }
            }

            // Step 1b: drain deferred orchestrator-policy checks now that
            // their stdout file may have appeared (spec §4.6).
            for ready in pending_checks.drain_ready() {
                if let Some(rules) = &self.rules {
                    let stdout = tokio::fs::read_to_string(&ready.stdout_path).await.unwrap_or_default();
                    let decision = decide(rules, &stdout, "", None, ready.trial_index, &ready.arm);
                    let resubmit = self.apply_policy_decision(decision).await;
                    self.handle_resubmit(resubmit, &mut outstanding, &done_tx, &semaphore, &mut submitted)
                        .await?;
                }
            }

            worker_usage.record(outstanding.len(), self.config.parallelism.max(1));

            let target_total = (self.config.max_eval + self.config.imported) as i64;
            let completed_i = completed as i64;
            let submitted_i = submitted as i64;

            if completed >= self.config.max_eval {
                break TerminationReason::MaxEvalReached;
            }
            if submitted_i >= self.config.progress_total() as i64 + 1 {
                break TerminationReason::ProgressTotalReached;
            }
            if submitted > self.config.max_eval + 1 {
                break TerminationReason::ProgressTotalReached;
            }
            if target_total == completed_i {
                break TerminationReason::MaxEvalReached;
            }

            // Step 2: desired number of new trials.
            let desired = std::cmp::min(
                self.config.parallelism.saturating_sub(outstanding.len()) as i64,
                std::cmp::min(target_total - submitted_i, target_total - completed_i),
            );

            if desired <= 0 {
                if outstanding.is_empty() {
                    exhaustion_counter += 1;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            // Step 3: ask the Trial Source, one at a time (serialized).
            let mut fetched: Vec<(TrialIndex, Arm)> = Vec::new();
            let mut generator_done = false;
            {
                let mut source = self.source.lock().await;
                while (fetched.len() as i64) < desired {
                    match source.next(1, self.store.allocator()).await {
                        Ok(GenerationOutcome::Trials(mut batch)) if !batch.is_empty() => {
                            fetched.append(&mut batch);
                        }
                        Ok(_) => {
                            generator_done = true;
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "trial source returned an error; treating as exhausted");
                            generator_done = true;
                            break;
                        }
                    }
                }
            }

            if fetched.is_empty() && outstanding.is_empty() {
                exhaustion_counter += 1;
            } else {
                exhaustion_counter = 0;
            }

            if !self.config.exhaustion_detection_disabled
                && exhaustion_counter >= self.config.exhaustion_threshold
            {
                self.abandon_all(&mut outstanding).await;
                return Ok(DispatcherOutcome {
                    termination: TerminationReason::SearchSpaceExhausted,
                    worker_usage,
                });
            }

            // Step 4: submit each fetched trial.
            for (trial_index, arm) in fetched {
                submitted += 1;
                match self.submit_trial(trial_index, arm.clone()).await? {
                    Some(job) => {
                        let job_id = job.id.clone();
                        outstanding.insert(
                            job_id.clone(),
                            Outstanding {
                                trial_index,
                                arm,
                                job: job.clone(),
                            },
                        );
                        self.spawn_poll(job, job_id, done_tx.clone(), semaphore.clone());
                    }
                    None => continue,
                }
            }

            if generator_done && outstanding.is_empty() && fetched.is_empty() {
                break TerminationReason::GeneratorComplete;
            }
        };

        // Drain outstanding jobs before reporting (spec §4.5). The run is
        // ending, so a restart request surfaces as a warning rather than
        // spawning new work.
        while !outstanding.is_empty() {
            if let Some((job_id, outcome)) = done_rx.recv().await {
                if let Some(job) = outstanding.remove(&job_id) {
                    let trial_index = job.trial_index;
                    let result = self.finalize(&job, outcome, true).await?;
                    if result.resubmit.is_some() {
                        warn!(trial_index, "orchestrator requested a restart during shutdown drain; skipping resubmission");
                    }
                }
            }
        }
        for ready in pending_checks.drain_ready() {
            if let Some(rules) = &self.rules {
                let stdout = tokio::fs::read_to_string(&ready.stdout_path).await.unwrap_or_default();
                let decision = decide(rules, &stdout, "", None, ready.trial_index, &ready.arm);
                if self.apply_policy_decision(decision).await.is_some() {
                    warn!(trial_index = ready.trial_index, "orchestrator requested a restart for a deferred check after run end; skipping");
                }
            }
        }

        let _ = self.store.snapshot().await;
        Ok(DispatcherOutcome {
            termination,
            worker_usage,
        })
    }

    fn spawn_poll(&self, job: Job, job_id: String, done_tx: mpsc::Sender<(String, JobOutcome)>, semaphore: Arc<Semaphore>) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            match executor.result(&job).await {
                Ok(outcome) => {
                    let _ = done_tx.send((job_id, outcome)).await;
                }
                Err(err) => {
                    warn!(error = %err, job_id, "job result future failed");
                    let _ = done_tx
                        .send((
                            job_id,
                            JobOutcome {
                                stdout: String::new(),
                                stderr: err.to_string(),
                                exit_code: None,
                                signal: None,
                                hostname: None,
                            },
                        ))
                        .await;
                }
            }
        });
    }

    /// Attaches, submits, and marks a trial running. Returns `None` (after
    /// recording the trial as failed) when the executor itself rejects the
    /// submission, so one bad submission never kills the whole run.
    async fn submit_trial(&self, trial_index: TrialIndex, arm: Arm) -> Result<Option<Job>, OrchestratorError> {
        self.store
            .attach_trial(trial_index, arm.clone(), self.config.generation_method.clone())
            .await?;
        let _ = CounterFile::new(self.store.layout().counter_file(self.config.phase_counter_name()))
            .increment()
            .await;

        let command = substitute_placeholders(&self.config.run_program, &arm);
        let working_dir = self.store.layout().single_run_dir(&trial_index.to_string());
        match self.executor.submit(&command, working_dir).await {
            Ok(job) => {
                self.store.mark_running(trial_index, None).await?;
                let _ = CounterFile::new(self.store.layout().counter_file("submitted_jobs")).increment().await;
                Ok(Some(job))
            }
            Err(err) => {
                warn!(error = %err, trial_index, "failed to submit job");
                self.store.fail_trial(trial_index, None, None).await?;
                let _ = CounterFile::new(self.store.layout().counter_file("failed_jobs")).increment().await;
                Ok(None)
            }
        }
    }

    /// Allocates a fresh trial index for a restart decision and submits it,
    /// inserting it into `outstanding` like any normally generated trial
    /// (spec §4.6): the original trial stays terminal in the store, the
    /// restart is tracked as a new one.
    async fn handle_resubmit(
        &self,
        resubmit: Option<Arm>,
        outstanding: &mut BTreeMap<String, Outstanding>,
        done_tx: &mpsc::Sender<(String, JobOutcome)>,
        semaphore: &Arc<Semaphore>,
        submitted: &mut u64,
    ) -> Result<(), OrchestratorError> {
        let Some(arm) = resubmit else {
            return Ok(());
        };
        let trial_index = self.store.allocator().allocate();
        *submitted += 1;
        if let Some(job) = self.submit_trial(trial_index, arm.clone()).await? {
            let job_id = job.id.clone();
            outstanding.insert(
                job_id.clone(),
                Outstanding {
                    trial_index,
                    arm,
                    job: job.clone(),
                },
            );
            self.spawn_poll(job, job_id, done_tx.clone(), semaphore.clone());
        }
        Ok(())
    }

    /// Applies an orchestrator policy decision: exclusion is acted on
    /// immediately, restart decisions are handed back to the caller as an
    /// arm to resubmit (spec §4.6 table).
    async fn apply_policy_decision(&self, decision: PolicyDecision) -> Option<Arm> {
        match decision {
            PolicyDecision::ExcludeNode { hostname } | PolicyDecision::ExcludeNodeOnly { hostname, .. } => {
                self.exclude_host(hostname).await;
                None
            }
            PolicyDecision::Restart { arm, .. } => Some(arm),
            PolicyDecision::RestartOnDifferentNode { hostname, arm, .. } => {
                self.exclude_host(hostname).await;
                Some(arm)
            }
            PolicyDecision::NoMatch => None,
        }
    }

    async fn exclude_host(&self, hostname: Option<String>) {
        let Some(host) = hostname else {
            return;
        };
        let mut excluded = self.excluded_hosts.lock().await;
        if !excluded.contains(&host) {
            excluded.push(host);
        }
        self.executor.update_excluded_hosts(excluded.clone()).await;
    }

    /// Ingests a terminated job's result, applies orchestrator policy
    /// (unless deferred by the caller because the stdout file wasn't ready
    /// yet), informs the Trial Source via `observe` so its bookkeeping
    /// reflects the outcome before the next snapshot (spec §4.5, §5's
    /// ordering guarantee), and updates the store.
    async fn finalize(&self, outstanding: &Outstanding, outcome: JobOutcome, apply_policy: bool) -> Result<FinalizeResult, OrchestratorError> {
        let parsed = parse_output(&outcome.stdout, &self.config.result_names);
        let succeeded = outcome.exit_code == Some(0) && all_results_found(&parsed);

        let mut resubmit = None;
        if apply_policy {
            if let Some(rules) = &self.rules {
                let decision = decide(
                    rules,
                    &outcome.stdout,
                    &outcome.stderr,
                    outcome.hostname.clone(),
                    outstanding.trial_index,
                    &outstanding.arm,
                );
                resubmit = self.apply_policy_decision(decision).await;
            }
        }

        if succeeded {
            let resolved = resolve_with_sentinel(&parsed, &self.config.directions);
            self.store
                .complete_trial(outstanding.trial_index, resolved.clone(), outcome.exit_code)
                .await?;
            let _ = CounterFile::new(self.store.layout().counter_file("succeeded_jobs")).increment().await;
            let _ = self
                .source
                .lock()
                .await
                .observe(outstanding.trial_index, &resolved)
                .await;
            Ok(FinalizeResult { completed_delta: 1, resubmit })
        } else {
            self.store
                .fail_trial(outstanding.trial_index, outcome.exit_code, outcome.signal)
                .await?;
            let _ = CounterFile::new(self.store.layout().counter_file("failed_jobs")).increment().await;
            let _ = self
                .source
                .lock()
                .await
                .observe(outstanding.trial_index, &BTreeMap::new())
                .await;
            Ok(FinalizeResult { completed_delta: 0, resubmit })
        }
    }

    async fn abandon_all(&self, outstanding: &mut BTreeMap<String, Outstanding>) {
        for (_, job) in outstanding.iter() {
            let _ = self.executor.cancel(&job.job).await;
            let _ = self.store.abandon_trial(job.trial_index).await;
        }
        outstanding.clear();
        let _ = self.store.snapshot().await;
    }
}
