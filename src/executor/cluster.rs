//! Cluster executor: wraps the trial's command in a Slurm-shaped batch
//! submission with configurable resources, signal-delayed graceful
//! shutdown, and the exclusion list (spec §4.4). Polling uses the same
//! `JobExecutor` contract as `LocalExecutor`, so the dispatcher never
//! branches on which back-end is in play.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::RwLock;

use super::{Job, JobExecutor, JobOutcome, JobState};

#[derive(Debug, Clone)]
pub struct ClusterResources {
    pub cores: u32,
    pub mem_gb: u32,
    pub gpus: u32,
    pub wall_time: String,
    pub nodes: u32,
    pub signal_delay_s: u32,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub reservation: Option<String>,
    pub use_srun: bool,
}

impl Default for ClusterResources {
    fn default() -> Self {
        Self {
            cores: 1,
            mem_gb: 1,
            gpus: 0,
            wall_time: "01:00:00".to_string(),
            nodes: 1,
            signal_delay_s: 30,
            partition: None,
            account: None,
            reservation: None,
            use_srun: false,
        }
    }
}

pub struct ClusterExecutor {
    resources: ClusterResources,
    excluded_hosts: Arc<RwLock<Vec<String>>>,
    submitted: Arc<RwLock<HashMap<String, ClusterJobHandle>>>,
}

struct ClusterJobHandle {
    slurm_job_id: String,
}

impl ClusterExecutor {
    pub fn new(resources: ClusterResources) -> Self {
        Self {
            resources,
            excluded_hosts: Arc::new(RwLock::new(Vec::new())),
            submitted: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn build_submission_command(&self, command: &str, working_dir: &std::path::Path, excluded: &[String]) -> Vec<String> {
        let binary = if self.resources.use_srun { "srun" } else { "sbatch" };
        let mut args = vec![
            binary.to_string(),
            format!("--cpus-per-task={}", self.resources.cores),
            format!("--mem={}G", self.resources.mem_gb),
            format!("--time={}", self.resources.wall_time),
            format!("--nodes={}", self.resources.nodes),
            format!("--signal=USR1@{}", self.resources.signal_delay_s),
            format!("--chdir={}", working_dir.display()),
        ];
        if self.resources.gpus > 0 {
            args.push(format!("--gres=gpu:{}", self.resources.gpus));
        }
        if let Some(partition) = &self.resources.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(account) = &self.resources.account {
            args.push(format!("--account={account}"));
        }
        if let Some(reservation) = &self.resources.reservation {
            args.push(format!("--reservation={reservation}"));
        }
        if !excluded.is_empty() {
            args.push(format!("--exclude={}", excluded.join(",")));
        }
        args.push("--wrap".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl JobExecutor for ClusterExecutor {
    async fn submit(&self, command: &str, working_dir: PathBuf) -> anyhow::Result<Job> {
        fs::create_dir_all(&working_dir).await?;
        let excluded = self.excluded_hosts.read().await.clone();
        let argv = self.build_submission_command(command, &working_dir, &excluded);

        let output = Command::new(&argv[0]).args(&argv[1..]).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let slurm_job_id = parse_slurm_job_id(&stdout).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let id = uuid::Uuid::new_v4().to_string();
        self.submitted
            .write()
            .await
            .insert(id.clone(), ClusterJobHandle { slurm_job_id });

        Ok(Job { id, working_dir })
    }

    async fn poll(&self, job: &Job) -> anyhow::Result<JobState> {
        let submitted = self.submitted.read().await;
        let Some(handle) = submitted.get(&job.id) else {
            return Ok(JobState::Unknown);
        };
        let output = Command::new("squeue")
            .args(["-j", &handle.slurm_job_id, "-h", "-o", "%T"])
            .output()
            .await?;
        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(match status.as_str() {
            "" => JobState::Completed, // no longer in the queue => terminal
            "PENDING" => JobState::Pending,
            "RUNNING" | "COMPLETING" => JobState::Running,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" => JobState::Failed,
            _ => JobState::Unknown,
        })
    }

    async fn result(&self, job: &Job) -> anyhow::Result<JobOutcome> {
        loop {
            match self.poll(job).await? {
                JobState::Pending | JobState::Running | JobState::Unknown => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => break,
            }
        }
        let stdout_path = job.working_dir.join("stdout.log");
        let stderr_path = job.working_dir.join("stderr.log");
        let stdout = fs::read_to_string(&stdout_path).await.unwrap_or_default();
        let stderr = fs::read_to_string(&stderr_path).await.unwrap_or_default();
        Ok(JobOutcome {
            stdout,
            stderr,
            exit_code: None,
            signal: None,
            hostname: None,
        })
    }

    async fn cancel(&self, job: &Job) -> anyhow::Result<()> {
        if let Some(handle) = self.submitted.read().await.get(&job.id) {
            let _ = Command::new("scancel").arg(&handle.slurm_job_id).output().await;
        }
        Ok(())
    }

    async fn update_excluded_hosts(&self, hosts: Vec<String>) {
        *self.excluded_hosts.write().await = hosts;
    }
}

fn parse_slurm_job_id(sbatch_stdout: &str) -> Option<String> {
    // sbatch prints "Submitted batch job 12345".
    sbatch_stdout
        .split_whitespace()
        .last()
        .map(|s| s.to_string())
}
