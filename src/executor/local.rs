//! Local executor: runs the trial's command in a subshell on the machine
//! running the orchestrator. Exit-code/signal extraction follows
//! `pairwise-alignment-runner`'s subprocess runner, which uses the same
//! `std::os::unix::process::ExitStatusExt` pattern to recover a negative
//! "signal" exit status into a real signal number.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{Job, JobExecutor, JobOutcome, JobState};

pub struct LocalExecutor {
    finished: Arc<Mutex<HashMap<String, JobOutcome>>>,
    running: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<JobOutcome>>>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            finished: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for LocalExecutor {
    async fn submit(&self, command: &str, working_dir: PathBuf) -> anyhow::Result<Job> {
        fs::create_dir_all(&working_dir).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let command = command.to_string();
        let dir = working_dir.clone();

        let handle = tokio::spawn(async move {
            let output = Command::new("sh").arg("-c").arg(&command).output().await;
            match output {
                Ok(output) => {
                    let exit_code = output.status.code();
                    let signal = output.status.signal();
                    let outcome = JobOutcome {
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                        exit_code,
                        signal,
                        hostname: local_hostname(),
                    };
                    let _ = fs::write(dir.join("stdout.log"), &outcome.stdout).await;
                    let _ = fs::write(dir.join("stderr.log"), &outcome.stderr).await;
                    outcome
                }
                Err(err) => JobOutcome {
                    stdout: String::new(),
                    stderr: format!("failed to spawn command: {err}"),
                    exit_code: None,
                    signal: None,
                    hostname: local_hostname(),
                },
            }
        });

        self.running.lock().await.insert(id.clone(), handle);
        Ok(Job {
            id,
            working_dir,
        })
    }

    async fn poll(&self, job: &Job) -> anyhow::Result<JobState> {
        if self.finished.lock().await.contains_key(&job.id) {
            return Ok(JobState::Completed);
        }
        let mut running = self.running.lock().await;
        let Some(handle) = running.get_mut(&job.id) else {
            return Ok(JobState::Unknown);
        };
        if !handle.is_finished() {
            return Ok(JobState::Running);
        }
        let handle = running.remove(&job.id).unwrap();
        drop(running);
        let outcome = handle.await.unwrap_or_else(|err| JobOutcome {
            stdout: String::new(),
            stderr: format!("task join error: {err}"),
            exit_code: None,
            signal: None,
            hostname: None,
        });
        let state = if outcome.exit_code == Some(0) {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.finished.lock().await.insert(job.id.clone(), outcome);
        Ok(state)
    }

    async fn result(&self, job: &Job) -> anyhow::Result<JobOutcome> {
        loop {
            if let Some(outcome) = self.finished.lock().await.get(&job.id).cloned() {
                return Ok(outcome);
            }
            match self.poll(job).await? {
                JobState::Completed | JobState::Failed => continue,
                _ => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        }
    }

    async fn cancel(&self, job: &Job) -> anyhow::Result<()> {
        if let Some(handle) = self.running.lock().await.remove(&job.id) {
            handle.abort();
        }
        Ok(())
    }

    async fn update_excluded_hosts(&self, _hosts: Vec<String>) {
        // The local executor runs everything on this host; exclusion is
        // meaningful only for the cluster back-end.
    }
}

fn local_hostname() -> Option<String> {
    hostname_from_env()
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_and_captures_stdout() {
        let executor = LocalExecutor::new();
        let dir = tempdir().unwrap();
        let job = executor
            .submit("echo 'RESULT: 42'", dir.path().to_path_buf())
            .await
            .unwrap();
        let outcome = executor.result(&job).await.unwrap();
        assert!(outcome.stdout.contains("RESULT: 42"));
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let executor = LocalExecutor::new();
        let dir = tempdir().unwrap();
        let job = executor
            .submit("exit 3", dir.path().to_path_buf())
            .await
            .unwrap();
        let outcome = executor.result(&job).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
    }
}
