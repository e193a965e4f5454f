//! Job Executor (spec §4.4): abstract submit/poll/cancel of a trial as an
//! external process, local or cluster. Modeled directly on the teacher's
//! `StepExecutor` trait — the one seam the dispatcher talks to — widened
//! from a single-shot `execute` to the submit/poll/cancel lifecycle a real
//! job needs.

pub mod cluster;
pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Arm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub hostname: Option<String>,
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn submit(&self, command: &str, working_dir: PathBuf) -> anyhow::Result<Job>;
    async fn poll(&self, job: &Job) -> anyhow::Result<JobState>;
    /// Blocks or returns the cached value once the job is in a terminal
    /// state (spec §4.4).
    async fn result(&self, job: &Job) -> anyhow::Result<JobOutcome>;
    async fn cancel(&self, job: &Job) -> anyhow::Result<()>;
    async fn update_excluded_hosts(&self, hosts: Vec<String>);
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\(([A-Za-z0-9_]+)\)|\$([A-Za-z0-9_]+)|%\(([A-Za-z0-9_]+)\)|%([A-Za-z0-9_]+)").expect("valid regex"));

/// Substitutes `$name`, `$(name)`, `%name`, `%(name)` placeholders in a
/// command template with the parameter's string form, then flattens
/// newlines to spaces (spec §4.4) — the same regex-substitution idiom the
/// teacher uses for `${token}` interpolation in `context::Context`,
/// generalized to the four placeholder spellings this command template
/// grammar allows.
pub fn substitute_placeholders(template: &str, arm: &Arm) -> String {
    let substituted = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match arm.get(name) {
            Some(value) => value.as_string(),
            None => caps.get(0).unwrap().as_str().to_string(),
        }
    });
    substituted.replace('\n', " ").replace('\r', " ")
}

/// Auto-detects and decodes a base64-encoded run-program string (spec §6).
/// A plain shell command is returned unchanged.
pub fn decode_run_program(run_program: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    match STANDARD.decode(run_program.trim()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(decoded) if looks_like_base64_source(run_program) => decoded,
            _ => run_program.to_string(),
        },
        Err(_) => run_program.to_string(),
    }
}

fn looks_like_base64_source(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty()
        && trimmed.len() % 4 == 0
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Result of a terminated job, ready for the result parser and orchestrator
/// policy (spec §4.5 step 1).
pub struct TerminatedJob {
    pub outcome: JobOutcome,
}

pub type ExcludedHosts = BTreeMap<String, ()>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamValue;

    #[test]
    fn substitutes_all_four_placeholder_forms() {
        let mut arm = Arm::new();
        arm.insert("x".into(), ParamValue::Number(3.0));
        assert_eq!(substitute_placeholders("echo $x", &arm), "echo 3");
        assert_eq!(substitute_placeholders("echo $(x)", &arm), "echo 3");
        assert_eq!(substitute_placeholders("echo %x", &arm), "echo 3");
        assert_eq!(substitute_placeholders("echo %(x)", &arm), "echo 3");
    }

    #[test]
    fn flattens_newlines() {
        let arm = Arm::new();
        assert_eq!(substitute_placeholders("echo a\nb\r\nc", &arm), "echo a b  c");
    }

    #[test]
    fn leaves_plain_command_untouched() {
        assert_eq!(decode_run_program("echo 'RESULT: %x'"), "echo 'RESULT: %x'");
    }
}
