//! Numbered exit codes (spec §6/§7). One enum, one `exit_code`, one exit
//! point — mirrors the way the teacher centralizes its `std::process::exit`
//! calls in `main::execute_plan`, generalized from a single exit(1) to the
//! full numbered table this system exposes to callers and CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("missing module: {0}")]
    MissingModule(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("run folder already exists: {0}")]
    RunFolderExists(String),
    #[error("missing required argument: {0}")]
    MissingRequiredArgument(String),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("continuation folder missing: {0}")]
    ContinuationFolderMissing(String),
    #[error("checkpoint missing: {0}")]
    CheckpointMissing(String),
    #[error("search space exhausted but incomplete ({completed}/{max_eval})")]
    SearchSpaceExhausted { completed: u64, max_eval: u64 },
    #[error("run folder deleted mid-run")]
    RunFolderDeletedMidRun,
    #[error("parameter definition error: {0}")]
    ParameterDefinition(String),
    #[error("invalid bin argument: {0}")]
    InvalidBinArgument(String),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("orchestrator file invalid: {0}")]
    OrchestratorFileInvalid(String),
    #[error("unimplemented orchestrator behavior: {0}")]
    UnimplementedOrchestratorBehavior(String),
    #[error("no random steps specified for a fresh run")]
    NoRandomStepsFreshRun,
    #[error("linear algebra failure in model: {0}")]
    LinearAlgebraFailure(String),
    #[error("shut down by signal {0}")]
    Signal(Signal),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("disk full while writing run state")]
    DiskFull,
    #[error("unknown trial index {0}")]
    UnknownTrial(u64),
    #[error("invalid trial status transition for trial {0}")]
    InvalidTransition(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Int,
    Usr1,
    Cont,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Signal::Int => "INT",
            Signal::Usr1 => "USR1",
            Signal::Cont => "CONT",
        };
        write!(f, "{name}")
    }
}

impl Signal {
    pub fn exit_code(self) -> i32 {
        match self {
            Signal::Int => 130,
            Signal::Usr1 => 138,
            Signal::Cont => 146,
        }
    }
}

impl OrchestratorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::MissingModule(_) => 2,
            OrchestratorError::ConfigParse(_) => 5,
            OrchestratorError::RunFolderExists(_) => 13,
            OrchestratorError::MissingRequiredArgument(_) => 19,
            OrchestratorError::ModuleNotFound(_) => 31,
            OrchestratorError::ContinuationFolderMissing(_) => 44,
            OrchestratorError::CheckpointMissing(_) => 47,
            OrchestratorError::SearchSpaceExhausted { .. } => 87,
            OrchestratorError::RunFolderDeletedMidRun => 99,
            OrchestratorError::ParameterDefinition(_) => 181,
            OrchestratorError::InvalidBinArgument(_) => 193,
            OrchestratorError::UnsupportedModel(_) => 203,
            OrchestratorError::OrchestratorFileInvalid(_) => 206,
            OrchestratorError::UnimplementedOrchestratorBehavior(_) => 210,
            OrchestratorError::NoRandomStepsFreshRun => 233,
            OrchestratorError::LinearAlgebraFailure(_) => 242,
            OrchestratorError::Signal(s) => s.exit_code(),
            OrchestratorError::ResourceUnavailable(_) => 74,
            OrchestratorError::DiskFull => 122,
            OrchestratorError::UnknownTrial(_) => 65,
            OrchestratorError::InvalidTransition(_) => 66,
        }
    }
}

/// Single terminal exit point. Prints the required `Exit-Code: N` line and,
/// on a cluster back-end, sleeps briefly so buffered stdout reaches the
/// scheduler's log files before the process dies (spec §7).
pub fn terminate(code: i32, on_cluster: bool) -> ! {
    println!("Exit-Code: {code}");
    if on_cluster {
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
    std::process::exit(code);
}
