//! Trial Source (spec §4.3): the abstract generator contract the control
//! loop drives. Real model/surrogate engines (GPEI, SAASBO, BoTorch, ...)
//! are explicitly out of scope (spec §2) and are represented only by the
//! `ExternalModelSource` seam; `SobolSource` and `GridSource` are
//! deterministic generators this crate legitimately owns end-to-end.
//!
//! Mirrors the teacher's `executors::StepExecutor` pattern: a trait that is
//! the *only* seam between the control loop and a family of interchangeable
//! behaviors, with `async_trait` so implementations can await model calls.

pub mod external;
pub mod grid;
pub mod import;
pub mod sobol;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::{Arm, IndexAllocator, TrialIndex};

/// Returned by `Next`: either a batch of freshly generated trials, or a
/// signal that the generator cannot produce further distinct points.
#[derive(Debug)]
pub enum GenerationOutcome {
    Trials(Vec<(TrialIndex, Arm)>),
    OptimizationComplete,
}

#[async_trait]
pub trait TrialSource: Send {
    /// Proposes up to `n` parameter vectors. May return fewer than `n`
    /// (generation complete, throttled, or deduplicated) without that being
    /// an error — only a genuinely exhausted generator returns
    /// `OptimizationComplete`.
    async fn next(
        &mut self,
        n: usize,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<GenerationOutcome>;

    /// Informs the model of a completed outcome so it can update.
    async fn observe(
        &mut self,
        index: TrialIndex,
        raw_result: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()>;

    /// Inserts a previously computed point without consuming the
    /// generator — used by cross-run import (spec §4.3).
    async fn attach_observation(
        &mut self,
        arm: Arm,
        raw_result: BTreeMap<String, f64>,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<TrialIndex>;
}
