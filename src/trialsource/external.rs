//! Seam for the out-of-scope Bayesian/surrogate backends named in spec §6
//! (`GPEI`, `SAASBO`, `LEGACY_BOTORCH`, `BOTORCH_MODULAR`, `UNIFORM`,
//! `BO_MIXED`). Spec §2 explicitly excludes "defining new surrogate
//! models" from this crate's scope; `ModelBackend` is the abstract
//! capability a real integration would implement, and `ExternalModelSource`
//! is only the adapter that lets the dispatcher treat it as a
//! `TrialSource` like any other generator.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::{Arm, IndexAllocator, TrialIndex};
use crate::paramspace::ParameterSpace;

use super::{GenerationOutcome, TrialSource};

/// Abstract model capability. Left unimplemented on purpose — building a
/// surrogate model is explicitly out of scope (spec §2, Non-goals).
#[async_trait]
pub trait ModelBackend: Send {
    async fn propose(&mut self, space: &ParameterSpace, n: usize) -> anyhow::Result<Vec<Arm>>;
    async fn observe(&mut self, arm: &Arm, raw_result: &BTreeMap<String, f64>) -> anyhow::Result<()>;
}

pub struct ExternalModelSource<B: ModelBackend> {
    backend: B,
    space: ParameterSpace,
    max_parallelism: usize,
    proposed: usize,
}

impl<B: ModelBackend> ExternalModelSource<B> {
    pub fn new(backend: B, space: ParameterSpace, max_parallelism: usize) -> Self {
        Self {
            backend,
            space,
            max_parallelism,
            proposed: 0,
        }
    }
}

#[async_trait]
impl<B: ModelBackend + Send> TrialSource for ExternalModelSource<B> {
    async fn next(
        &mut self,
        n: usize,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<GenerationOutcome> {
        if self.proposed >= self.max_parallelism {
            return Ok(GenerationOutcome::OptimizationComplete);
        }
        let want = n.min(self.max_parallelism - self.proposed);
        let arms = self.backend.propose(&self.space, want).await?;
        if arms.is_empty() {
            return Ok(GenerationOutcome::OptimizationComplete);
        }
        self.proposed += arms.len();
        let trials = arms
            .into_iter()
            .map(|arm| (allocator.allocate(), arm))
            .collect();
        Ok(GenerationOutcome::Trials(trials))
    }

    async fn observe(
        &mut self,
        _index: TrialIndex,
        _raw_result: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn attach_observation(
        &mut self,
        arm: Arm,
        raw_result: BTreeMap<String, f64>,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<TrialIndex> {
        self.backend.observe(&arm, &raw_result).await?;
        Ok(allocator.allocate())
    }
}
