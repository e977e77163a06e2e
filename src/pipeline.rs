#![allow(clippy::module_name_repetitions)]
//! Ordered, immutable-once-built step pipelines.
//!
//! Steps are registered on a `PipelineBuilder` during startup and the builder is
//! frozen into a `Pipeline`. Execution order is ascending `(order, sequence)`,
//! where `sequence` is the registration counter, so equal orders run in the order
//! they were registered. Use multiples of 100 for orders to leave room between steps.
//!
//! A step reports one of three results:
//! - `Ok(StepOutcome::Done)`: continue;
//! - `Ok(StepOutcome::Warn(reason))`: best-effort work degraded; the executor emits the
//!   warning on the context's progress stream and continues;
//! - `Err(e)`: fatal; the run stops immediately and `e` is returned unchanged.
//!   No rollback is attempted here.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::operations::ProgressReporter;

pub const DEFAULT_ORDER: i32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Warn(String),
}

impl StepOutcome {
    /// `Done` when nothing degraded, otherwise one warning joining every reason.
    pub fn from_warnings(warnings: Vec<String>) -> Self {
        if warnings.is_empty() {
            StepOutcome::Done
        } else {
            StepOutcome::Warn(warnings.join("; "))
        }
    }
}

/// Access the executor needs from every pipeline context.
pub trait PipelineContext: Send {
    fn progress(&self) -> &ProgressReporter;
}

#[async_trait]
pub trait Step<C>: Send + Sync
where
    C: Send,
{
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome>;
}

struct Entry<C: Send> {
    order: i32,
    sequence: u64,
    step: Box<dyn Step<C>>,
}

pub struct PipelineBuilder<C: Send> {
    name: &'static str,
    entries: Vec<Entry<C>>,
    next_sequence: u64,
}

impl<C> PipelineBuilder<C>
where
    C: PipelineContext + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Register a step at the default order.
    pub fn step(&mut self, step: impl Step<C> + 'static) -> &mut Self {
        self.step_at(DEFAULT_ORDER, step)
    }

    pub fn step_at(&mut self, order: i32, step: impl Step<C> + 'static) -> &mut Self {
        self.entries.push(Entry {
            order,
            sequence: self.next_sequence,
            step: Box::new(step),
        });
        self.next_sequence += 1;
        self
    }

    pub fn build(self) -> Pipeline<C> {
        let mut steps = self.entries;
        steps.sort_by_key(|e| (e.order, e.sequence));
        Pipeline {
            name: self.name,
            steps,
        }
    }
}

pub struct Pipeline<C: Send> {
    name: &'static str,
    steps: Vec<Entry<C>>,
}

impl<C> Pipeline<C>
where
    C: PipelineContext + 'static,
{
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|e| e.step.name()).collect()
    }

    /// Execute every step in order against one context (fail-fast).
    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        for entry in &self.steps {
            let step = entry.step.name();
            debug!(pipeline = self.name, step, order = entry.order, "running step");
            ctx.progress().stage(step);
            match entry.step.run(ctx).await {
                Ok(StepOutcome::Done) => {}
                Ok(StepOutcome::Warn(reason)) => {
                    warn!(pipeline = self.name, step, "{reason}");
                    ctx.progress().warning(&reason);
                }
                Err(e) => {
                    debug!(pipeline = self.name, step, error = %e, "step failed; aborting run");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl<C: Send> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .steps
            .iter()
            .map(|e| format!("{}({})", e.step.name(), e.order))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "Pipeline({:?}, [{}])", self.name, names)
    }
}
