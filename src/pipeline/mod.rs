//! Stage composition, engine commands and batch orchestration.

mod command;
mod metrics;
mod orchestrator;
mod runner;
mod stages;
mod staging;

pub use command::{CommandBuilder, EngineCommand};
pub use metrics::{BatchMetrics, BatchMetricsSnapshot, MetricsReporter};
pub use orchestrator::{BatchOrchestrator, BatchPlan, RunReport, SetFailure, SetPlan};
pub use runner::{CommandError, CommandOutput, CommandRunner, DryRunRunner, ProcessRunner};
pub use stages::{compose, PipelineStage, StageKind, StagePlan, DENOISED_DIR};
pub use staging::{StagingArea, StagingLayout};

#[cfg(test)]
pub(crate) use runner::testing;
