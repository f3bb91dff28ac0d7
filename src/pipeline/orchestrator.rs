//! Batch orchestration: plan every set, then execute the plans in order.
//!
//! Planning classifies the input tree, skips sets that already have slices in
//! the output tree, resolves each axis and composes the stage chain. Execution
//! runs the commands of one set after another; the first failing command ends
//! that set and the batch moves on.

use crate::axis::{correct_series, AxisEstimate, AxisResolver, ZStackSeries};
use crate::config::Config;
use crate::index::{classify, AcquisitionLayout, CtSet, DataLocation, ProcessedIndex};
use crate::io::{write_set_record, ImageStore, SetRecord, StackGeometry};
use crate::pipeline::command::{CommandBuilder, EngineCommand};
use crate::pipeline::metrics::BatchMetrics;
use crate::pipeline::runner::CommandRunner;
use crate::pipeline::stages::{compose, StagePlan};
use crate::pipeline::staging::StagingArea;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything needed to execute one set.
#[derive(Debug, Clone)]
pub struct SetPlan {
    pub set: CtSet,
    /// Path relative to the input root, empty for the root itself
    pub set_id: String,
    pub location: DataLocation,
    pub geometry: StackGeometry,
    pub axis: AxisEstimate,
    pub output_dir: PathBuf,
    pub stages: StagePlan,
    pub commands: Vec<EngineCommand>,
}

/// A set that could not be planned or executed, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFailure {
    pub set_id: String,
    pub reason: String,
}

/// Planned sets plus the sets excluded while planning.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub sets: Vec<SetPlan>,
    pub skipped: Vec<String>,
    pub failed: Vec<SetFailure>,
}

impl BatchPlan {
    pub fn commands(&self) -> impl Iterator<Item = &EngineCommand> {
        self.sets.iter().flat_map(|s| s.commands.iter())
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub processed: Vec<String>,
    /// Already reconstructed before this run
    pub skipped: Vec<String>,
    pub failed: Vec<SetFailure>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.processed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed: {}, Skipped: {}, Failed: {}, Total: {}",
            self.processed.len(),
            self.skipped.len(),
            self.failed.len(),
            self.total()
        )?;
        for failure in &self.failed {
            write!(f, "\n  {}: {}", display_id(&failure.set_id), failure.reason)?;
        }
        Ok(())
    }
}

fn display_id(set_id: &str) -> &str {
    if set_id.is_empty() {
        "."
    } else {
        set_id
    }
}

/// Drives classification, resolution, composition and execution.
pub struct BatchOrchestrator<'a> {
    config: &'a Config,
    store: &'a dyn ImageStore,
    /// Executes the planned stage commands
    runner: &'a dyn CommandRunner,
    /// Executes axis-search reconstructions, which planning depends on
    search_runner: &'a dyn CommandRunner,
    metrics: Arc<BatchMetrics>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn ImageStore,
        runner: &'a dyn CommandRunner,
        search_runner: &'a dyn CommandRunner,
        metrics: Arc<BatchMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            search_runner,
            metrics,
        }
    }

    /// Plan every set under the input root.
    ///
    /// Fails only for batch-terminal conditions: invalid configuration or no
    /// usable set. Per-set problems are reported in the plan.
    pub fn plan(&self, staging: &mut StagingArea) -> Result<BatchPlan> {
        self.config.validate()?;
        let root = &self.config.input.root;
        let layout = AcquisitionLayout::from_config(self.config);

        let sets = classify(root, &layout)?.into_valid(root, &layout)?;
        tracing::info!("{} valid CT sets under {}", sets.len(), root.display());

        let processed = ProcessedIndex::scan(&self.config.output.root);
        let resolver = AxisResolver::new(self.config, self.store, self.search_runner);
        let mut batch = BatchPlan::default();
        let mut resolved = Vec::new();

        for (index, set) in sets.into_iter().enumerate() {
            let relative = set.relative_path(root);
            let set_id = set.set_id(root);
            if processed.contains(&relative) {
                tracing::info!("{} already reconstructed, skipping", display_id(&set_id));
                self.metrics.add_set_skipped();
                batch.skipped.push(set_id);
                continue;
            }

            let location = layout.locate(&set);
            let geometry = match self.store.geometry(&location.projections) {
                Ok(g) => g,
                Err(e) => {
                    self.fail(&mut batch.failed, &set_id, format!("{:#}", e));
                    continue;
                }
            };
            match resolver.resolve(&location, &geometry, index, staging) {
                Ok(axis) => resolved.push((set, set_id, location, geometry, axis)),
                Err(e) => self.fail(&mut batch.failed, &set_id, e.to_string()),
            }
        }

        let axis = &self.config.axis;
        if axis.correct_outliers && axis.method.is_search() {
            let series: ZStackSeries = resolved
                .iter()
                .map(|(set, _, _, _, estimate)| (set.root.clone(), estimate.value))
                .collect();
            let corrected = correct_series(&series, &axis.outliers);
            for (set, _, _, _, estimate) in resolved.iter_mut() {
                if let Some(value) = corrected.get(&set.root) {
                    estimate.value = value;
                }
            }
        }

        for (set, set_id, location, geometry, axis) in resolved {
            let output_dir = self.config.output.root.join(set.relative_path(root));
            let stages = compose(&location, axis.value, &output_dir, self.config);
            let commands = CommandBuilder::new(self.config, geometry).plan(&stages);
            tracing::debug!(
                "{}: {} stages, {} commands",
                display_id(&set_id),
                stages.stages.len(),
                commands.len()
            );
            batch.sets.push(SetPlan {
                set,
                set_id,
                location,
                geometry,
                axis,
                output_dir,
                stages,
                commands,
            });
        }
        Ok(batch)
    }

    /// Plan and execute the whole batch.
    pub fn run(&self, staging: &mut StagingArea) -> Result<RunReport> {
        let plan = self.plan(staging)?;
        let report = self.execute(plan, staging);
        if !self.config.output.keep_temp {
            staging.sweep()?;
        }
        tracing::info!("{}", report);
        Ok(report)
    }

    /// Execute planned sets in order.
    pub fn execute(&self, plan: BatchPlan, staging: &mut StagingArea) -> RunReport {
        let dry_run = self.config.output.dry_run;
        let mut report = RunReport {
            processed: Vec::new(),
            skipped: plan.skipped,
            failed: plan.failed,
        };

        for set in plan.sets {
            let id = display_id(&set.set_id).to_string();
            tracing::info!(
                "Processing {} ({} projections, axis {})",
                id,
                set.geometry.frames,
                set.axis.value
            );

            if !dry_run {
                if self.config.output.save_params {
                    let record = SetRecord {
                        set_id: set.set_id.clone(),
                        axis: set.axis.value,
                        axis_estimated: set.axis.is_estimated(),
                        height: set.geometry.height,
                        width: set.geometry.width,
                        projections: set.geometry.frames,
                    };
                    if let Err(e) = write_set_record(&set.output_dir, self.config, &record) {
                        self.fail(&mut report.failed, &set.set_id, format!("{:#}", e));
                        continue;
                    }
                }
                if let Err(e) = staging.prepare(&set.stages.staging_dirs) {
                    self.fail(&mut report.failed, &set.set_id, format!("{:#}", e));
                    continue;
                }
            }

            match self.run_commands(&set.commands) {
                Ok(()) => {
                    self.metrics.add_set_processed();
                    report.processed.push(set.set_id);
                }
                Err(reason) => self.fail(&mut report.failed, &set.set_id, reason),
            }
        }
        report
    }

    fn run_commands(&self, commands: &[EngineCommand]) -> Result<(), String> {
        for command in commands {
            match self.runner.run(command) {
                Ok(output) => self.metrics.add_command(output.elapsed),
                Err(e) => {
                    self.metrics.add_command_failure();
                    return Err(e.to_string());
                }
            }
        }
        Ok(())
    }

    fn fail(&self, failed: &mut Vec<SetFailure>, set_id: &str, reason: String) {
        tracing::warn!("{} failed: {}", display_id(set_id), reason);
        self.metrics.add_set_failed();
        failed.push(SetFailure {
            set_id: set_id.to_string(),
            reason,
        });
    }
}
