//! Axis grid search: one patch reconstruction per candidate, ranked by sharpness.

use crate::axis::ResolveError;
use crate::config::{GridRange, SharpnessMetric};
use crate::index::DataLocation;
use crate::io::ImageStore;
use crate::pipeline::{CommandBuilder, CommandRunner, StagingArea};
use crate::transform::{rank_by_sharpness, SharpnessRanking};
use ndarray::Array2;

/// Best candidate of a grid and the scores of all candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct GridOutcome {
    pub value: f64,
    pub ranking: SharpnessRanking,
}

/// Reconstruct a patch for every value of `range` and return the sharpest.
///
/// The working directory is emptied before the first candidate so patches of
/// an earlier search never enter the ranking.
pub fn grid_search(
    range: &GridRange,
    location: &DataLocation,
    builder: &CommandBuilder<'_>,
    runner: &dyn CommandRunner,
    store: &dyn ImageStore,
    staging: &mut StagingArea,
    metric: SharpnessMetric,
) -> Result<GridOutcome, ResolveError> {
    let candidates = range.candidates();
    if candidates.is_empty() {
        return Err(ResolveError::InvalidRange(*range));
    }

    let workdir = staging.layout().axis_search();
    staging.clear_dir(&workdir).map_err(ResolveError::Io)?;
    tracing::info!(
        "Searching axis over {} candidates in [{}, {}) step {}",
        candidates.len(),
        range.start,
        range.stop,
        range.step
    );

    let mut patches: Vec<Array2<f32>> = Vec::with_capacity(candidates.len());
    for (i, &axis) in candidates.iter().enumerate() {
        let outdir = workdir.join(format!("candidate-{:04}", i));
        runner.run(&builder.axis_search_patch(location, axis, &outdir))?;
        let files = store.list_images(&outdir).unwrap_or_default();
        if files.is_empty() {
            return Err(ResolveError::EmptyGrid { candidate: axis, dir: outdir });
        }
        patches.push(store.first_frame(&outdir).map_err(ResolveError::Io)?);
    }

    let ranking = rank_by_sharpness(&patches, metric)?;
    let value = range.value(ranking.best);
    tracing::debug!("Grid scores: {:?}", ranking.scores);
    Ok(GridOutcome { value, ranking })
}
