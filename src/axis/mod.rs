//! Rotation-axis resolution and cross-view correction.

mod grid_search;
mod outliers;

pub use grid_search::{grid_search, GridOutcome};
pub use outliers::{correct_run, correct_series, ZStackSeries};

use crate::config::{AxisMethod, Config, GridRange};
use crate::index::DataLocation;
use crate::io::{ImageStore, StackGeometry};
use crate::pipeline::{CommandBuilder, CommandError, CommandRunner, StagingArea};
use crate::transform::{correlation_axis, ProjectionPair, SharpnessError};
use std::path::PathBuf;
use thiserror::Error;

/// A resolved axis and the strategy that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisEstimate {
    pub value: f64,
    pub method: AxisMethod,
}

impl AxisEstimate {
    /// Whether the value was derived from the data.
    pub fn is_estimated(&self) -> bool {
        matches!(self.method, AxisMethod::Correlation | AxisMethod::GridSearch)
    }
}

/// Why the axis of one set could not be resolved.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("vertical region y={y} height={height} selects no rows of projections with {rows} rows")]
    EmptyRegion { y: usize, height: usize, rows: usize },

    #[error("search row {row} is outside projections with {rows} rows")]
    SearchRow { row: usize, rows: usize },

    #[error("invalid axis search range {0:?}")]
    InvalidRange(GridRange),

    #[error("no patch was reconstructed for candidate axis {candidate} in {}", .dir.display())]
    EmptyGrid { candidate: f64, dir: PathBuf },

    #[error("correlation of first and last projection failed (shapes {first:?} and {last:?})")]
    Correlation {
        first: (usize, usize),
        last: (usize, usize),
    },

    #[error(transparent)]
    Sharpness(#[from] SharpnessError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0:#}")]
    Io(anyhow::Error),
}

/// Resolves the axis of each set with the configured strategy.
pub struct AxisResolver<'a> {
    config: &'a Config,
    store: &'a dyn ImageStore,
    runner: &'a dyn CommandRunner,
}

impl<'a> AxisResolver<'a> {
    pub fn new(config: &'a Config, store: &'a dyn ImageStore, runner: &'a dyn CommandRunner) -> Self {
        Self { config, store, runner }
    }

    /// Axis of the set at position `index` of the batch.
    pub fn resolve(
        &self,
        location: &DataLocation,
        geometry: &StackGeometry,
        index: usize,
        staging: &mut StagingArea,
    ) -> Result<AxisEstimate, ResolveError> {
        if let Some(roi) = &self.config.region.vertical {
            if roi.y >= geometry.height || roi.rows() == 0 {
                return Err(ResolveError::EmptyRegion {
                    y: roi.y,
                    height: roi.height,
                    rows: geometry.height,
                });
            }
        }

        let axis = &self.config.axis;
        let value = match axis.method {
            AxisMethod::Correlation => self.correlation(location)?,
            AxisMethod::GridSearch => {
                if axis.search_row >= geometry.height {
                    return Err(ResolveError::SearchRow {
                        row: axis.search_row,
                        rows: geometry.height,
                    });
                }
                let builder = CommandBuilder::new(self.config, *geometry);
                grid_search(
                    &axis.search,
                    location,
                    &builder,
                    self.runner,
                    self.store,
                    staging,
                    axis.metric,
                )?
                .value
            }
            AxisMethod::UserDefined => axis.user_defined.base + index as f64 * axis.user_defined.increment,
            AxisMethod::ImageMidpoint => (geometry.width / 2) as f64,
        };
        tracing::info!(
            "Axis of {} resolved to {} ({})",
            location.projections.display(),
            value,
            axis.method
        );
        Ok(AxisEstimate { value, method: axis.method })
    }

    fn correlation(&self, location: &DataLocation) -> Result<f64, ResolveError> {
        let read = |f: anyhow::Result<ndarray::Array2<f32>>| f.map_err(ResolveError::Io);
        let first = read(self.store.first_frame(&location.projections))?;
        let last = read(self.store.last_frame(&location.projections))?;
        let dark = read(self.store.last_frame(&location.darks))?;
        let flat = read(self.store.last_frame(&location.flats))?;
        let flat2 = match &location.flats2 {
            Some(dir) => Some(read(self.store.last_frame(dir))?),
            None => None,
        };

        let mut pair = ProjectionPair::from_raw(
            first.view(),
            last.view(),
            dark.view(),
            flat.view(),
            flat2.as_ref().map(|f| f.view()),
        );
        if let Some(roi) = &self.config.region.vertical {
            pair = pair.crop_rows(roi.y, roi.height);
        }
        correlation_axis(pair.first.view(), pair.last.view()).ok_or(ResolveError::Correlation {
            first: pair.first.dim(),
            last: pair.last.dim(),
        })
    }
}
