//! Half-acquisition tooling: 360° overlap search and batch stitching.

mod batch;
mod overlap;

pub use batch::{
    axis_values_log, plan_stitch, stitch_all, StitchJob, StitchStats, AUTO_STITCH_PARAMS_FILE, STITCHED_DIR,
};
pub use overlap::{absorption_sinogram, OverlapReport, OverlapSearch, SetOverlap, OVERLAP_SEARCH_DIR};

use crate::config::OverlapRange;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum OverlapError {
    #[error("found overlaps for {overlaps} of {sets} CT sets; refusing to stitch a subset")]
    CountMismatch { overlaps: usize, sets: usize },

    #[error("overlap search range {}..={} step {} has no candidates", .0.lower, .0.upper, .0.step)]
    NoCandidates(OverlapRange),
}

/// One point of an overlap search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapCandidate {
    pub axis: i64,
    /// Pixels cropped from each side of the stitched sinogram
    pub crop: usize,
    pub sharpness_score: f64,
}
