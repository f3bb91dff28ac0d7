//! Image-level numerics: focus metrics, flat-field helpers, correlation and stitching.

pub mod correlation;
pub mod flat_field;
mod sharpness;
mod stitch;

pub use correlation::{correlation_axis, ProjectionPair};
pub use sharpness::{rank_by_sharpness, sharpness, SharpnessError, SharpnessRanking};
pub use stitch::{overlap_width, stitch, stitch_pair, IntensityRange, StitchError};
