//! Human-readable run records written next to the outputs.

use crate::config::{Config, RingRemovalConfig};
use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

pub const RECO_PARAMS_FILE: &str = "reco.params";
pub const PARAMETERS_FILE: &str = "parameters.yaml";
pub const AXIS_VALUES_FILE: &str = "axis_values.info";

/// Per-set facts recorded in `reco.params`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRecord {
    /// Set path relative to the input root, empty for the root itself
    pub set_id: String,
    pub axis: f64,
    /// Axis was estimated from the data rather than given
    pub axis_estimated: bool,
    pub height: usize,
    pub width: usize,
    pub projections: usize,
}

/// Render the `reco.params` summary of one reconstruction.
pub fn render_reco_params(config: &Config, record: &SetRecord) -> String {
    RecoParams { config, record }.to_string()
}

struct RecoParams<'a> {
    config: &'a Config,
    record: &'a SetRecord,
}

impl fmt::Display for RecoParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (config, record) = (self.config, self.record);
        let set_id = if record.set_id.is_empty() { "." } else { &record.set_id };
        let how = if record.axis_estimated { "auto estimate" } else { "user defined" };

        writeln!(f, "*** General ***")?;
        writeln!(f, "Input directory {}", config.input.root.display())?;
        writeln!(f, "CT set {}", set_id)?;
        writeln!(f, "Center of rotation {} ({})", record.axis, how)?;
        writeln!(
            f,
            "Dimensions of projections {} x {} (height x width)",
            record.height, record.width
        )?;
        writeln!(f, "Number of projections {}", record.projections)?;

        let filters = &config.filters;
        writeln!(f, "*** Preprocessing ***")?;
        writeln!(f, "  {}", filters.preprocess.as_deref().unwrap_or("None"))?;

        writeln!(f, "*** Image filters ***")?;
        match &filters.remove_spots {
            Some(spots) => {
                writeln!(f, " Remove large spots enabled")?;
                writeln!(f, "  threshold {}", spots.threshold)?;
                writeln!(f, "  sigma {}", spots.sigma)?;
            }
            None => writeln!(f, "  Remove large spots disabled")?,
        }
        match &filters.phase_retrieval {
            Some(pr) => {
                writeln!(f, " Phase retrieval enabled")?;
                writeln!(f, "  energy {} keV", pr.energy)?;
                writeln!(f, "  pixel size {:.1} um", pr.pixel_size * 1e6)?;
                writeln!(f, "  sample-detector distance {} m", pr.propagation_distance)?;
                writeln!(f, "  delta/beta ratio {}", 10f64.powf(pr.regularization_rate).round())?;
            }
            None => writeln!(f, "  Phase retrieval disabled")?,
        }

        writeln!(f, "*** Ring removal ***")?;
        match &filters.ring_removal {
            Some(RingRemovalConfig::Stripes1d { sigma_h }) => {
                writeln!(f, "  RR with 1D stripes filter")?;
                writeln!(f, "   sigma horizontal {}", sigma_h)?;
            }
            Some(RingRemovalConfig::Stripes2d { sigma_h, sigma_v }) => {
                writeln!(f, "  RR with 2D stripes filter")?;
                writeln!(f, "   sigma horizontal {}", sigma_h)?;
                writeln!(f, "   sigma vertical {}", sigma_v)?;
            }
            Some(RingRemovalConfig::Sorting { narrow_window, wide, .. }) => {
                if let Some(wide) = wide {
                    writeln!(f, "  RR with remove wide filter, window {}, SNR {}", wide.window, wide.snr)?;
                }
                writeln!(f, "  RR with sorting filter, window {}", narrow_window)?;
            }
            None => writeln!(f, "RR disabled")?,
        }

        writeln!(f, "*** Region of interest ***")?;
        match &config.region.vertical {
            Some(roi) => {
                writeln!(f, "Vertical ROI defined")?;
                writeln!(f, "  first row {}", roi.y)?;
                writeln!(f, "  height {}", roi.height)?;
                writeln!(f, "  reconstruct every {}th row", roi.step)?;
            }
            None => writeln!(f, "Vertical ROI: all rows")?,
        }
        match &config.output.slice_roi {
            Some(roi) => {
                writeln!(f, "ROI in slice plane defined")?;
                writeln!(f, "  x {}", roi.x)?;
                writeln!(f, "  width {}", roi.width)?;
                writeln!(f, "  y {}", roi.y)?;
                writeln!(f, "  height {}", roi.height)?;
            }
            None => writeln!(f, "ROI in slice plane not defined")?,
        }

        writeln!(f, "*** Reconstructed values ***")?;
        match &config.output.clip_histogram {
            Some(clip) => {
                writeln!(f, "  {} bit", clip.bitdepth)?;
                writeln!(f, "  Min value in 32-bit histogram {}", clip.min)?;
                writeln!(f, "  Max value in 32-bit histogram {}", clip.max)?;
            }
            None => writeln!(f, "  32bit, histogram untouched")?,
        }
        writeln!(f, "*** Optional reco parameters ***")?;
        if config.reconstruction.volume_angle_z > 0.0 {
            writeln!(f, "  Rotate volume by: {:.3} deg", config.reconstruction.volume_angle_z)?;
        }
        Ok(())
    }
}

/// Write `reco.params` and `parameters.yaml` into `dir`.
pub fn write_set_record(dir: &Path, config: &Config, record: &SetRecord) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(dir.join(RECO_PARAMS_FILE), render_reco_params(config, record))
        .with_context(|| format!("Failed to write {} in {}", RECO_PARAMS_FILE, dir.display()))?;
    config.save(&dir.join(PARAMETERS_FILE))?;
    tracing::debug!("Run record written to {}", dir.display());
    Ok(())
}

/// Overlap axes found for a batch of half-acquisition sets.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisValuesLog {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub shared_flats: bool,
    pub darks_dir: String,
    pub flats_dir: String,
    pub flats2_dir: String,
    pub search: String,
    pub axes: Vec<(PathBuf, i64)>,
}

impl AxisValuesLog {
    pub fn greatest_axis(&self) -> Option<i64> {
        self.axes.iter().map(|(_, a)| *a).max()
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn save(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(AXIS_VALUES_FILE);
        std::fs::write(&path, self.render())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Axis values log stored at {}", path.display());
        Ok(path)
    }
}

impl fmt::Display for AxisValuesLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "======================== Parameters ========================")?;
        writeln!(f, "Input Directory: {}", self.input_dir.display())?;
        writeln!(f, "Output Directory: {}", self.output_dir.display())?;
        writeln!(f, "Using common set of flats and darks: {}", self.shared_flats)?;
        writeln!(f, "Darks Directory: {}", self.darks_dir)?;
        writeln!(f, "Flats Directory: {}", self.flats_dir)?;
        writeln!(f, "Flats2 Directory: {}", self.flats2_dir)?;
        writeln!(f, "Search Axis: {}", self.search)?;
        writeln!(f)?;
        writeln!(f, "======================== Axis Values ========================")?;
        for (path, axis) in &self.axes {
            writeln!(f, "{} : {}", path.display(), axis)?;
        }
        writeln!(f)?;
        match self.greatest_axis() {
            Some(axis) => write!(f, "Greatest axis value: {}", axis),
            None => write!(f, "Greatest axis value: none"),
        }
    }
}
