//! Configuration for the batch reconstruction pipeline.
//!
//! The configuration is loaded once per run, validated, and then passed by
//! reference into every component. The only way to change it afterwards is
//! [`Config::apply`], which re-validates and rolls back on failure.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration for a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Input tree and acquisition layout
    pub input: InputConfig,

    /// Output tree, staging storage and run behaviour
    pub output: OutputConfig,

    /// Axis-of-rotation resolution
    #[serde(default)]
    pub axis: AxisConfig,

    /// Vertical region of interest in the projections
    #[serde(default)]
    pub region: RegionConfig,

    /// Optional processing stages
    #[serde(default)]
    pub filters: FilterConfig,

    /// Reconstruction geometry
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    /// External programs and their tuning knobs
    #[serde(default)]
    pub engine: EngineConfig,

    /// Thread pools and metrics
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Half-acquisition overlap search and stitching
    #[serde(default)]
    pub stitch: StitchConfig,
}

/// Input tree configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Root directory that is walked for CT sets
    pub root: PathBuf,

    /// Names of the role sub-directories inside every CT set
    #[serde(default)]
    pub layout: LayoutNames,

    /// Darks/flats shared by every CT set instead of per-set directories
    #[serde(default)]
    pub shared: Option<SharedFlatsConfig>,

    /// File extensions accepted as image files (case-insensitive)
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

/// Directory names of the four acquisition roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutNames {
    #[serde(default = "default_darks_name")]
    pub darks: String,

    #[serde(default = "default_flats_name")]
    pub flats: String,

    #[serde(default = "default_projections_name")]
    pub projections: String,

    /// Flats acquired after the projections
    #[serde(default = "default_flats2_name")]
    pub flats2: String,
}

impl Default for LayoutNames {
    fn default() -> Self {
        Self {
            darks: default_darks_name(),
            flats: default_flats_name(),
            projections: default_projections_name(),
            flats2: default_flats2_name(),
        }
    }
}

/// Darks and flats shared across all CT sets of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFlatsConfig {
    pub darks: PathBuf,
    pub flats: PathBuf,

    /// Shared flats acquired after the projections; enables the second flat
    #[serde(default)]
    pub flats2: Option<PathBuf>,
}

/// Output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root of the output tree; every CT set is mirrored under it
    pub root: PathBuf,

    /// Staging directory for intermediate data, shared by all sets of a run
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Keep intermediate data after the run
    #[serde(default)]
    pub keep_temp: bool,

    /// Plan and print commands without executing them
    #[serde(default)]
    pub dry_run: bool,

    /// Write `reco.params` and `parameters.yaml` next to every reconstruction
    #[serde(default = "default_true")]
    pub save_params: bool,

    /// Write multi-page output files instead of one file per slice
    #[serde(default)]
    pub bigtiff: bool,

    /// Convert output to a lower bit depth by clipping the histogram
    #[serde(default)]
    pub clip_histogram: Option<HistogramClip>,

    /// Crop of the reconstructed slices in the axial plane
    #[serde(default)]
    pub slice_roi: Option<SliceRoi>,
}

/// Histogram clipping for integer output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramClip {
    #[serde(default = "default_bitdepth")]
    pub bitdepth: u8,
    pub min: f64,
    pub max: f64,
}

/// Region of the reconstructed slice, in slice pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceRoi {
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default)]
    pub height: i64,
}

/// How the axis of rotation is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AxisMethod {
    /// Cross-correlate the first and last projection
    Correlation,
    /// Reconstruct test patches over a range of axes and pick the sharpest
    #[default]
    GridSearch,
    /// `base + index * increment` over the sets of a batch
    UserDefined,
    /// Half of the projection width
    ImageMidpoint,
}

impl AxisMethod {
    /// Whether the axis is estimated from the data.
    pub fn is_search(&self) -> bool {
        matches!(self, AxisMethod::Correlation | AxisMethod::GridSearch)
    }
}

impl std::fmt::Display for AxisMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AxisMethod::Correlation => "correlation",
            AxisMethod::GridSearch => "grid search",
            AxisMethod::UserDefined => "user defined",
            AxisMethod::ImageMidpoint => "image midpoint",
        };
        f.write_str(name)
    }
}

/// Focus metric used to rank candidate images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharpnessMetric {
    /// Mean absolute gradient magnitude
    #[default]
    Gradient,
    /// Standard deviation of pixel intensity
    Std,
}

/// Half-open `[start, stop)` interval sampled every `step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl GridRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Number of grid points, `arange` semantics.
    pub fn len(&self) -> usize {
        if self.step <= 0.0 || self.stop <= self.start {
            return 0;
        }
        ((self.stop - self.start) / self.step - 1e-9).ceil().max(0.0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of the `index`-th grid point.
    pub fn value(&self, index: usize) -> f64 {
        self.start + self.step * index as f64
    }

    /// All grid points in ascending order.
    pub fn candidates(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.value(i)).collect()
    }
}

impl FromStr for GridRange {
    type Err = anyhow::Error;

    /// Parses `start,stop,step`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("Invalid range '{}': expected start,stop,step", s))?;
        match parts.as_slice() {
            [start, stop, step] => Ok(Self::new(*start, *stop, *step)),
            _ => anyhow::bail!("Invalid range '{}': expected exactly three values", s),
        }
    }
}

/// Inclusive integer range `[lower, upper]` sampled every `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapRange {
    pub lower: i64,
    pub upper: i64,
    pub step: i64,
}

impl OverlapRange {
    pub fn candidates(&self) -> Vec<i64> {
        if self.step <= 0 || self.upper < self.lower {
            return Vec::new();
        }
        (self.lower..=self.upper).step_by(self.step as usize).collect()
    }
}

impl FromStr for OverlapRange {
    type Err = anyhow::Error;

    /// Parses `lower,upper,step`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i64> = s
            .split(',')
            .map(|p| p.trim().parse::<i64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("Invalid overlap range '{}': expected lower,upper,step", s))?;
        match parts.as_slice() {
            [lower, upper, step] => Ok(Self { lower: *lower, upper: *upper, step: *step }),
            _ => anyhow::bail!("Invalid overlap range '{}': expected exactly three values", s),
        }
    }
}

/// Axis-of-rotation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    #[serde(default)]
    pub method: AxisMethod,

    /// Axis interval searched by the grid search
    #[serde(default = "default_search_range")]
    pub search: GridRange,

    /// Projection row reconstructed by the grid search
    #[serde(default = "default_search_row")]
    pub search_row: usize,

    /// Side length of the reconstructed test patch
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Linear axis drift used by the user-defined method
    #[serde(default)]
    pub user_defined: UserAxis,

    #[serde(default)]
    pub metric: SharpnessMetric,

    /// Smooth searched axes across z-views of the same sample
    #[serde(default)]
    pub correct_outliers: bool,

    #[serde(default)]
    pub outliers: OutlierThresholds,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            method: AxisMethod::default(),
            search: default_search_range(),
            search_row: default_search_row(),
            patch_size: default_patch_size(),
            user_defined: UserAxis::default(),
            metric: SharpnessMetric::default(),
            correct_outliers: false,
            outliers: OutlierThresholds::default(),
        }
    }
}

/// Axis at the first set and per-set increment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct UserAxis {
    #[serde(default)]
    pub base: f64,
    #[serde(default)]
    pub increment: f64,
}

/// Thresholds of the forward outlier filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierThresholds {
    /// First view is replaced by the minimum when it exceeds it by more than this
    #[serde(default = "default_first_view_margin")]
    pub first_view_margin: f64,

    /// Largest accepted jump between neighbouring views
    #[serde(default = "default_max_jump")]
    pub max_jump: f64,

    /// Increment applied in place of a rejected jump
    #[serde(default = "default_jump_step")]
    pub jump_step: f64,
}

impl Default for OutlierThresholds {
    fn default() -> Self {
        Self {
            first_view_margin: default_first_view_margin(),
            max_jump: default_max_jump(),
            jump_step: default_jump_step(),
        }
    }
}

/// Region configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Rows of the projections to process; all rows when unset
    #[serde(default)]
    pub vertical: Option<VerticalRoi>,
}

/// Vertical region of interest in projection rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerticalRoi {
    pub y: usize,
    pub height: usize,
    #[serde(default = "default_one")]
    pub step: usize,
}

impl VerticalRoi {
    /// Number of rows left after sub-sampling.
    pub fn rows(&self) -> usize {
        self.height / self.step.max(1)
    }
}

/// Optional processing stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter chain applied to all raw images before anything else
    #[serde(default)]
    pub preprocess: Option<String>,

    #[serde(default)]
    pub remove_spots: Option<SpotRemovalConfig>,

    #[serde(default)]
    pub phase_retrieval: Option<PhaseRetrievalConfig>,

    #[serde(default)]
    pub ring_removal: Option<RingRemovalConfig>,

    #[serde(default)]
    pub flat_field: FlatFieldConfig,

    /// Non-local-means denoising of the reconstructed slices
    #[serde(default)]
    pub denoise: Option<DenoiseConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotRemovalConfig {
    #[serde(default = "default_spot_threshold")]
    pub threshold: f64,
    #[serde(default = "default_spot_sigma")]
    pub sigma: f64,
}

/// Single-distance phase retrieval parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseRetrievalConfig {
    /// Photon energy in keV
    pub energy: f64,
    /// Pixel size in meters
    pub pixel_size: f64,
    /// Sample-detector distance in meters
    pub propagation_distance: f64,
    #[serde(default = "default_regularization_rate")]
    pub regularization_rate: f64,
}

/// Ring-removal filter applied to sinograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RingRemovalConfig {
    /// One-dimensional stripe filter
    Stripes1d { sigma_h: f64 },
    /// Two-dimensional stripe filter
    Stripes2d { sigma_h: f64, sigma_v: f64 },
    /// Sorting-based stripe removal run by an external script
    Sorting {
        script: PathBuf,
        #[serde(default = "default_narrow_window")]
        narrow_window: u32,
        #[serde(default)]
        wide: Option<WideStripes>,
    },
}

impl RingRemovalConfig {
    pub fn name(&self) -> &'static str {
        match self {
            RingRemovalConfig::Stripes1d { .. } => "1D stripes filter",
            RingRemovalConfig::Stripes2d { .. } => "2D stripes filter",
            RingRemovalConfig::Sorting { .. } => "sorting filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WideStripes {
    pub window: u32,
    pub snr: f64,
}

/// Flat-field correction settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatFieldConfig {
    #[serde(default)]
    pub method: FlatFieldMethod,
    #[serde(default)]
    pub dark_scale: Option<f64>,
    #[serde(default)]
    pub flat_scale: Option<f64>,
}

/// Flat-field correction algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlatFieldMethod {
    /// Done by whichever stage first needs corrected data
    #[default]
    Standard,
    /// Eigen flat-field correction as a separate stage
    Eigen(EigenFlatField),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenFlatField {
    #[serde(default = "default_eigen_method")]
    pub method: String,
    #[serde(default = "default_pco_repetitions")]
    pub pco_repetitions: u32,
    #[serde(default = "default_downsample")]
    pub pco_downsample: u32,
    #[serde(default = "default_downsample")]
    pub downsample: u32,
}

impl Default for EigenFlatField {
    fn default() -> Self {
        Self {
            method: default_eigen_method(),
            pco_repetitions: default_pco_repetitions(),
            pco_downsample: default_downsample(),
            downsample: default_downsample(),
        }
    }
}

impl FlatFieldConfig {
    pub fn eigen(&self) -> Option<&EigenFlatField> {
        match &self.method {
            FlatFieldMethod::Eigen(eigen) => Some(eigen),
            FlatFieldMethod::Standard => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiseConfig {
    #[serde(default = "default_patch_radius")]
    pub patch_radius: u32,
    #[serde(default = "default_search_radius")]
    pub search_radius: u32,
    #[serde(default)]
    pub h: f64,
    #[serde(default)]
    pub sigma: f64,
    #[serde(default)]
    pub window: f64,
    #[serde(default = "default_true")]
    pub fast: bool,
    #[serde(default)]
    pub estimate_sigma: bool,
    #[serde(default)]
    pub bigtiff: bool,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            patch_radius: default_patch_radius(),
            search_radius: default_search_radius(),
            h: 0.0,
            sigma: 0.0,
            window: 0.0,
            fast: true,
            estimate_sigma: false,
            bigtiff: false,
        }
    }
}

/// Reconstruction geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    #[serde(default = "default_overall_angle")]
    pub overall_angle: f64,

    /// Clockwise rotation of the reconstructed volume in degrees
    #[serde(default)]
    pub volume_angle_z: f64,

    #[serde(default)]
    pub laminography: Option<LaminographyConfig>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            overall_angle: default_overall_angle(),
            volume_angle_z: 0.0,
            laminography: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LaminographyConfig {
    #[serde(default)]
    pub axis_angle_x: Option<f64>,
    #[serde(default)]
    pub axis_angle_y: Option<f64>,
    #[serde(default)]
    pub center_position_z: Option<f64>,
}

/// External programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reconstruction engine executable
    #[serde(default = "default_engine_program")]
    pub program: String,

    /// Filter-graph executable used for preprocessing, ring removal and denoising
    #[serde(default = "default_filter_program")]
    pub filter_program: String,

    /// Eigen flat-field correction executable
    #[serde(default = "default_eigen_program")]
    pub eigen_program: String,

    /// Interpreter for the sorting ring-removal script
    #[serde(default = "default_script_interpreter")]
    pub script_interpreter: String,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub optimization: Option<GpuOptimization>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            filter_program: default_filter_program(),
            eigen_program: default_eigen_program(),
            script_interpreter: default_script_interpreter(),
            verbose: false,
            optimization: None,
        }
    }
}

/// GPU memory and splitting knobs forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOptimization {
    #[serde(default = "default_slice_memory_coeff")]
    pub slice_memory_coeff: f64,
    #[serde(default)]
    pub slices_per_device: Option<u32>,
    #[serde(default)]
    pub data_splitting_policy: Option<String>,
}

/// Processing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Parallel stitch workers (null = available cores)
    #[serde(default)]
    pub stitch_workers: Option<usize>,

    /// Progress reporting interval while stitching, in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            rayon_threads: None,
            stitch_workers: None,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Half-acquisition overlap search and stitching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Candidate overlap axes, inclusive of `upper`
    #[serde(default = "default_overlap_range")]
    pub search: OverlapRange,

    /// Projection row used to build sinograms; middle row when unset
    #[serde(default)]
    pub row: Option<usize>,

    /// Working directory for candidate sinograms
    #[serde(default = "default_stitch_temp_dir")]
    pub temp_dir: PathBuf,

    /// Ring-removal filter on candidate sinograms
    #[serde(default)]
    pub ring_removal: Option<RingRemovalConfig>,

    /// Pixels cropped from each side of stitched projections
    #[serde(default)]
    pub crop: usize,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            search: default_overlap_range(),
            row: None,
            temp_dir: default_stitch_temp_dir(),
            ring_removal: None,
            crop: 0,
        }
    }
}

/// A single validated change to a loaded configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    InputRoot(PathBuf),
    OutputRoot(PathBuf),
    StagingDir(PathBuf),
    DryRun(bool),
    KeepTemp(bool),
    AxisMethod(AxisMethod),
    SearchRange(GridRange),
    UserAxis(UserAxis),
    OverlapRange(OverlapRange),
}

impl Config {
    /// Minimal configuration for an input and output root; everything else defaulted.
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input: InputConfig {
                root: input_root.into(),
                layout: LayoutNames::default(),
                shared: None,
                image_extensions: default_image_extensions(),
            },
            output: OutputConfig {
                root: output_root.into(),
                staging_dir: default_staging_dir(),
                keep_temp: false,
                dry_run: false,
                save_params: true,
                bigtiff: false,
                clip_histogram: None,
                slice_roi: None,
            },
            axis: AxisConfig::default(),
            region: RegionConfig::default(),
            filters: FilterConfig::default(),
            reconstruction: ReconstructionConfig::default(),
            engine: EngineConfig::default(),
            processing: ProcessingConfig::default(),
            stitch: StitchConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Persist the configuration as YAML.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write configuration {}", path.display()))
    }

    /// Apply a single update; the previous state is restored if it fails validation.
    pub fn apply(&mut self, update: ConfigUpdate) -> anyhow::Result<()> {
        let previous = self.clone();
        match update {
            ConfigUpdate::InputRoot(path) => self.input.root = path,
            ConfigUpdate::OutputRoot(path) => self.output.root = path,
            ConfigUpdate::StagingDir(path) => self.output.staging_dir = path,
            ConfigUpdate::DryRun(value) => self.output.dry_run = value,
            ConfigUpdate::KeepTemp(value) => self.output.keep_temp = value,
            ConfigUpdate::AxisMethod(method) => self.axis.method = method,
            ConfigUpdate::SearchRange(range) => self.axis.search = range,
            ConfigUpdate::UserAxis(axis) => self.axis.user_defined = axis,
            ConfigUpdate::OverlapRange(range) => self.stitch.search = range,
        }
        if let Err(e) = self.validate() {
            *self = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let layout = &self.input.layout;
        for (role, name) in [
            ("darks", &layout.darks),
            ("flats", &layout.flats),
            ("projections", &layout.projections),
            ("flats2", &layout.flats2),
        ] {
            if name.is_empty() {
                anyhow::bail!("Directory name for {} must not be empty", role);
            }
        }
        if layout.projections == layout.darks || layout.projections == layout.flats {
            anyhow::bail!(
                "Projections directory '{}' must differ from darks and flats directories",
                layout.projections
            );
        }
        if layout.darks == layout.flats {
            anyhow::bail!("Darks and flats directories must differ (both '{}')", layout.darks);
        }
        if self.input.image_extensions.is_empty() {
            anyhow::bail!("At least one image file extension must be configured");
        }
        if let Some(shared) = &self.input.shared {
            if shared.darks.as_os_str().is_empty() || shared.flats.as_os_str().is_empty() {
                anyhow::bail!("Shared flats/darks are enabled but their paths are not set");
            }
        }

        if let Some(clip) = &self.output.clip_histogram {
            if clip.min > clip.max {
                anyhow::bail!(
                    "Histogram minimum {} must not exceed maximum {} (contrast inversion)",
                    clip.min,
                    clip.max
                );
            }
            if !matches!(clip.bitdepth, 8 | 16) {
                anyhow::bail!("Output bit depth must be 8 or 16, got {}", clip.bitdepth);
            }
        }

        if self.axis.method == AxisMethod::GridSearch {
            let range = &self.axis.search;
            if range.step <= 0.0 {
                anyhow::bail!("Axis search step must be > 0, got {}", range.step);
            }
            if range.start >= range.stop {
                anyhow::bail!(
                    "Axis search start {} must be smaller than stop {}",
                    range.start,
                    range.stop
                );
            }
            if self.axis.patch_size == 0 {
                anyhow::bail!("Axis search patch size must be > 0");
            }
        }
        let thresholds = &self.axis.outliers;
        if thresholds.max_jump <= 0.0 || thresholds.first_view_margin < 0.0 {
            anyhow::bail!("Outlier thresholds must be positive");
        }

        if let Some(roi) = &self.region.vertical {
            if roi.step == 0 {
                anyhow::bail!("Vertical ROI step must be > 0");
            }
            if roi.height == 0 {
                anyhow::bail!("Vertical ROI height must be > 0");
            }
        }

        for backend in [&self.filters.ring_removal, &self.stitch.ring_removal] {
            if let Some(RingRemovalConfig::Sorting { script, .. }) = backend {
                if script.as_os_str().is_empty() {
                    anyhow::bail!("Sorting ring-removal backend requires a script path");
                }
            }
        }
        if let Some(preprocess) = &self.filters.preprocess {
            if preprocess.trim().is_empty() {
                anyhow::bail!("Preprocess filter chain must not be empty when enabled");
            }
        }

        let overlap = &self.stitch.search;
        if overlap.step <= 0 {
            anyhow::bail!("Overlap search step must be > 0, got {}", overlap.step);
        }
        if overlap.lower > overlap.upper {
            anyhow::bail!(
                "Overlap search lower limit {} exceeds upper limit {}",
                overlap.lower,
                overlap.upper
            );
        }
        if overlap.lower < 1 {
            anyhow::bail!("Overlap search lower limit must be >= 1");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_image_extensions() -> Vec<String> { vec!["tif".to_string(), "tiff".to_string()] }
fn default_darks_name() -> String { "darks".to_string() }
fn default_flats_name() -> String { "flats".to_string() }
fn default_projections_name() -> String { "tomo".to_string() }
fn default_flats2_name() -> String { "flats2".to_string() }
fn default_staging_dir() -> PathBuf { std::env::temp_dir().join("tomo-batch-staging") }
fn default_stitch_temp_dir() -> PathBuf { std::env::temp_dir().join("tomo-batch-overlap") }
fn default_true() -> bool { true }
fn default_one() -> usize { 1 }
fn default_bitdepth() -> u8 { 8 }
fn default_search_range() -> GridRange { GridRange::new(1010.0, 1030.0, 0.5) }
fn default_search_row() -> usize { 100 }
fn default_patch_size() -> usize { 256 }
fn default_first_view_margin() -> f64 { 2.0 }
fn default_max_jump() -> f64 { 3.0 }
fn default_jump_step() -> f64 { 1.0 }
fn default_spot_threshold() -> f64 { 1000.0 }
fn default_spot_sigma() -> f64 { 2.0 }
fn default_regularization_rate() -> f64 { 2.0 }
fn default_narrow_window() -> u32 { 21 }
fn default_eigen_method() -> String { "eigen".to_string() }
fn default_pco_repetitions() -> u32 { 4 }
fn default_downsample() -> u32 { 2 }
fn default_patch_radius() -> u32 { 3 }
fn default_search_radius() -> u32 { 10 }
fn default_overall_angle() -> f64 { 180.0 }
fn default_engine_program() -> String { "tofu".to_string() }
fn default_filter_program() -> String { "ufo-launch".to_string() }
fn default_eigen_program() -> String { "bmit_sin".to_string() }
fn default_script_interpreter() -> String { "python".to_string() }
fn default_slice_memory_coeff() -> f64 { 0.8 }
fn default_metrics_interval() -> u64 { 10 }
fn default_overlap_range() -> OverlapRange { OverlapRange { lower: 100, upper: 200, step: 1 } }
