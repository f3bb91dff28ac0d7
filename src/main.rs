//! Tomo Batch CLI
//!
//! Batch CT reconstruction and half-acquisition stitching.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tomo_batch::config::{GridRange, OverlapRange};
use tomo_batch::{auto_stitch, find_overlaps, init_rayon, plan_batch, run_batch, Config, ConfigUpdate};

#[derive(Parser)]
#[command(name = "tomo-batch")]
#[command(about = "Plan and run CT reconstructions for every acquisition below a root", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct every CT set (default if no command specified)
    Run {
        /// Print the commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// Keep intermediate data after the run
        #[arg(long)]
        keep_temp: bool,

        /// Override the axis search range as start,stop,step
        #[arg(long)]
        axis_range: Option<GridRange>,
    },

    /// Classify, resolve axes and print the planned commands
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Search the 360° overlap of every CT set
    FindOverlap {
        /// Override the overlap range as lower,upper,step
        #[arg(long)]
        range: Option<OverlapRange>,
    },

    /// Find overlaps and stitch every CT set into <output>/stitched
    AutoStitch {
        /// Search and log overlaps without stitching
        #[arg(long)]
        dry_run: bool,

        /// Override the overlap range as lower,upper,step
        #[arg(long)]
        range: Option<OverlapRange>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_command(cli.config, Vec::new())?,

        Some(Commands::Run {
            dry_run,
            keep_temp,
            axis_range,
        }) => {
            let mut updates = flag_updates(dry_run, keep_temp);
            updates.extend(axis_range.map(ConfigUpdate::SearchRange));
            run_command(cli.config, updates)?;
        }

        Some(Commands::Plan) => {
            plan_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::FindOverlap { range }) => {
            let updates = range.map(ConfigUpdate::OverlapRange).into_iter().collect();
            find_overlap_command(cli.config, updates)?;
        }

        Some(Commands::AutoStitch { dry_run, range }) => {
            let mut updates = flag_updates(dry_run, false);
            updates.extend(range.map(ConfigUpdate::OverlapRange));
            auto_stitch_command(cli.config, updates)?;
        }
    }

    Ok(())
}

/// Switches given on the command line; absent ones keep the file's value.
fn flag_updates(dry_run: bool, keep_temp: bool) -> Vec<ConfigUpdate> {
    let mut updates = Vec::new();
    if dry_run {
        updates.push(ConfigUpdate::DryRun(true));
    }
    if keep_temp {
        updates.push(ConfigUpdate::KeepTemp(true));
    }
    updates
}

fn load_config(config_path: &Path, updates: Vec<ConfigUpdate>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    for update in updates {
        config.apply(update)?;
    }
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, updates: Vec<ConfigUpdate>) -> Result<()> {
    let config = load_config(&config_path, updates)?;

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    let report = run_batch(&config)?;
    println!("{}", report);
    if !report.is_success() {
        anyhow::bail!("{} of {} CT sets failed", report.failed.len(), report.total());
    }
    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, Vec::new())?;
    init_rayon(config.processing.rayon_threads)?;
    let plan = plan_batch(&config)?;

    println!("\n=== Batch Plan ===");
    for set in &plan.sets {
        let id = if set.set_id.is_empty() { "." } else { &set.set_id };
        println!(
            "\n# {} ({} projections {}x{}, axis {} by {})",
            id, set.geometry.frames, set.geometry.height, set.geometry.width, set.axis.value, set.axis.method
        );
        for command in &set.commands {
            println!("{}", command);
        }
    }
    for id in &plan.skipped {
        println!("\n# {} already reconstructed", id);
    }
    for failure in &plan.failed {
        println!("\n# {} cannot be processed: {}", failure.set_id, failure.reason);
    }
    println!("==================\n");
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn find_overlap_command(config_path: PathBuf, updates: Vec<ConfigUpdate>) -> Result<()> {
    let config = load_config(&config_path, updates)?;
    init_rayon(config.processing.rayon_threads)?;
    let report = find_overlaps(&config)?;
    println!("{}", report);
    Ok(())
}

fn auto_stitch_command(config_path: PathBuf, updates: Vec<ConfigUpdate>) -> Result<()> {
    let config = load_config(&config_path, updates)?;
    init_rayon(config.processing.rayon_threads)?;
    let stats = auto_stitch(&config)?;
    println!("{}", stats);
    if !stats.failed.is_empty() {
        anyhow::bail!("{} CT sets could not be stitched", stats.failed.len());
    }
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Tomo Batch Configuration

# === INPUT: where the CT sets live ===
input:
  # Every directory below root holding a projections sub-directory is a candidate CT set
  root: "/data/scan"

  # Names of the role sub-directories inside every CT set
  layout:
    darks: darks
    flats: flats
    projections: tomo
    flats2: flats2

  # Darks and flats shared by every set instead of per-set directories
  # shared:
  #   darks: "/data/common/darks"
  #   flats: "/data/common/flats"
  #   flats2: "/data/common/flats2"

  image_extensions: [tif, tiff]

# === OUTPUT: where reconstructions go ===
output:
  # The input tree is mirrored below root
  root: "/data/reco"

  # Intermediate data, shared by all sets of a run
  staging_dir: "/tmp/tomo-batch-staging"
  keep_temp: false

  # Print commands instead of running them
  dry_run: false

  # Write reco.params and parameters.yaml next to every reconstruction
  save_params: true
  bigtiff: false

  # Convert to 8 or 16 bit by clipping the 32-bit histogram
  # clip_histogram:
  #   bitdepth: 8
  #   min: -0.001
  #   max: 0.002

  # Crop of the reconstructed slices
  # slice_roi: { x: 0, width: 1024, y: 0, height: 1024 }

# === AXIS: rotation axis of every set ===
axis:
  # correlation | grid_search | user_defined | image_midpoint
  method: grid_search

  # Half-open interval [start, stop) searched every step
  search: { start: 1010.0, stop: 1030.0, step: 0.5 }

  # Projection row reconstructed for every candidate
  search_row: 100
  patch_size: 256

  # Axis of the first set and drift per set (user_defined)
  user_defined: { base: 0.0, increment: 0.0 }

  # gradient | std
  metric: gradient

  # Smooth searched axes across the z-views of one sample
  correct_outliers: false
  outliers: { first_view_margin: 2.0, max_jump: 3.0, jump_step: 1.0 }

# === REGION: rows of the projections to reconstruct (all when unset) ===
region: {}
  # vertical: { y: 0, height: 200, step: 1 }

# === FILTERS: optional stages ===
filters:
  # Filter chain applied to every raw image first
  # preprocess: "remove-outliers size=3 threshold=500 sign=1"

  # remove_spots: { threshold: 1000.0, sigma: 2.0 }

  # phase_retrieval:
  #   energy: 20.0
  #   pixel_size: 3.6e-6
  #   propagation_distance: 0.1
  #   regularization_rate: 2.0

  # Backends: stripes1d { sigma_h }, stripes2d { sigma_h, sigma_v },
  # sorting { script, narrow_window, wide: { window, snr } }
  # ring_removal: { backend: stripes1d, sigma_h: 2.0 }

  # kind: standard | eigen
  flat_field:
    method: { kind: standard }

  # denoise: { patch_radius: 3, search_radius: 10, h: 0.0, sigma: 0.0 }

# === RECONSTRUCTION ===
reconstruction:
  overall_angle: 180.0
  volume_angle_z: 0.0
  # laminography: { axis_angle_x: 30.0 }

# === ENGINE: external programs ===
engine:
  program: tofu
  filter_program: ufo-launch
  eigen_program: bmit_sin
  script_interpreter: python
  verbose: false
  # optimization: { slice_memory_coeff: 0.8, slices_per_device: 100 }

# === PROCESSING: performance tuning ===
processing:
  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for CPU work (null = num CPUs)
  # rayon_threads: 8

  # Parallel stitch workers (null = num CPUs)
  # stitch_workers: 8

  metrics_interval_secs: 10
  # metrics_output_path: "/data/reco/metrics.json"

# === STITCH: half-acquisition overlap search ===
stitch:
  # Inclusive [lower, upper] overlap candidates
  search: { lower: 100, upper: 200, step: 1 }

  # Projection row of the candidate sinograms (middle row when unset)
  # row: 1000

  temp_dir: "/tmp/tomo-batch-overlap"
  crop: 0
  # ring_removal: { backend: stripes2d, sigma_h: 3.0, sigma_v: 1.0 }
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["tomo-batch"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["tomo-batch", "-c", "other.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["tomo-batch", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_run_overrides() {
        let cli = Cli::try_parse_from(["tomo-batch", "run", "--dry-run", "--axis-range", "1000,1010,0.5"]).unwrap();
        match cli.command {
            Some(Commands::Run {
                dry_run,
                keep_temp,
                axis_range,
            }) => {
                assert!(dry_run);
                assert!(!keep_temp);
                assert_eq!(axis_range, Some(GridRange::new(1000.0, 1010.0, 0.5)));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_range() {
        assert!(Cli::try_parse_from(["tomo-batch", "find-overlap", "--range", "1,2"]).is_err());
        assert!(Cli::try_parse_from(["tomo-batch", "auto-stitch", "--range", "100,200,2"]).is_ok());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.input.layout.projections, "tomo");
        assert_eq!(config.stitch.search, OverlapRange { lower: 100, upper: 200, step: 1 });
    }

    #[test]
    fn test_absent_flags_keep_config_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = SAMPLE_CONFIG
            .replace("dry_run: false", "dry_run: true")
            .replace("keep_temp: false", "keep_temp: true");
        std::fs::write(&path, yaml).unwrap();

        assert!(flag_updates(false, false).is_empty());
        let config = load_config(&path, flag_updates(false, false)).unwrap();
        assert!(config.output.dry_run);
        assert!(config.output.keep_temp);

        assert_eq!(
            flag_updates(true, true),
            vec![ConfigUpdate::DryRun(true), ConfigUpdate::KeepTemp(true)]
        );
    }

    #[test]
    fn test_load_config_applies_updates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = load_config(&path, vec![ConfigUpdate::DryRun(true)]).unwrap();
        assert!(config.output.dry_run);
        assert!(load_config(&path, vec![ConfigUpdate::SearchRange(GridRange::new(5.0, 1.0, 1.0))]).is_err());
    }
}
