//! 360° overlap search.
//!
//! For every set one projection row is flat-field corrected into an
//! absorption sinogram. Its first half is stitched with the mirrored second
//! half at every candidate axis, the engine reconstructs one slice per
//! stitched sinogram, and the sharpest slice names the overlap.

use crate::config::Config;
use crate::index::{classify, AcquisitionLayout, CtSet, DataLocation};
use crate::io::{FrameRef, ImageStore};
use crate::pipeline::{CommandBuilder, CommandRunner, SetFailure, StagingArea};
use crate::stitch::{OverlapCandidate, OverlapError};
use crate::transform::flat_field::{absorption, interpolated_flat, mean_frame};
use crate::transform::{rank_by_sharpness, stitch_pair, IntensityRange};
use anyhow::{Context, Result};
use ndarray::{s, Array1, Array2, Axis};
use std::path::Path;

/// Directory under the output root holding the candidate slices of each set.
pub const OVERLAP_SEARCH_DIR: &str = "360axis-search";

/// Overlap found for one set.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOverlap {
    pub set: CtSet,
    pub set_id: String,
    pub location: DataLocation,
    pub axis: i64,
    /// Every candidate in ascending axis order
    pub candidates: Vec<OverlapCandidate>,
}

/// Outcome of searching every set of a batch.
#[derive(Debug, Clone, Default)]
pub struct OverlapReport {
    /// Number of valid sets found by the classifier
    pub sets: usize,
    pub overlaps: Vec<SetOverlap>,
    pub failed: Vec<SetFailure>,
}

impl std::fmt::Display for OverlapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Overlaps: {} of {} sets", self.overlaps.len(), self.sets)?;
        for overlap in &self.overlaps {
            let id = if overlap.set_id.is_empty() { "." } else { &overlap.set_id };
            write!(f, "\n  {}: {}", id, overlap.axis)?;
        }
        for failure in &self.failed {
            write!(f, "\n  {}: failed: {}", failure.set_id, failure.reason)?;
        }
        Ok(())
    }
}

pub struct OverlapSearch<'a> {
    config: &'a Config,
    store: &'a dyn ImageStore,
    runner: &'a dyn CommandRunner,
}

impl<'a> OverlapSearch<'a> {
    pub fn new(config: &'a Config, store: &'a dyn ImageStore, runner: &'a dyn CommandRunner) -> Self {
        Self { config, store, runner }
    }

    /// Search every valid set under the input root.
    ///
    /// A set whose search fails is reported and left out of the overlaps.
    pub fn search_all(&self, staging: &mut StagingArea) -> Result<OverlapReport> {
        self.config.validate()?;
        let root = &self.config.input.root;
        let layout = AcquisitionLayout::from_config(self.config);
        let sets = classify(root, &layout)?.into_valid(root, &layout)?;

        let mut report = OverlapReport {
            sets: sets.len(),
            ..Default::default()
        };
        for set in sets {
            let set_id = set.set_id(root);
            let location = layout.locate(&set);
            match self.search(&set, &location, staging) {
                Ok(overlap) => {
                    tracing::info!("Estimated overlap of {}: {}", overlap.set.root.display(), overlap.axis);
                    report.overlaps.push(overlap);
                }
                Err(e) => {
                    tracing::warn!("Overlap search failed for {}: {:#}", set.root.display(), e);
                    report.failed.push(SetFailure {
                        set_id,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        if !self.config.output.keep_temp {
            staging.sweep()?;
        }
        Ok(report)
    }

    /// Search the overlap of one set.
    pub fn search(
        &self,
        set: &CtSet,
        location: &DataLocation,
        staging: &mut StagingArea,
    ) -> Result<SetOverlap> {
        let range = self.config.stitch.search;
        let axes = range.candidates();
        if axes.is_empty() {
            return Err(OverlapError::NoCandidates(range).into());
        }

        let geometry = self.store.geometry(&location.projections)?;
        let row = match self.config.stitch.row {
            Some(row) if row < geometry.height => row,
            Some(row) => {
                tracing::warn!(
                    "Row {} outside projections with {} rows, using the middle row",
                    row,
                    geometry.height
                );
                geometry.height / 2
            }
            None => geometry.height / 2,
        };

        let sinogram = absorption_sinogram(self.store, location, row)?;
        let (frames, width) = sinogram.dim();
        let half = frames / 2;
        let first = sinogram.slice(s![..half, ..]);
        let second = sinogram.slice(s![half.., ..]);

        let set_id = set.set_id(&self.config.input.root);
        let scratch = staging.layout().root().join(scratch_name(&set_id, &set.root));
        let mut sinograms = scratch.join("sinos");
        staging.clear_dir(&sinograms)?;

        let mut crops = Vec::with_capacity(axes.len());
        let mut sinogram_width = 0;
        for &axis in &axes {
            let crop = if axis > (width / 2) as i64 {
                axis - range.lower
            } else {
                range.upper - axis
            };
            let crop = crop as usize;
            let stitched = stitch_pair(first, second, axis as f64, crop, IntensityRange::Unbounded)
                .with_context(|| format!("Stitching sinogram at axis {}", axis))?;
            sinogram_width = stitched.ncols();
            self.store
                .write_image(&sinograms.join(format!("sin-axis-{:04}.tif", axis)), stitched.view())?;
            crops.push(crop);
        }
        tracing::debug!(
            "{} stitched sinograms of width {} in {}",
            axes.len(),
            sinogram_width,
            sinograms.display()
        );

        let builder = CommandBuilder::new(self.config, geometry);
        if let Some(backend) = &self.config.stitch.ring_removal {
            let filtered = scratch.join("sinos-filt");
            staging.clear_dir(&filtered)?;
            tracing::info!("Applying {} to candidate sinograms", backend.name());
            self.runner
                .run(&builder.ring_removal(backend, &sinograms, &filtered, half, sinogram_width))?;
            sinograms = filtered;
        }

        let slices = self
            .config
            .output
            .root
            .join(OVERLAP_SEARCH_DIR)
            .join(format!("{}-sli.tif", scratch_name(&set_id, &set.root)));
        prepare_output(&slices)?;
        self.runner
            .run(&builder.overlap_slices(&sinograms, sinogram_width, &slices))?;

        let pages = self.store.page_count(&slices)?;
        if pages != axes.len() {
            anyhow::bail!(
                "Expected {} candidate slices in {}, found {}",
                axes.len(),
                slices.display(),
                pages
            );
        }
        let frames: Vec<FrameRef> = (0..pages)
            .map(|page| FrameRef {
                file: slices.clone(),
                page,
            })
            .collect();
        let images = self.store.read_frames(&frames).collect::<Result<Vec<_>>>()?;
        let ranking = rank_by_sharpness(&images, self.config.axis.metric)?;

        let candidates = axes
            .iter()
            .zip(crops)
            .zip(&ranking.scores)
            .map(|((&axis, crop), &sharpness_score)| OverlapCandidate {
                axis,
                crop,
                sharpness_score,
            })
            .collect();
        Ok(SetOverlap {
            set: set.clone(),
            set_id,
            location: location.clone(),
            axis: axes[ranking.best],
            candidates,
        })
    }
}

/// `-ln((tomo - dark) / (flat - dark))` of one row across all projections.
///
/// Darks and flats are averaged per column; with a second flat directory the
/// flat is blended linearly from the first to the last projection. An odd
/// projection count drops the last projection so the halves pair up.
pub fn absorption_sinogram(store: &dyn ImageStore, location: &DataLocation, row: usize) -> Result<Array2<f32>> {
    let frames = store.frames(&location.projections)?;
    let mut count = frames.len();
    if count % 2 == 1 {
        tracing::warn!(
            "Odd number of projections ({}) in {}, discarding the last one",
            count,
            location.projections.display()
        );
        count -= 1;
    }
    if count < 2 {
        anyhow::bail!("{} holds fewer than two projections", location.projections.display());
    }

    let rows = frame_rows(store, &frames[..count], row)?;
    let width = rows[0].len();
    let mut tomo = Array2::<f32>::zeros((count, width));
    for (i, (frame, values)) in frames.iter().zip(&rows).enumerate() {
        if values.len() != width {
            anyhow::bail!("{} is not {} pixels wide", frame.file.display(), width);
        }
        tomo.row_mut(i).assign(values);
    }

    let dark = mean_row(store, &location.darks, row)?;
    let flat = mean_row(store, &location.flats, row)?;
    let flat2 = match &location.flats2 {
        Some(dir) => Some(mean_row(store, dir, row)?),
        None => None,
    };
    let mut references = vec![(&location.darks, &dark), (&location.flats, &flat)];
    if let (Some(dir), Some(flat2)) = (&location.flats2, &flat2) {
        references.push((dir, flat2));
    }
    for (dir, reference) in references {
        if reference.ncols() != width {
            anyhow::bail!("Frames in {} do not match the projection width {}", dir.display(), width);
        }
    }
    let mut flats = Array2::<f32>::zeros((count, width));
    for i in 0..count {
        match &flat2 {
            Some(flat2) => flats
                .row_mut(i)
                .assign(&interpolated_flat(flat.view(), flat2.view(), i, count).row(0)),
            None => flats.row_mut(i).assign(&flat.row(0)),
        }
    }
    let dark = dark
        .broadcast((count, width))
        .with_context(|| format!("Darks in {} do not match the projection width", location.darks.display()))?;
    Ok(absorption(tomo.view(), dark, flats.view()))
}

/// Per-column mean of `row` over every frame of `dir`, as a `1 x width` image.
fn mean_row(store: &dyn ImageStore, dir: &Path, row: usize) -> Result<Array2<f32>> {
    let rows: Vec<Array2<f32>> = frame_rows(store, &store.frames(dir)?, row)?
        .into_iter()
        .map(|r| r.insert_axis(Axis(0)))
        .collect();
    mean_frame(&rows).with_context(|| format!("No frames in {}", dir.display()))
}

/// `row` of every frame, reading the frames in one pass.
fn frame_rows(store: &dyn ImageStore, frames: &[FrameRef], row: usize) -> Result<Vec<Array1<f32>>> {
    frames
        .iter()
        .zip(store.read_frames(frames))
        .map(|(frame, image)| {
            let image = image?;
            if row >= image.nrows() {
                anyhow::bail!(
                    "Row {} out of range for {} ({} rows)",
                    row,
                    frame.file.display(),
                    image.nrows()
                );
            }
            Ok(image.row(row).to_owned())
        })
        .collect()
}

/// File-system friendly name of a set.
fn scratch_name(set_id: &str, root: &Path) -> String {
    if set_id.is_empty() {
        return root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
    }
    set_id.replace(['/', '\\'], "_")
}

fn prepare_output(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", file.display())),
    }
    Ok(())
}
