//! Find-and-stitch: one overlap per set, optional cross-view correction, then
//! every set's opposing projection pairs merged on a worker pool.

use crate::axis::{correct_series, ZStackSeries};
use crate::config::Config;
use crate::io::{AxisValuesLog, ImageStore};
use crate::pipeline::{BatchMetrics, MetricsReporter, SetFailure};
use crate::stitch::{OverlapError, OverlapReport};
use crate::transform::stitch_pair;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Directory under the output root receiving stitched sets.
pub const STITCHED_DIR: &str = "stitched";

/// Configuration snapshot written at the start of an auto-stitch run.
pub const AUTO_STITCH_PARAMS_FILE: &str = "auto_stitch_parameters.yaml";

/// Stitching of one set.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchJob {
    pub set_id: String,
    pub root: PathBuf,
    pub axis: i64,
    pub crop: usize,
    /// Source role directory and its output directory
    pub roles: Vec<(PathBuf, PathBuf)>,
}

/// Outcome of [`stitch_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StitchStats {
    pub processed: Vec<String>,
    pub failed: Vec<SetFailure>,
    pub frames: u64,
}

impl std::fmt::Display for StitchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stitched: {} sets, Failed: {}, Frames: {}",
            self.processed.len(),
            self.failed.len(),
            self.frames
        )
    }
}

/// Turn the overlaps of a batch into stitch jobs.
///
/// Every classified set must have an overlap; a partial result is refused.
pub fn plan_stitch(config: &Config, report: &OverlapReport) -> Result<Vec<StitchJob>, OverlapError> {
    if report.overlaps.len() != report.sets {
        return Err(OverlapError::CountMismatch {
            overlaps: report.overlaps.len(),
            sets: report.sets,
        });
    }

    let series: ZStackSeries = report
        .overlaps
        .iter()
        .map(|o| (o.set.root.clone(), o.axis as f64))
        .collect();
    let series = if config.axis.correct_outliers {
        correct_series(&series, &config.axis.outliers)
    } else {
        series
    };

    let names = &config.input.layout;
    let stitched = config.output.root.join(STITCHED_DIR);
    let jobs = report
        .overlaps
        .iter()
        .map(|overlap| {
            let axis = series
                .get(&overlap.set.root)
                .map_or(overlap.axis, |v| v.round() as i64);
            let out = stitched.join(overlap.set.relative_path(&config.input.root));
            let location = &overlap.location;
            let mut roles = vec![
                (location.darks.clone(), out.join(&names.darks)),
                (location.flats.clone(), out.join(&names.flats)),
            ];
            if let Some(flats2) = &location.flats2 {
                roles.push((flats2.clone(), out.join(&names.flats2)));
            }
            roles.push((location.projections.clone(), out.join(&names.projections)));
            StitchJob {
                set_id: overlap.set_id.clone(),
                root: overlap.set.root.clone(),
                axis,
                crop: config.stitch.crop,
                roles,
            }
        })
        .collect();
    Ok(jobs)
}

/// The `axis_values.info` record of a planned batch.
pub fn axis_values_log(config: &Config, jobs: &[StitchJob]) -> AxisValuesLog {
    let names = &config.input.layout;
    let (shared_flats, darks_dir, flats_dir, flats2_dir) = match &config.input.shared {
        Some(shared) => (
            true,
            shared.darks.display().to_string(),
            shared.flats.display().to_string(),
            shared
                .flats2
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        None => (false, names.darks.clone(), names.flats.clone(), names.flats2.clone()),
    };
    let search = config.stitch.search;
    AxisValuesLog {
        input_dir: config.input.root.clone(),
        output_dir: config.output.root.clone(),
        shared_flats,
        darks_dir,
        flats_dir,
        flats2_dir,
        search: format!("{},{},{}", search.lower, search.upper, search.step),
        axes: jobs.iter().map(|j| (j.root.clone(), j.axis)).collect(),
    }
}

#[derive(Debug, Clone)]
struct StitchWork {
    set_id: String,
    source: PathBuf,
    output: PathBuf,
    axis: i64,
    crop: usize,
}

/// Stitch every job on `workers` parallel workers.
///
/// Each role directory is one unit of work; a set fails when any of its
/// directories fails, the others are unaffected.
pub async fn stitch_all(
    jobs: Vec<StitchJob>,
    store: Arc<dyn ImageStore>,
    metrics: Arc<BatchMetrics>,
    workers: usize,
    report_interval_secs: u64,
) -> StitchStats {
    let work: Vec<StitchWork> = jobs
        .iter()
        .flat_map(|job| {
            tracing::info!(
                "{}: horizontal acquisition axis position {}, margin to crop {} pixels",
                job.root.display(),
                job.axis,
                job.crop
            );
            job.roles.iter().map(move |(source, output)| StitchWork {
                set_id: job.set_id.clone(),
                source: source.clone(),
                output: output.clone(),
                axis: job.axis,
                crop: job.crop,
            })
        })
        .collect();
    let total_frames: u64 = work
        .iter()
        .map(|w| store.frames(&w.source).map_or(0, |f| opposing_pairs(f.len()).len() as u64))
        .sum();
    let workers = workers.max(1);
    tracing::info!(
        "Stitching {} directories of {} sets ({} frames, {} workers)",
        work.len(),
        jobs.len(),
        total_frames,
        workers
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter = tokio::spawn(
        MetricsReporter::new(metrics.clone(), report_interval_secs, total_frames).run(shutdown_rx),
    );

    let (work_tx, work_rx) = async_channel::bounded::<StitchWork>(work.len().max(1));
    for item in work {
        let _ = work_tx.send(item).await;
    }
    work_tx.close();

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let store = store.clone();
        let metrics = metrics.clone();
        let work_rx = work_rx.clone();

        let handle = tokio::spawn(async move {
            let mut frames = 0u64;
            let mut failed = Vec::new();
            while let Ok(work) = work_rx.recv().await {
                let set_id = work.set_id.clone();
                let source = work.source.clone();
                let store = store.clone();
                let task_metrics = metrics.clone();

                // CPU-bound work in spawn_blocking
                let result =
                    tokio::task::spawn_blocking(move || stitch_directory(store.as_ref(), &work, &task_metrics))
                        .await;
                let reason = match result {
                    Ok(Ok(count)) => {
                        frames += count;
                        continue;
                    }
                    Ok(Err(e)) => format!("{}: {:#}", source.display(), e),
                    Err(e) => format!("{}: stitch task failed: {}", source.display(), e),
                };
                tracing::warn!("Stitching failed for {}", reason);
                failed.push(SetFailure { set_id, reason });
            }
            (frames, failed)
        });
        handles.push(handle);
    }

    let mut stats = StitchStats::default();
    let mut failed: Vec<SetFailure> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok((frames, worker_failed)) => {
                stats.frames += frames;
                failed.extend(worker_failed);
            }
            Err(e) => tracing::warn!("Stitch worker stopped: {}", e),
        }
    }

    let _ = shutdown_tx.send(()).await;
    let _ = reporter.await;

    for job in &jobs {
        match failed.iter().find(|f| f.set_id == job.set_id) {
            Some(failure) => {
                metrics.add_set_failed();
                stats.failed.push(failure.clone());
            }
            None => {
                metrics.add_set_processed();
                stats.processed.push(job.set_id.clone());
            }
        }
    }
    stats
}

/// Frame pairs `(i, i + N/2)` of a directory with `count` frames.
///
/// An odd count drops the last frame; a lone frame is paired with itself.
fn opposing_pairs(count: usize) -> Vec<(usize, usize)> {
    if count == 1 {
        return vec![(0, 0)];
    }
    let half = count / 2;
    (0..half).map(|i| (i, i + half)).collect()
}

fn stitch_directory(store: &dyn ImageStore, work: &StitchWork, metrics: &BatchMetrics) -> Result<u64> {
    let frames = store.frames(&work.source)?;
    if frames.is_empty() {
        anyhow::bail!("No frames in {}", work.source.display());
    }
    std::fs::create_dir_all(&work.output)
        .with_context(|| format!("Failed to create {}", work.output.display()))?;

    // Output keeps the sample type of the input
    let format = store.sample_format(&frames[0].file)?;

    let pairs = opposing_pairs(frames.len());
    let firsts: Vec<_> = pairs.iter().map(|&(a, _)| frames[a].clone()).collect();
    let opposites: Vec<_> = pairs.iter().map(|&(_, b)| frames[b].clone()).collect();
    let pages = store.read_frames(&firsts).zip(store.read_frames(&opposites));
    for (k, (first, opposite)) in pages.enumerate() {
        let (first, opposite) = (first?, opposite?);
        let merged = stitch_pair(first.view(), opposite.view(), work.axis as f64, work.crop, format.into())?;
        store.write_image_as(&work.output.join(format!("sti-{:05}.tif", k)), merged.view(), format)?;
        metrics.add_frames_stitched(1);
    }
    Ok(pairs.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{CtSet, DataLocation, SetKind};
    use crate::io::{SampleFormat, TiffStore};
    use crate::stitch::SetOverlap;
    use ndarray::Array2;
    use std::path::Path;
    use tempfile::tempdir;

    fn overlap(input: &Path, name: &str, axis: i64) -> SetOverlap {
        let root = input.join(name);
        SetOverlap {
            set: CtSet {
                root: root.clone(),
                kind: SetKind::NoSecondFlat,
            },
            set_id: name.to_string(),
            location: DataLocation {
                darks: root.join("darks"),
                flats: root.join("flats"),
                flats2: None,
                projections: root.join("tomo"),
            },
            axis,
            candidates: Vec::new(),
        }
    }

    fn report(input: &Path, axes: &[(&str, i64)], sets: usize) -> OverlapReport {
        OverlapReport {
            sets,
            overlaps: axes.iter().map(|(name, axis)| overlap(input, name, *axis)).collect(),
            failed: Vec::new(),
        }
    }

    #[test]
    fn test_partial_overlaps_are_refused() {
        let config = Config::new("/in", "/out");
        let err = plan_stitch(&config, &report(Path::new("/in"), &[("z00", 100)], 2)).unwrap_err();
        assert_eq!(err, OverlapError::CountMismatch { overlaps: 1, sets: 2 });
    }

    #[test]
    fn test_plan_corrects_outliers_and_mirrors_tree() {
        let mut config = Config::new("/in", "/out");
        config.axis.correct_outliers = true;
        let axes = [("s/z00", 100), ("s/z01", 115), ("s/z02", 101)];
        let jobs = plan_stitch(&config, &report(Path::new("/in"), &axes, 3)).unwrap();

        assert_eq!(jobs.iter().map(|j| j.axis).collect::<Vec<_>>(), vec![100, 101, 101]);
        assert_eq!(
            jobs[1].roles.last().unwrap(),
            &(PathBuf::from("/in/s/z01/tomo"), PathBuf::from("/out/stitched/s/z01/tomo"))
        );
        assert_eq!(jobs[1].roles.len(), 3);

        let log = axis_values_log(&config, &jobs);
        assert_eq!(log.greatest_axis(), Some(101));
        assert_eq!(log.search, "100,200,1");
        assert!(!log.shared_flats);
    }

    #[test]
    fn test_opposing_pairs() {
        assert_eq!(opposing_pairs(4), vec![(0, 2), (1, 3)]);
        assert_eq!(opposing_pairs(5), vec![(0, 2), (1, 3)]);
        assert_eq!(opposing_pairs(1), vec![(0, 0)]);
        assert!(opposing_pairs(0).is_empty());
    }

    fn write_frames(dir: &Path, count: usize) {
        let store = TiffStore::default();
        for i in 0..count {
            let frame = Array2::from_shape_fn((4, 8), |(_, x)| 100.0 + x as f32 + i as f32);
            store.write_image(&dir.join(format!("f-{:04}.tif", i)), frame.view()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_stitch_all_sets() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        for name in ["z00", "z01"] {
            write_frames(&input.join(name).join("darks"), 1);
            write_frames(&input.join(name).join("flats"), 2);
            write_frames(&input.join(name).join("tomo"), 5);
        }
        let config = Config::new(&input, dir.path().join("out"));
        let jobs = plan_stitch(&config, &report(&input, &[("z00", 6), ("z01", 6)], 2)).unwrap();

        let store: Arc<dyn ImageStore> = Arc::new(TiffStore::default());
        let metrics = BatchMetrics::new();
        let stats = stitch_all(jobs, store.clone(), metrics.clone(), 2, 60).await;

        assert_eq!(stats.processed.len(), 2);
        assert!(stats.failed.is_empty());
        // per set: 1 dark (self-paired) + 1 flat pair + 2 projection pairs
        assert_eq!(stats.frames, 8);
        assert_eq!(metrics.snapshot().frames_stitched, 8);

        let tomo = dir.path().join("out/stitched/z01/tomo");
        let files = store.list_images(&tomo).unwrap();
        assert_eq!(files.len(), 2);
        // axis 6 of width 8 overlaps by 4 px
        assert_eq!(store.dimensions(&files[0]).unwrap(), (4, 12));
    }

    #[tokio::test]
    async fn test_stitch_keeps_float_values_and_integer_type() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let store = TiffStore::default();
        let z00 = input.join("z00");
        for role in ["darks", "flats", "tomo"] {
            let frame = Array2::from_elem((3, 8), -0.5f32);
            store.write_image(&z00.join(role).join("f-0000.tif"), frame.view()).unwrap();
            store.write_image(&z00.join(role).join("f-0001.tif"), frame.view()).unwrap();
        }
        let z01 = input.join("z01");
        for role in ["darks", "flats", "tomo"] {
            let frame = Array2::from_elem((3, 8), 200.0f32);
            store
                .write_image_as(&z01.join(role).join("f-0000.tif"), frame.view(), SampleFormat::U8)
                .unwrap();
        }

        let config = Config::new(&input, dir.path().join("out"));
        let jobs = plan_stitch(&config, &report(&input, &[("z00", 6), ("z01", 6)], 2)).unwrap();
        let stats = stitch_all(jobs, Arc::new(store.clone()), BatchMetrics::new(), 2, 60).await;
        assert!(stats.failed.is_empty());

        let float = dir.path().join("out/stitched/z00/tomo/sti-00000.tif");
        let merged = store.read_page(&float, 0).unwrap();
        assert_eq!(merged.dim(), (3, 12));
        assert!(merged.iter().all(|&v| (v + 0.5).abs() < 1e-6));

        let bytes = dir.path().join("out/stitched/z01/tomo/sti-00000.tif");
        assert_eq!(store.sample_format(&bytes).unwrap(), SampleFormat::U8);
        assert!(store.read_page(&bytes, 0).unwrap().iter().all(|&v| v == 200.0));
    }

    #[tokio::test]
    async fn test_failing_set_leaves_others() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        write_frames(&input.join("good/darks"), 1);
        write_frames(&input.join("good/flats"), 1);
        write_frames(&input.join("good/tomo"), 2);
        write_frames(&input.join("bad/darks"), 1);
        write_frames(&input.join("bad/flats"), 1);

        let config = Config::new(&input, dir.path().join("out"));
        let jobs = plan_stitch(&config, &report(&input, &[("bad", 6), ("good", 6)], 2)).unwrap();
        let metrics = BatchMetrics::new();
        let stats = stitch_all(jobs, Arc::new(TiffStore::default()), metrics.clone(), 3, 60).await;

        assert_eq!(stats.processed, vec!["good"]);
        assert_eq!(stats.failed.len(), 1);
        assert_eq!(stats.failed[0].set_id, "bad");
        assert_eq!(metrics.snapshot().sets_failed, 1);
        assert_eq!(stats.to_string(), "Stitched: 1 sets, Failed: 1, Frames: 5");
    }
}
