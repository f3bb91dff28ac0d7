//! Typed external-program invocations.
//!
//! Every stage is translated into one or more [`EngineCommand`]s: a program
//! name plus an argument vector. Nothing is joined into a shell string, so
//! paths with spaces or negative option values need no quoting.

use crate::config::{Config, RingRemovalConfig};
use crate::index::DataLocation;
use crate::io::StackGeometry;
use crate::pipeline::stages::{PipelineStage, StageKind, StagePlan};
use crate::pipeline::staging::StagingLayout;
use std::fmt;
use std::path::Path;

const PROJECTION_PATTERN: &str = "proj-%05i.tif";
const SINOGRAM_PATTERN: &str = "sin-%04i.tif";
const SLICE_PATTERN: &str = "sli-%04i.tif";

/// One invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str) -> Self {
        self.arg(format!("--{}", name))
    }

    /// `--name value` as two arguments.
    pub fn opt(self, name: &str, value: impl fmt::Display) -> Self {
        self.flag(name).arg(value.to_string())
    }

    /// `--name=value` as one argument, for values that may start with `-`.
    pub fn opt_eq(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{}={}", name, value))
    }

    pub fn path(self, name: &str, path: &Path) -> Self {
        self.opt(name, path.display())
    }

    fn when(self, cond: bool, f: impl FnOnce(Self) -> Self) -> Self {
        if cond {
            f(self)
        } else {
            self
        }
    }

    /// Whether any argument equals `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `--name`, or the right side of `--name=value`.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        let flag = format!("--{}", name);
        let prefix = format!("--{}=", name);
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            if *arg == flag {
                return iter.next().map(String::as_str);
            }
            if let Some(value) = arg.strip_prefix(&prefix) {
                return Some(value);
            }
        }
        None
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Builds the commands of one set from its configuration and scan geometry.
pub struct CommandBuilder<'a> {
    config: &'a Config,
    geometry: StackGeometry,
    staging: StagingLayout,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a Config, geometry: StackGeometry) -> Self {
        Self {
            config,
            geometry,
            staging: StagingLayout::new(&config.output.staging_dir),
        }
    }

    /// Commands of every stage, in execution order.
    pub fn plan(&self, plan: &StagePlan) -> Vec<EngineCommand> {
        plan.stages.iter().flat_map(|s| self.stage(s)).collect()
    }

    pub fn stage(&self, stage: &PipelineStage) -> Vec<EngineCommand> {
        let input = &stage.input;
        let out = stage.output_dir.as_path();
        match &stage.kind {
            StageKind::Preprocess { filters } => self.preprocess(input, out, filters),
            StageKind::SpotRemoval { params, absorptivity } => {
                let mask = self.staging.spot_masks().join("mask.tif");
                vec![
                    self.engine("find-large-spots")
                        .path("images", &input.flats)
                        .opt("spot-threshold", params.threshold)
                        .opt("gauss-sigma", params.sigma)
                        .path("output", &mask),
                    self.flat_corrected(self.engine("flatcorrect"), input, *absorptivity)
                        .path("projections", &input.projections)
                        .path("large-spot-mask", &mask)
                        .path("output", &out.join(PROJECTION_PATTERN)),
                ]
            }
            StageKind::FlatFieldCorrection(eigen) => {
                let cmd = EngineCommand::new(&self.config.engine.eigen_program)
                    .flag("fix-nan")
                    .path("darks", &input.darks)
                    .path("flats", &input.flats)
                    .path("projections", &input.projections);
                let cmd = match &input.flats2 {
                    Some(flats2) => cmd.path("flats2", flats2),
                    None => cmd,
                };
                vec![cmd
                    .path("output", out)
                    .opt("method", &eigen.method)
                    .flag("multiprocessing")
                    .opt("eigen-pco-repetitions", eigen.pco_repetitions)
                    .opt("eigen-pco-downsample", eigen.pco_downsample)
                    .opt("downsample", eigen.downsample)]
            }
            StageKind::PhaseRetrieval { params, flat_correct } => {
                let cmd = self.engine("preprocess");
                let cmd = if *flat_correct {
                    let cmd = cmd
                        .flag("fix-nan-and-inf")
                        .opt("projection-filter", "none")
                        .opt("delta", "1e-6");
                    self.reference_frames(cmd, input)
                        .path("projections", &input.projections)
                        .path("output", &out.join(PROJECTION_PATTERN))
                        .opt("energy", params.energy)
                        .opt("propagation-distance", params.propagation_distance)
                        .opt("pixel-size", params.pixel_size)
                        .opt("regularization-rate", format!("{:.2}", params.regularization_rate))
                        .pipe(|c| self.flat_scales(c))
                } else {
                    cmd.opt("delta", "1e-6")
                        .opt("energy", params.energy)
                        .opt("propagation-distance", params.propagation_distance)
                        .opt("pixel-size", params.pixel_size)
                        .opt("regularization-rate", format!("{:.2}", params.regularization_rate))
                        .path("projections", &input.projections)
                        .path("output", &out.join(PROJECTION_PATTERN))
                        .opt("projection-crop-after", "filter")
                };
                vec![cmd]
            }
            StageKind::SinogramGeneration { flat_correct } => {
                let cmd = self.engine("sinos").when(*flat_correct, |c| {
                    self.flat_corrected(c, input, true).pipe(|c| self.flat_scales(c))
                });
                let cmd = cmd
                    .path("projections", &input.projections)
                    .path("output", &out.join(SINOGRAM_PATTERN))
                    .opt("number", self.geometry.frames)
                    .pipe(|c| self.vertical_crop(c));
                let sorting = matches!(
                    self.config.filters.ring_removal,
                    Some(RingRemovalConfig::Sorting { .. })
                );
                vec![cmd.when(sorting, |c| c.opt("output-bytes-per-file", 0))]
            }
            StageKind::RingRemoval(backend) => vec![self.ring_removal(
                backend,
                input.projections.as_path(),
                out,
                self.geometry.frames,
                self.geometry.width,
            )],
            StageKind::SinogramToProjection => vec![self
                .engine("sinos")
                .path("projections", &input.projections)
                .path("output", &out.join(PROJECTION_PATTERN))
                .opt("number", self.projection_rows())],
            StageKind::Reconstruction {
                axis,
                flat_correct,
                phase_retrieval,
                resliced,
            } => {
                let cmd = self.angles(self.engine("reco"))
                    .path("projections", &input.projections)
                    .path("output", &out.join(SLICE_PATTERN));
                let cmd = cmd.when(*flat_correct, |c| {
                    self.flat_corrected(c, input, phase_retrieval.is_none())
                        .pipe(|c| self.flat_scales(c))
                });
                let cmd = match phase_retrieval {
                    Some(pr) => cmd
                        .flag("disable-projection-crop")
                        .opt("delta", "1e-6")
                        .opt("energy", pr.energy)
                        .opt("propagation-distance", pr.propagation_distance)
                        .opt("pixel-size", pr.pixel_size)
                        .opt("regularization-rate", format!("{:.2}", pr.regularization_rate)),
                    None => cmd,
                };
                let cmd = cmd
                    .opt("center-position-x", axis)
                    .opt("number", self.geometry.frames)
                    .opt("volume-angle-z", format!("{:.5}", self.config.reconstruction.volume_angle_z));
                let (a, b, c) = self.reco_region(*resliced);
                let cmd = cmd.opt_eq("region", format!("{},{},{}", a, b, c));
                vec![self.output_options(self.slice_roi(cmd))]
            }
            StageKind::Denoise(params) => {
                let filter = format!(
                    "non-local-means patch-radius={} search-radius={} h={} sigma={} window={} fast={} estimate-sigma={}",
                    params.patch_radius,
                    params.search_radius,
                    params.h,
                    params.sigma,
                    params.window,
                    params.fast,
                    params.estimate_sigma
                );
                let mut write = format!(
                    "write filename={}",
                    out.join("sli-nlmdn-%04i.tif").display()
                );
                if !params.bigtiff {
                    write.push_str(" bytes-per-file=0 tiff-bigtiff=False");
                }
                if let Some(clip) = &self.config.output.clip_histogram {
                    write.push_str(&format!(" bits={} rescale=False", clip.bitdepth));
                }
                vec![self.filter_graph(&format!(
                    "read path={} ! {} ! {}",
                    input.projections.display(),
                    filter,
                    write
                ))]
            }
        }
    }

    /// Reconstruction of one small patch at the search row for a candidate axis.
    pub fn axis_search_patch(&self, location: &DataLocation, axis: f64, output_dir: &Path) -> EngineCommand {
        let half = (self.config.axis.patch_size / 2) as i64;
        let z = self.config.axis.search_row as i64 - (self.geometry.height / 2) as i64;
        let cmd = self.angles(self.engine("reco"));
        let cmd = self
            .flat_corrected(cmd, location, true)
            .path("projections", &location.projections)
            .opt("number", self.geometry.frames)
            .path("output", &output_dir.join(SLICE_PATTERN))
            .opt_eq("x-region", format!("{},{},1", -half, half))
            .opt_eq("y-region", format!("{},{},1", -half, half))
            .opt_eq("region", format!("{},{},1", z, z + 1))
            .opt("center-position-x", axis)
            .opt("output-bytes-per-file", 0);
        self.tuning(cmd)
    }

    /// Slices reconstructed from every stitched sinogram in `sinograms`.
    pub fn overlap_slices(&self, sinograms: &Path, sinogram_width: usize, output: &Path) -> EngineCommand {
        self.engine("tomo")
            .opt("axis", sinogram_width / 2)
            .path("sinograms", sinograms)
            .path("output", output)
    }

    /// Ring-removal filter over a directory of sinograms.
    pub fn ring_removal(
        &self,
        backend: &RingRemovalConfig,
        input: &Path,
        output: &Path,
        sino_height: usize,
        sino_width: usize,
    ) -> EngineCommand {
        let write = format!("write filename={}", output.join(SINOGRAM_PATTERN).display());
        match backend {
            RingRemovalConfig::Stripes1d { sigma_h } => self.filter_graph(&format!(
                "read path={} ! fft dimensions=1 ! filter-stripes1d strength={} ! ifft dimensions=1 ! {}",
                input.display(),
                sigma_h,
                write
            )),
            RingRemovalConfig::Stripes2d { sigma_h, sigma_v } => self.filter_graph(&format!(
                "read path={} ! fft dimensions=2 ! filter-stripes horizontal-sigma={} vertical-sigma={} ! ifft dimensions=2 crop-width={} crop-height={} ! {}",
                input.display(),
                sigma_h,
                sigma_v,
                sino_width,
                sino_height,
                write
            )),
            RingRemovalConfig::Sorting { script, narrow_window, wide } => {
                let cmd = EngineCommand::new(&self.config.engine.script_interpreter)
                    .arg(script.display().to_string())
                    .path("input", input)
                    .path("output", output)
                    .opt("narrow-window", narrow_window);
                match wide {
                    Some(wide) => cmd.opt("wide-window", wide.window).opt("snr", wide.snr),
                    None => cmd,
                }
            }
        }
    }

    fn preprocess(&self, input: &DataLocation, out: &Path, filters: &str) -> Vec<EngineCommand> {
        let names = &self.config.input.layout;
        let mut roles = vec![
            (&input.darks, &names.darks),
            (&input.flats, &names.flats),
            (&input.projections, &names.projections),
        ];
        if let Some(flats2) = &input.flats2 {
            roles.push((flats2, &names.flats2));
        }
        roles
            .into_iter()
            .map(|(dir, name)| {
                self.filter_graph(&format!(
                    "read path={} ! {} ! write filename={}",
                    dir.display(),
                    filters,
                    out.join(name).join("frm-%05i.tif").display()
                ))
            })
            .collect()
    }

    fn engine(&self, subcommand: &str) -> EngineCommand {
        EngineCommand::new(&self.config.engine.program).arg(subcommand)
    }

    fn filter_graph(&self, graph: &str) -> EngineCommand {
        graph
            .split_whitespace()
            .fold(EngineCommand::new(&self.config.engine.filter_program), |c, tok| c.arg(tok))
    }

    fn reference_frames(&self, cmd: EngineCommand, input: &DataLocation) -> EngineCommand {
        let cmd = cmd.path("darks", &input.darks).path("flats", &input.flats);
        match &input.flats2 {
            Some(flats2) => cmd.path("flats2", flats2),
            None => cmd,
        }
    }

    fn flat_corrected(&self, cmd: EngineCommand, input: &DataLocation, absorptivity: bool) -> EngineCommand {
        let cmd = cmd.when(absorptivity, |c| c.flag("absorptivity")).flag("fix-nan-and-inf");
        self.reference_frames(cmd, input)
    }

    fn flat_scales(&self, cmd: EngineCommand) -> EngineCommand {
        let ffc = &self.config.filters.flat_field;
        let cmd = match ffc.dark_scale {
            Some(scale) => cmd.opt("dark-scale", scale),
            None => cmd,
        };
        match ffc.flat_scale {
            Some(scale) => cmd.opt("flat-scale", scale),
            None => cmd,
        }
    }

    fn angles(&self, cmd: EngineCommand) -> EngineCommand {
        let reco = &self.config.reconstruction;
        match &reco.laminography {
            Some(lamino) => {
                let cmd = match lamino.axis_angle_x {
                    Some(x) => cmd.opt("axis-angle-x", x),
                    None => cmd,
                };
                let cmd = cmd.opt("overall-angle", reco.overall_angle);
                let cmd = match lamino.center_position_z {
                    Some(z) => cmd.opt("center-position-z", z),
                    None => cmd,
                };
                match lamino.axis_angle_y {
                    Some(y) => cmd.opt("axis-angle-y", y),
                    None => cmd,
                }
            }
            None => cmd.opt("overall-angle", reco.overall_angle),
        }
    }

    fn vertical_crop(&self, cmd: EngineCommand) -> EngineCommand {
        match &self.config.region.vertical {
            Some(roi) => cmd.opt("y", roi.y).opt("height", roi.height).opt("y-step", roi.step),
            None => cmd.opt("height", self.geometry.height),
        }
    }

    /// Rows of the projections rebuilt from sinograms.
    fn projection_rows(&self) -> usize {
        match &self.config.region.vertical {
            Some(roi) => roi.rows(),
            None => self.geometry.height,
        }
    }

    /// `(from, to, step)` of the reconstructed rows, centred on the projection.
    fn reco_region(&self, resliced: bool) -> (i64, i64, usize) {
        let height = self.geometry.height as f64;
        match (&self.config.region.vertical, resliced) {
            (Some(roi), true) => {
                let h2 = roi.height as f64 / roi.step.max(1) as f64 / 2.0;
                (-(h2 as i64), h2.ceil() as i64, 1)
            }
            (Some(roi), false) => {
                let h2 = (height / 2.0) as i64;
                let y = roi.y as i64;
                (y - h2, y + roi.height as i64 - h2, roi.step)
            }
            (None, _) => (-((height / 2.0) as i64), (height / 2.0).ceil() as i64, 1),
        }
    }

    fn slice_roi(&self, cmd: EngineCommand) -> EngineCommand {
        let Some(roi) = &self.config.output.slice_roi else {
            return cmd;
        };
        let b = (self.geometry.width / 2) as i64;
        let cmd = cmd.when(roi.x != 0 || roi.width != 0, |c| {
            c.opt_eq("x-region", format!("{},{},1", roi.x - b, roi.x + roi.width - b))
        });
        cmd.when(roi.y != 0 || roi.height != 0, |c| {
            c.opt_eq("y-region", format!("{},{},1", roi.y - b, roi.y + roi.height - b))
        })
    }

    fn output_options(&self, cmd: EngineCommand) -> EngineCommand {
        let output = &self.config.output;
        let cmd = match &output.clip_histogram {
            Some(clip) => cmd
                .opt("output-bitdepth", clip.bitdepth)
                .opt_eq("output-minimum", clip.min)
                .opt_eq("output-maximum", clip.max),
            None => cmd,
        };
        let cmd = cmd.when(!output.bigtiff, |c| c.opt("output-bytes-per-file", 0));
        self.tuning(cmd)
    }

    fn tuning(&self, cmd: EngineCommand) -> EngineCommand {
        let engine = &self.config.engine;
        let cmd = cmd.when(engine.verbose, |c| c.flag("verbose"));
        let Some(gpu) = &engine.optimization else {
            return cmd;
        };
        let cmd = cmd.opt_eq("slice-memory-coeff", gpu.slice_memory_coeff);
        let cmd = match gpu.slices_per_device {
            Some(n) => cmd.opt("slices-per-device", n),
            None => cmd,
        };
        match &gpu.data_splitting_policy {
            Some(policy) => cmd.opt("data-splitting-policy", policy),
            None => cmd,
        }
    }
}

trait Pipe: Sized {
    fn pipe(self, f: impl FnOnce(Self) -> Self) -> Self {
        f(self)
    }
}

impl Pipe for EngineCommand {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HistogramClip, PhaseRetrievalConfig, SliceRoi, VerticalRoi, WideStripes};
    use crate::pipeline::stages::compose;
    use std::path::PathBuf;

    fn geometry() -> StackGeometry {
        StackGeometry { frames: 3000, height: 2048, width: 2560, multipage: false }
    }

    fn location() -> DataLocation {
        DataLocation {
            darks: "/in/s/darks".into(),
            flats: "/in/s/flats".into(),
            flats2: Some("/in/s/flats2".into()),
            projections: "/in/s/tomo".into(),
        }
    }

    fn config() -> Config {
        let mut config = Config::new("/in", "/out");
        config.output.staging_dir = "/tmp/stage".into();
        config
    }

    fn commands(config: &Config) -> Vec<EngineCommand> {
        let plan = compose(&location(), 1280.5, Path::new("/out/s"), config);
        CommandBuilder::new(config, geometry()).plan(&plan)
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = EngineCommand::new("tofu")
            .arg("reco")
            .path("output", Path::new("/my data/sli"))
            .opt_eq("region", "-5,5,1");
        assert_eq!(cmd.to_string(), "tofu reco --output \"/my data/sli\" --region=-5,5,1");
        assert_eq!(cmd.value_of("region"), Some("-5,5,1"));
        assert_eq!(cmd.value_of("output"), Some("/my data/sli"));
    }

    #[test]
    fn test_default_reconstruction() {
        let cmds = commands(&config());
        assert_eq!(cmds.len(), 1);
        let reco = &cmds[0];
        assert_eq!(reco.program, "tofu");
        assert_eq!(reco.args[0], "reco");
        assert_eq!(reco.value_of("overall-angle"), Some("180"));
        assert_eq!(reco.value_of("darks"), Some("/in/s/darks"));
        assert_eq!(reco.value_of("flats2"), Some("/in/s/flats2"));
        assert!(reco.has_arg("--absorptivity"));
        assert_eq!(reco.value_of("center-position-x"), Some("1280.5"));
        assert_eq!(reco.value_of("number"), Some("3000"));
        assert_eq!(reco.value_of("volume-angle-z"), Some("0.00000"));
        assert_eq!(reco.value_of("region"), Some("-1024,1024,1"));
        assert_eq!(reco.value_of("output-bytes-per-file"), Some("0"));
        assert_eq!(reco.value_of("output"), Some("/out/s/sli/sli-%04i.tif"));
    }

    #[test]
    fn test_reconstruction_with_roi_and_clipping() {
        let mut config = config();
        config.region.vertical = Some(VerticalRoi { y: 100, height: 200, step: 2 });
        config.output.slice_roi = Some(SliceRoi { x: 1000, width: 500, y: 0, height: 0 });
        config.output.clip_histogram = Some(HistogramClip { bitdepth: 8, min: -0.1, max: 0.2 });
        config.output.bigtiff = true;
        let reco = &commands(&config)[0];
        assert_eq!(reco.value_of("region"), Some("-924,-724,2"));
        assert_eq!(reco.value_of("x-region"), Some("-280,220,1"));
        assert_eq!(reco.value_of("y-region"), None);
        assert_eq!(reco.value_of("output-minimum"), Some("-0.1"));
        assert_eq!(reco.value_of("output-bitdepth"), Some("8"));
        assert!(!reco.has_arg("--output-bytes-per-file"));
    }

    #[test]
    fn test_ring_removal_commands() {
        let mut config = config();
        config.region.vertical = Some(VerticalRoi { y: 100, height: 201, step: 1 });
        config.filters.ring_removal = Some(RingRemovalConfig::Sorting {
            script: "/opt/rr.py".into(),
            narrow_window: 21,
            wide: Some(WideStripes { window: 91, snr: 3.0 }),
        });
        let cmds = commands(&config);
        assert_eq!(cmds.len(), 4);

        let sinos = &cmds[0];
        assert_eq!(sinos.args[0], "sinos");
        assert!(sinos.has_arg("--absorptivity"));
        assert_eq!(sinos.value_of("y"), Some("100"));
        assert_eq!(sinos.value_of("output-bytes-per-file"), Some("0"));

        let rr = &cmds[1];
        assert_eq!(rr.program, "python");
        assert_eq!(rr.args[0], "/opt/rr.py");
        assert_eq!(rr.value_of("input"), Some("/tmp/stage/sinos"));
        assert_eq!(rr.value_of("wide-window"), Some("91"));

        assert_eq!(cmds[2].value_of("number"), Some("201"));

        let reco = &cmds[3];
        assert_eq!(reco.value_of("projections"), Some("/tmp/stage/proj-step1"));
        assert!(reco.value_of("darks").is_none());
        assert_eq!(reco.value_of("region"), Some("-100,101,1"));
    }

    #[test]
    fn test_phase_retrieval_in_reconstruction() {
        let mut config = config();
        config.filters.phase_retrieval = Some(PhaseRetrievalConfig {
            energy: 20.0,
            pixel_size: 3.6e-6,
            propagation_distance: 0.1,
            regularization_rate: 2.5,
        });
        let reco = &commands(&config)[0];
        assert!(!reco.has_arg("--absorptivity"));
        assert_eq!(reco.value_of("regularization-rate"), Some("2.50"));
        assert_eq!(reco.value_of("delta"), Some("1e-6"));
    }

    #[test]
    fn test_stripes_filter_graph() {
        let config = config();
        let builder = CommandBuilder::new(&config, geometry());
        let cmd = builder.ring_removal(
            &RingRemovalConfig::Stripes2d { sigma_h: 2.0, sigma_v: 1.0 },
            Path::new("/t/sinos"),
            Path::new("/t/sinos-filt"),
            3000,
            2560,
        );
        assert_eq!(cmd.program, "ufo-launch");
        assert_eq!(
            cmd.to_string(),
            "ufo-launch read path=/t/sinos ! fft dimensions=2 ! filter-stripes horizontal-sigma=2 vertical-sigma=1 \
             ! ifft dimensions=2 crop-width=2560 crop-height=3000 ! write filename=/t/sinos-filt/sin-%04i.tif"
        );
    }

    #[test]
    fn test_axis_search_patch() {
        let mut config = config();
        config.axis.search_row = 1000;
        config.axis.patch_size = 256;
        let builder = CommandBuilder::new(&config, geometry());
        let cmd = builder.axis_search_patch(&location(), 1015.5, &PathBuf::from("/tmp/stage/axis-search/candidate-0011"));
        assert_eq!(cmd.value_of("x-region"), Some("-128,128,1"));
        assert_eq!(cmd.value_of("region"), Some("-24,-23,1"));
        assert_eq!(cmd.value_of("center-position-x"), Some("1015.5"));
        assert!(cmd.has_arg("--absorptivity"));
    }

    #[test]
    fn test_preprocess_writes_every_role() {
        let mut config = config();
        config.filters.preprocess = Some("remove-outliers size=3 threshold=500".to_string());
        let cmds = commands(&config);
        assert_eq!(cmds.len(), 5);
        assert!(cmds[0].to_string().ends_with("write filename=/tmp/stage/prepro/darks/frm-%05i.tif"));
        assert!(cmds[3].to_string().contains("read path=/in/s/flats2"));
        assert_eq!(cmds[4].value_of("darks"), Some("/tmp/stage/prepro/darks"));
    }
}
