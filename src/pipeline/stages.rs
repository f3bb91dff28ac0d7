//! Processing stages and the rule table that orders them.
//!
//! Composition is pure planning: it decides which stages run, which one
//! flat-field corrects, and where each stage reads and writes. Nothing here
//! touches the filesystem.
//!
//! ```text
//! raw ─▶ [Preprocess] ─▶ [SpotRemoval] ─▶ [PhaseRetrieval] ─▶ [Sinograms ─▶ RingRemoval ─▶ SinogramsToProjections] ─▶ Reconstruction ─▶ [Denoise]
//! ```

use crate::config::{
    Config, DenoiseConfig, EigenFlatField, PhaseRetrievalConfig, RingRemovalConfig,
    SpotRemovalConfig,
};
use crate::index::{DataLocation, SLICES_DIR};
use crate::pipeline::staging::StagingLayout;
use std::path::{Path, PathBuf};

/// Directory receiving denoised slices, next to the slice directory.
pub const DENOISED_DIR: &str = "sli-nlmdn";

/// What a stage does, with the parameters that drive its command.
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    /// Generic filter chain applied to every role directory
    Preprocess { filters: String },
    /// Flat-field correction combined with large-spot removal
    SpotRemoval {
        params: SpotRemovalConfig,
        absorptivity: bool,
    },
    /// Eigen flat-field correction as its own step
    FlatFieldCorrection(EigenFlatField),
    PhaseRetrieval {
        params: PhaseRetrievalConfig,
        flat_correct: bool,
    },
    SinogramGeneration { flat_correct: bool },
    RingRemoval(RingRemovalConfig),
    SinogramToProjection,
    Reconstruction {
        axis: f64,
        flat_correct: bool,
        /// Phase-retrieval parameters still to be applied by the reconstruction
        phase_retrieval: Option<PhaseRetrievalConfig>,
        /// Projections were rebuilt from (vertically cropped) sinograms
        resliced: bool,
    },
    Denoise(DenoiseConfig),
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Preprocess { .. } => "preprocess",
            StageKind::SpotRemoval { .. } => "spot removal",
            StageKind::FlatFieldCorrection(_) => "flat-field correction",
            StageKind::PhaseRetrieval { .. } => "phase retrieval",
            StageKind::SinogramGeneration { .. } => "sinogram generation",
            StageKind::RingRemoval(_) => "ring removal",
            StageKind::SinogramToProjection => "sinograms to projections",
            StageKind::Reconstruction { .. } => "reconstruction",
            StageKind::Denoise(_) => "denoise",
        }
    }

    /// Whether this stage applies the dark/flat correction.
    pub fn performs_flat_correction(&self) -> bool {
        match self {
            StageKind::SpotRemoval { .. } | StageKind::FlatFieldCorrection(_) => true,
            StageKind::PhaseRetrieval { flat_correct, .. }
            | StageKind::SinogramGeneration { flat_correct }
            | StageKind::Reconstruction { flat_correct, .. } => *flat_correct,
            _ => false,
        }
    }
}

/// One planned stage. `input.projections` is the directory it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub kind: StageKind,
    pub input: DataLocation,
    pub output_dir: PathBuf,
}

impl PipelineStage {
    pub fn input_dir(&self) -> &Path {
        &self.input.projections
    }
}

/// Ordered stages of one set plus the staging directories they write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagePlan {
    pub stages: Vec<PipelineStage>,
    pub staging_dirs: Vec<PathBuf>,
}

impl StagePlan {
    pub fn flat_correcting_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.kind.performs_flat_correction())
            .count()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.kind.name()).collect()
    }

    fn push(&mut self, kind: StageKind, input: &DataLocation, output_dir: PathBuf, staged: bool) {
        if staged {
            self.staging_dirs.push(output_dir.clone());
        }
        self.stages.push(PipelineStage {
            kind,
            input: input.clone(),
            output_dir,
        });
    }
}

/// Plan the stages for one set.
///
/// `location` holds the raw role directories, `set_output` is the set's
/// directory in the output tree.
pub fn compose(location: &DataLocation, axis: f64, set_output: &Path, config: &Config) -> StagePlan {
    let staging = StagingLayout::new(&config.output.staging_dir);
    let filters = &config.filters;
    let eigen = filters.flat_field.eigen();

    let mut plan = StagePlan::default();
    let mut current = location.clone();
    let mut need_ffc = true;
    let mut need_pr = filters.phase_retrieval.is_some();
    let mut step = 0usize;
    let mut next_step = || {
        step += 1;
        staging.projection_step(step)
    };

    // Raw data goes through the filter chain first; everything downstream
    // reads the relocated copies.
    if let Some(chain) = &filters.preprocess {
        let out = staging.preprocessed();
        plan.push(
            StageKind::Preprocess { filters: chain.clone() },
            &current,
            out.clone(),
            true,
        );
        current = current.relocated(&out, &config.input.layout);
    }

    if let Some(spots) = &filters.remove_spots {
        let out = next_step();
        plan.push(
            StageKind::SpotRemoval {
                params: *spots,
                absorptivity: !need_pr,
            },
            &current,
            out.clone(),
            true,
        );
        plan.staging_dirs.push(staging.spot_masks());
        current = current.with_projections(out);
        need_ffc = false;
    }

    if let (Some(pr), Some(_)) = (&filters.phase_retrieval, &filters.ring_removal) {
        let mut flat_correct = need_ffc;
        if need_ffc {
            if let Some(eigen) = eigen {
                let out = next_step();
                plan.push(StageKind::FlatFieldCorrection(eigen.clone()), &current, out.clone(), true);
                current = current.with_projections(out);
                flat_correct = false;
            }
        }
        let out = next_step();
        plan.push(
            StageKind::PhaseRetrieval { params: *pr, flat_correct },
            &current,
            out.clone(),
            true,
        );
        current = current.with_projections(out);
        need_pr = false;
        need_ffc = false;
    }

    let resliced = filters.ring_removal.is_some();
    if let Some(backend) = &filters.ring_removal {
        let mut flat_correct = need_ffc;
        if need_ffc {
            if let Some(eigen) = eigen {
                let out = next_step();
                plan.push(StageKind::FlatFieldCorrection(eigen.clone()), &current, out.clone(), true);
                current = current.with_projections(out);
                flat_correct = false;
            }
        }
        let sinos = staging.sinograms();
        plan.push(
            StageKind::SinogramGeneration { flat_correct },
            &current,
            sinos.clone(),
            true,
        );
        need_ffc = false;

        let filtered = staging.filtered_sinograms();
        plan.push(
            StageKind::RingRemoval(backend.clone()),
            &current.with_projections(sinos),
            filtered.clone(),
            true,
        );

        let out = next_step();
        plan.push(
            StageKind::SinogramToProjection,
            &current.with_projections(filtered),
            out.clone(),
            true,
        );
        current = current.with_projections(out);
    }

    let mut flat_correct = need_ffc;
    if need_ffc {
        if let Some(eigen) = eigen {
            let out = next_step();
            plan.push(StageKind::FlatFieldCorrection(eigen.clone()), &current, out.clone(), true);
            current = current.with_projections(out);
            flat_correct = false;
        }
    }
    let slices = set_output.join(SLICES_DIR);
    plan.push(
        StageKind::Reconstruction {
            axis,
            flat_correct,
            phase_retrieval: if need_pr { filters.phase_retrieval } else { None },
            resliced,
        },
        &current,
        slices.clone(),
        false,
    );

    if let Some(denoise) = &filters.denoise {
        plan.push(
            StageKind::Denoise(denoise.clone()),
            &current.with_projections(slices),
            set_output.join(DENOISED_DIR),
            false,
        );
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlatFieldMethod, SpotRemovalConfig};

    fn location() -> DataLocation {
        DataLocation {
            darks: "/in/s/darks".into(),
            flats: "/in/s/flats".into(),
            flats2: None,
            projections: "/in/s/tomo".into(),
        }
    }

    fn config() -> Config {
        let mut config = Config::new("/in", "/out");
        config.output.staging_dir = "/tmp/stage".into();
        config
    }

    fn phase() -> PhaseRetrievalConfig {
        PhaseRetrievalConfig {
            energy: 20.0,
            pixel_size: 1e-6,
            propagation_distance: 0.1,
            regularization_rate: 2.0,
        }
    }

    #[test]
    fn test_plain_reconstruction() {
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config());
        assert_eq!(plan.kinds(), vec!["reconstruction"]);
        let stage = &plan.stages[0];
        assert_eq!(stage.input_dir(), Path::new("/in/s/tomo"));
        assert_eq!(stage.output_dir, PathBuf::from("/out/s/sli"));
        assert!(stage.kind.performs_flat_correction());
        assert!(plan.staging_dirs.is_empty());
    }

    #[test]
    fn test_ring_removal_chain() {
        let mut config = config();
        config.filters.ring_removal = Some(RingRemovalConfig::Stripes1d { sigma_h: 2.0 });
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(
            plan.kinds(),
            vec!["sinogram generation", "ring removal", "sinograms to projections", "reconstruction"]
        );
        assert_eq!(plan.stages[1].input_dir(), Path::new("/tmp/stage/sinos"));
        assert_eq!(plan.stages[2].input_dir(), Path::new("/tmp/stage/sinos-filt"));
        assert_eq!(plan.stages[3].input_dir(), Path::new("/tmp/stage/proj-step1"));
        assert_eq!(plan.flat_correcting_stages(), 1);
        assert!(plan.stages[0].kind.performs_flat_correction());
    }

    #[test]
    fn test_phase_retrieval_with_ring_removal() {
        let mut config = config();
        config.filters.phase_retrieval = Some(phase());
        config.filters.ring_removal = Some(RingRemovalConfig::Stripes1d { sigma_h: 2.0 });
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(plan.kinds()[0], "phase retrieval");
        assert!(plan.stages[0].kind.performs_flat_correction());
        match &plan.stages.last().unwrap().kind {
            StageKind::Reconstruction { phase_retrieval, flat_correct, .. } => {
                assert!(phase_retrieval.is_none());
                assert!(!flat_correct);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_phase_retrieval_alone_is_done_by_reconstruction() {
        let mut config = config();
        config.filters.phase_retrieval = Some(phase());
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(plan.kinds(), vec!["reconstruction"]);
        assert!(matches!(
            plan.stages[0].kind,
            StageKind::Reconstruction { phase_retrieval: Some(_), flat_correct: true, .. }
        ));
    }

    #[test]
    fn test_spot_removal_satisfies_flat_correction() {
        let mut config = config();
        config.filters.remove_spots = Some(SpotRemovalConfig { threshold: 1000.0, sigma: 2.0 });
        config.filters.ring_removal = Some(RingRemovalConfig::Stripes1d { sigma_h: 2.0 });
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(plan.flat_correcting_stages(), 1);
        assert!(plan.stages[0].kind.performs_flat_correction());
        assert!(!plan.stages[1].kind.performs_flat_correction());
        assert!(plan.staging_dirs.contains(&PathBuf::from("/tmp/stage/spots")));
    }

    #[test]
    fn test_preprocess_relocates_reference_frames() {
        let mut config = config();
        config.filters.preprocess = Some("remove-outliers size=3".to_string());
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(plan.kinds(), vec!["preprocess", "reconstruction"]);
        let reco = &plan.stages[1];
        assert_eq!(reco.input.darks, PathBuf::from("/tmp/stage/prepro/darks"));
        assert_eq!(reco.input_dir(), Path::new("/tmp/stage/prepro/tomo"));
        assert_eq!(plan.staging_dirs, vec![PathBuf::from("/tmp/stage/prepro")]);
    }

    #[test]
    fn test_eigen_flat_field_is_a_separate_stage() {
        let mut config = config();
        config.filters.flat_field.method = FlatFieldMethod::Eigen(EigenFlatField::default());
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        assert_eq!(plan.kinds(), vec!["flat-field correction", "reconstruction"]);
        assert_eq!(plan.flat_correcting_stages(), 1);
        assert_eq!(plan.stages[1].input_dir(), Path::new("/tmp/stage/proj-step1"));
    }

    #[test]
    fn test_denoise_reads_slices() {
        let mut config = config();
        config.filters.denoise = Some(DenoiseConfig::default());
        let plan = compose(&location(), 1024.0, Path::new("/out/s"), &config);
        let denoise = plan.stages.last().unwrap();
        assert_eq!(denoise.input_dir(), Path::new("/out/s/sli"));
        assert_eq!(denoise.output_dir, PathBuf::from("/out/s/sli-nlmdn"));
    }

    #[test]
    fn test_at_most_one_flat_correction_for_every_combination() {
        for mask in 0..32u32 {
            let mut config = config();
            if mask & 1 != 0 {
                config.filters.preprocess = Some("blur".to_string());
            }
            if mask & 2 != 0 {
                config.filters.remove_spots = Some(SpotRemovalConfig { threshold: 1.0, sigma: 1.0 });
            }
            if mask & 4 != 0 {
                config.filters.phase_retrieval = Some(phase());
            }
            if mask & 8 != 0 {
                config.filters.ring_removal = Some(RingRemovalConfig::Stripes2d { sigma_h: 1.0, sigma_v: 1.0 });
            }
            if mask & 16 != 0 {
                config.filters.flat_field.method = FlatFieldMethod::Eigen(EigenFlatField::default());
            }
            let plan = compose(&location(), 10.0, Path::new("/out/s"), &config);
            assert_eq!(plan.flat_correcting_stages(), 1, "mask {:#b}", mask);
            let again = compose(&location(), 10.0, Path::new("/out/s"), &config);
            assert_eq!(plan, again);
        }
    }
}
