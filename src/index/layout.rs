//! Where the frames of a CT set live on disk.

use crate::config::{Config, LayoutNames, SharedFlatsConfig};
use crate::index::{CtSet, SetKind};
use std::path::{Path, PathBuf};

/// Role names, optional shared flats/darks and accepted image extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionLayout {
    pub names: LayoutNames,
    pub shared: Option<SharedFlatsConfig>,
    pub extensions: Vec<String>,
}

impl AcquisitionLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            names: config.input.layout.clone(),
            shared: config.input.shared.clone(),
            extensions: config.input.image_extensions.clone(),
        }
    }

    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Resolve the role directories of a classified set.
    pub fn locate(&self, set: &CtSet) -> DataLocation {
        let projections = set.root.join(&self.names.projections);
        match &self.shared {
            Some(shared) => DataLocation {
                darks: shared.darks.clone(),
                flats: shared.flats.clone(),
                flats2: shared.flats2.clone(),
                projections,
            },
            None => DataLocation {
                darks: set.root.join(&self.names.darks),
                flats: set.root.join(&self.names.flats),
                flats2: (set.kind == SetKind::WithSecondFlat)
                    .then(|| set.root.join(&self.names.flats2)),
                projections,
            },
        }
    }
}

/// Concrete role directories for one set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLocation {
    pub darks: PathBuf,
    pub flats: PathBuf,
    pub flats2: Option<PathBuf>,
    pub projections: PathBuf,
}

impl DataLocation {
    /// Same roles under `base`, as written by a stage that processes all of them.
    pub fn relocated(&self, base: &Path, names: &LayoutNames) -> Self {
        Self {
            darks: base.join(&names.darks),
            flats: base.join(&names.flats),
            flats2: self.flats2.as_ref().map(|_| base.join(&names.flats2)),
            projections: base.join(&names.projections),
        }
    }

    /// Projections replaced by `dir`; reference frames unchanged.
    pub fn with_projections(&self, dir: PathBuf) -> Self {
        Self {
            projections: dir,
            ..self.clone()
        }
    }

    /// All role directories in processing order: darks, flats, projections, flats2.
    pub fn roles(&self) -> Vec<&Path> {
        let mut roles = vec![self.darks.as_path(), self.flats.as_path(), self.projections.as_path()];
        if let Some(flats2) = &self.flats2 {
            roles.push(flats2.as_path());
        }
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(shared: Option<SharedFlatsConfig>) -> AcquisitionLayout {
        AcquisitionLayout {
            names: LayoutNames::default(),
            shared,
            extensions: vec!["tif".to_string()],
        }
    }

    #[test]
    fn test_locate_per_set() {
        let set = CtSet { root: "/in/s1".into(), kind: SetKind::NoSecondFlat };
        let loc = layout(None).locate(&set);
        assert_eq!(loc.darks, PathBuf::from("/in/s1/darks"));
        assert_eq!(loc.projections, PathBuf::from("/in/s1/tomo"));
        assert!(loc.flats2.is_none());

        let set = CtSet { root: "/in/s1".into(), kind: SetKind::WithSecondFlat };
        assert_eq!(layout(None).locate(&set).flats2, Some(PathBuf::from("/in/s1/flats2")));
    }

    #[test]
    fn test_locate_shared() {
        let shared = SharedFlatsConfig {
            darks: "/common/d".into(),
            flats: "/common/f".into(),
            flats2: None,
        };
        let set = CtSet { root: "/in/s1".into(), kind: SetKind::NoSecondFlat };
        let loc = layout(Some(shared)).locate(&set);
        assert_eq!(loc.darks, PathBuf::from("/common/d"));
        assert_eq!(loc.projections, PathBuf::from("/in/s1/tomo"));
    }

    #[test]
    fn test_relocated_keeps_flats2_presence() {
        let loc = DataLocation {
            darks: "/a/darks".into(),
            flats: "/a/flats".into(),
            flats2: Some("/a/flats2".into()),
            projections: "/a/tomo".into(),
        };
        let moved = loc.relocated(Path::new("/tmp/prepro"), &LayoutNames::default());
        assert_eq!(moved.flats2, Some(PathBuf::from("/tmp/prepro/flats2")));
        assert_eq!(moved.roles().len(), 4);
    }
}
