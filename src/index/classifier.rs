//! Discovery and validation of CT sets below an input root.

use crate::index::AcquisitionLayout;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Layout kind of a CT set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Invalid,
    /// Darks, flats and projections
    NoSecondFlat,
    /// Darks, flats, projections and flats taken after the scan
    WithSecondFlat,
}

impl SetKind {
    pub fn is_valid(&self) -> bool {
        !matches!(self, SetKind::Invalid)
    }
}

/// One acquisition directory and its layout kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CtSet {
    pub root: PathBuf,
    pub kind: SetKind,
}

impl CtSet {
    /// Path relative to the input root; empty when the set is the root itself.
    pub fn relative_path(&self, input_root: &Path) -> PathBuf {
        self.root
            .strip_prefix(input_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.root.clone())
    }

    pub fn set_id(&self, input_root: &Path) -> String {
        self.relative_path(input_root).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClassifyError {
    #[error("shared {role} directory {} does not exist", .path.display())]
    SharedPathMissing { role: &'static str, path: PathBuf },

    #[error("shared {role} directory {}: {reason}", .path.display())]
    SharedInvalidFiles {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error(
        "no valid CT sets under {}: expected directories containing a '{projections}' sub-directory with {darks}/{flats} siblings",
        .root.display()
    )]
    NoValidSets {
        root: PathBuf,
        projections: String,
        darks: String,
        flats: String,
    },
}

/// Every candidate set, with the reason each invalid one was rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub sets: Vec<CtSet>,
    pub rejected: Vec<(PathBuf, String)>,
}

impl Classification {
    pub fn valid(&self) -> impl Iterator<Item = &CtSet> {
        self.sets.iter().filter(|s| s.kind.is_valid())
    }

    pub fn valid_count(&self) -> usize {
        self.valid().count()
    }

    /// Valid sets in path order, or a batch-terminal error when there are none.
    pub fn into_valid(
        self,
        root: &Path,
        layout: &AcquisitionLayout,
    ) -> Result<Vec<CtSet>, ClassifyError> {
        let valid: Vec<CtSet> = self.sets.into_iter().filter(|s| s.kind.is_valid()).collect();
        if valid.is_empty() {
            return Err(ClassifyError::NoValidSets {
                root: root.to_path_buf(),
                projections: layout.names.projections.clone(),
                darks: layout.names.darks.clone(),
                flats: layout.names.flats.clone(),
            });
        }
        Ok(valid)
    }
}

/// Walk `root` and classify every directory holding a projections sub-directory.
///
/// Reads the filesystem only. Results are sorted by path.
pub fn classify(root: &Path, layout: &AcquisitionLayout) -> Result<Classification, ClassifyError> {
    let shared_kind = match &layout.shared {
        Some(shared) => {
            check_shared(layout, "darks", &shared.darks)?;
            check_shared(layout, "flats", &shared.flats)?;
            match &shared.flats2 {
                Some(flats2) => {
                    check_shared(layout, "flats2", flats2)?;
                    Some(SetKind::WithSecondFlat)
                }
                None => Some(SetKind::NoSecondFlat),
            }
        }
        None => None,
    };

    let mut candidates = BTreeSet::new();
    collect_candidates(root, &layout.names.projections, &mut candidates);

    let mut result = Classification::default();
    for dir in candidates {
        let kind = match shared_kind {
            Some(kind) => validate_role_dir(layout, &dir.join(&layout.names.projections))
                .map(|_| kind),
            None => classify_own_layout(layout, &dir),
        };
        match kind {
            Ok(kind) => {
                tracing::debug!("{}: {:?}", dir.display(), kind);
                result.sets.push(CtSet { root: dir, kind });
            }
            Err(reason) => {
                tracing::warn!("Skipping {}: {}", dir.display(), reason);
                result.rejected.push((dir.clone(), reason));
                result.sets.push(CtSet { root: dir, kind: SetKind::Invalid });
            }
        }
    }

    tracing::info!(
        "Found {} CT sets under {} ({} valid)",
        result.sets.len(),
        root.display(),
        result.valid_count()
    );
    Ok(result)
}

fn check_shared(
    layout: &AcquisitionLayout,
    role: &'static str,
    path: &Path,
) -> Result<(), ClassifyError> {
    if !path.is_dir() {
        return Err(ClassifyError::SharedPathMissing {
            role,
            path: path.to_path_buf(),
        });
    }
    validate_role_dir(layout, path).map_err(|reason| ClassifyError::SharedInvalidFiles {
        role,
        path: path.to_path_buf(),
        reason,
    })
}

fn collect_candidates(dir: &Path, projections: &str, out: &mut BTreeSet<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if entry.file_name().to_str() == Some(projections) {
            out.insert(dir.to_path_buf());
        }
        collect_candidates(&entry.path(), projections, out);
    }
}

fn classify_own_layout(layout: &AcquisitionLayout, dir: &Path) -> Result<SetKind, String> {
    let names = &layout.names;
    for role in [&names.darks, &names.flats, &names.projections] {
        let path = dir.join(role);
        if !path.is_dir() {
            return Err(format!("missing '{}' directory", role));
        }
        validate_role_dir(layout, &path)?;
    }

    if names.flats2 == names.flats {
        return Ok(SetKind::NoSecondFlat);
    }
    let flats2 = dir.join(&names.flats2);
    if !flats2.is_dir() || is_empty_dir(&flats2) {
        return Ok(SetKind::NoSecondFlat);
    }
    validate_role_dir(layout, &flats2)?;
    Ok(SetKind::WithSecondFlat)
}

/// A role directory must be non-empty and hold only image files.
fn validate_role_dir(layout: &AcquisitionLayout, dir: &Path) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {}", dir.display(), e))?;
    let mut images = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| format!("cannot read {}: {}", dir.display(), e))?;
        let path = entry.path();
        if path.is_dir() {
            return Err(format!("{} contains sub-directory {}", dir.display(), path.display()));
        }
        if !layout.is_image(&path) {
            return Err(format!("{} contains non-image file {}", dir.display(), path.display()));
        }
        images += 1;
    }
    if images == 0 {
        return Err(format!("{} is empty", dir.display()));
    }
    Ok(())
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutNames, SharedFlatsConfig};
    use std::fs;
    use tempfile::tempdir;

    fn layout() -> AcquisitionLayout {
        AcquisitionLayout {
            names: LayoutNames::default(),
            shared: None,
            extensions: vec!["tif".to_string(), "tiff".to_string()],
        }
    }

    fn make_role(dir: &Path, files: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..files {
            fs::write(dir.join(format!("img-{:04}.tif", i)), b"").unwrap();
        }
    }

    fn make_set(root: &Path, with_flats2: bool) {
        make_role(&root.join("darks"), 2);
        make_role(&root.join("flats"), 2);
        make_role(&root.join("tomo"), 4);
        if with_flats2 {
            make_role(&root.join("flats2"), 2);
        }
    }

    #[test]
    fn test_classifies_both_kinds_sorted() {
        let tmp = tempdir().unwrap();
        make_set(&tmp.path().join("b"), false);
        make_set(&tmp.path().join("a/z00"), true);

        let result = classify(tmp.path(), &layout()).unwrap();
        assert_eq!(result.sets.len(), 2);
        assert_eq!(result.sets[0].root, tmp.path().join("a/z00"));
        assert_eq!(result.sets[0].kind, SetKind::WithSecondFlat);
        assert_eq!(result.sets[1].kind, SetKind::NoSecondFlat);
    }

    #[test]
    fn test_non_image_file_invalidates_set() {
        let tmp = tempdir().unwrap();
        let set = tmp.path().join("s");
        make_set(&set, false);
        fs::write(set.join("flats/readme.txt"), b"x").unwrap();

        let result = classify(tmp.path(), &layout()).unwrap();
        assert_eq!(result.sets[0].kind, SetKind::Invalid);
        assert!(result.rejected[0].1.contains("non-image"));
    }

    #[test]
    fn test_nested_directory_invalidates_set() {
        let tmp = tempdir().unwrap();
        let set = tmp.path().join("s");
        make_set(&set, false);
        fs::create_dir_all(set.join("darks/nested")).unwrap();

        let result = classify(tmp.path(), &layout()).unwrap();
        assert_eq!(result.valid_count(), 0);
    }

    #[test]
    fn test_missing_flats_is_invalid() {
        let tmp = tempdir().unwrap();
        make_role(&tmp.path().join("s/darks"), 1);
        make_role(&tmp.path().join("s/tomo"), 1);

        let result = classify(tmp.path(), &layout()).unwrap();
        assert_eq!(result.sets[0].kind, SetKind::Invalid);
        let err = result.into_valid(tmp.path(), &layout()).unwrap_err();
        assert!(matches!(err, ClassifyError::NoValidSets { .. }));
        assert!(err.to_string().contains("'tomo'"));
    }

    #[test]
    fn test_empty_flats2_counts_as_absent() {
        let tmp = tempdir().unwrap();
        make_set(&tmp.path().join("s"), false);
        fs::create_dir_all(tmp.path().join("s/flats2")).unwrap();

        let result = classify(tmp.path(), &layout()).unwrap();
        assert_eq!(result.sets[0].kind, SetKind::NoSecondFlat);
    }

    #[test]
    fn test_flats2_same_name_as_flats() {
        let tmp = tempdir().unwrap();
        make_set(&tmp.path().join("s"), false);
        let mut layout = layout();
        layout.names.flats2 = "flats".to_string();

        let result = classify(tmp.path(), &layout).unwrap();
        assert_eq!(result.sets[0].kind, SetKind::NoSecondFlat);
    }

    #[test]
    fn test_shared_flats() {
        let tmp = tempdir().unwrap();
        make_role(&tmp.path().join("common/darks"), 1);
        make_role(&tmp.path().join("common/flats"), 1);
        make_role(&tmp.path().join("data/s1/tomo"), 3);

        let mut layout = layout();
        layout.shared = Some(SharedFlatsConfig {
            darks: tmp.path().join("common/darks"),
            flats: tmp.path().join("common/flats"),
            flats2: None,
        });
        let result = classify(&tmp.path().join("data"), &layout).unwrap();
        assert_eq!(result.sets.len(), 1);
        assert_eq!(result.sets[0].kind, SetKind::NoSecondFlat);

        layout.shared = Some(SharedFlatsConfig {
            darks: tmp.path().join("common/darks"),
            flats: tmp.path().join("common/flats"),
            flats2: Some(tmp.path().join("common/missing")),
        });
        let err = classify(&tmp.path().join("data"), &layout).unwrap_err();
        assert!(matches!(err, ClassifyError::SharedPathMissing { role: "flats2", .. }));
    }

    #[test]
    fn test_relative_path() {
        let set = CtSet { root: "/in/a/z01".into(), kind: SetKind::NoSecondFlat };
        assert_eq!(set.set_id(Path::new("/in")), "a/z01");
        let root_set = CtSet { root: "/in".into(), kind: SetKind::NoSecondFlat };
        assert_eq!(root_set.set_id(Path::new("/in")), "");
    }
}
