//! Index of sets that already have a reconstruction in the output tree.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Sub-directory holding reconstructed slices; its presence marks a set as done.
pub const SLICES_DIR: &str = "sli";

/// Relative paths (to the output root) of every directory holding a slice directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedIndex {
    done: BTreeSet<PathBuf>,
}

impl ProcessedIndex {
    /// Scan `output_root`; a missing root yields an empty index.
    pub fn scan(output_root: &Path) -> Self {
        let mut done = BTreeSet::new();
        if output_root.is_dir() {
            walk(output_root, output_root, &mut done);
        }
        tracing::debug!("{} reconstructions found under {}", done.len(), output_root.display());
        Self { done }
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.done.contains(relative)
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}

fn walk(root: &Path, dir: &Path, done: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if entry.file_name().to_str() == Some(SLICES_DIR) {
            let relative = dir.strip_prefix(root).unwrap_or(dir).to_path_buf();
            done.insert(relative);
        } else {
            walk(root, &entry.path(), done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_finds_slice_dirs() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/z00/sli")).unwrap();
        std::fs::create_dir_all(tmp.path().join("a/z01/other")).unwrap();
        std::fs::create_dir_all(tmp.path().join("sli")).unwrap();

        let index = ProcessedIndex::scan(tmp.path());
        assert_eq!(index.len(), 2);
        assert!(index.contains(Path::new("a/z00")));
        assert!(index.contains(Path::new("")));
        assert!(!index.contains(Path::new("a/z01")));
    }

    #[test]
    fn test_missing_output_root() {
        let tmp = tempdir().unwrap();
        assert!(ProcessedIndex::scan(&tmp.path().join("nope")).is_empty());
    }
}
