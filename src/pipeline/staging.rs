//! Batch staging directory and the manifest of what each set created in it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Names of the intermediate directories under a staging root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relocated copies of every role directory after the filter chain.
    pub fn preprocessed(&self) -> PathBuf {
        self.root.join("prepro")
    }

    /// Projections written by the `n`-th relocating stage.
    pub fn projection_step(&self, n: usize) -> PathBuf {
        self.root.join(format!("proj-step{}", n))
    }

    pub fn sinograms(&self) -> PathBuf {
        self.root.join("sinos")
    }

    pub fn filtered_sinograms(&self) -> PathBuf {
        self.root.join("sinos-filt")
    }

    /// Spot masks used by the spot-removal stage.
    pub fn spot_masks(&self) -> PathBuf {
        self.root.join("spots")
    }

    /// Working directory of the axis grid search.
    pub fn axis_search(&self) -> PathBuf {
        self.root.join("axis-search")
    }
}

/// Owner of the staging root for one batch run.
///
/// Every directory handed out through [`StagingArea::prepare`] is recorded in
/// the manifest and removed by the next `prepare` or by [`StagingArea::sweep`].
/// Paths outside the root are refused.
#[derive(Debug)]
pub struct StagingArea {
    layout: StagingLayout,
    manifest: Vec<PathBuf>,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: StagingLayout::new(root),
            manifest: Vec::new(),
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    pub fn manifest(&self) -> &[PathBuf] {
        &self.manifest
    }

    /// Sweep the previous set's directories, then create and record `dirs`.
    pub fn prepare(&mut self, dirs: &[PathBuf]) -> Result<()> {
        self.sweep()?;
        for dir in dirs {
            self.check_owned(dir)?;
        }
        for dir in dirs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
            self.manifest.push(dir.clone());
        }
        Ok(())
    }

    /// Empty `dir` and recreate it, recording it in the manifest.
    pub fn clear_dir(&mut self, dir: &Path) -> Result<()> {
        self.check_owned(dir)?;
        remove_dir(dir)?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
        if !self.manifest.iter().any(|d| d == dir) {
            self.manifest.push(dir.to_path_buf());
        }
        Ok(())
    }

    /// Remove every recorded directory.
    pub fn sweep(&mut self) -> Result<()> {
        for dir in self.manifest.drain(..) {
            remove_dir(&dir)?;
            tracing::debug!("Removed staging directory {}", dir.display());
        }
        Ok(())
    }

    fn check_owned(&self, dir: &Path) -> Result<()> {
        if dir == self.layout.root() || !dir.starts_with(self.layout.root()) {
            anyhow::bail!(
                "{} is not inside the staging directory {}",
                dir.display(),
                self.layout.root().display()
            );
        }
        Ok(())
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_sweeps_previous_set() {
        let root = tempdir().unwrap();
        let mut staging = StagingArea::new(root.path());
        let sinos = staging.layout().sinograms();
        staging.prepare(&[sinos.clone()]).unwrap();
        std::fs::write(sinos.join("sin-0000.tif"), b"stale").unwrap();

        let step = staging.layout().projection_step(1);
        staging.prepare(&[step.clone()]).unwrap();
        assert!(!sinos.exists());
        assert!(step.is_dir());
        assert_eq!(staging.manifest(), &[step.clone()]);

        staging.sweep().unwrap();
        assert!(!step.exists());
        assert!(staging.manifest().is_empty());
    }

    #[test]
    fn test_refuses_paths_outside_root() {
        let root = tempdir().unwrap();
        let other = tempdir().unwrap();
        let mut staging = StagingArea::new(root.path());
        assert!(staging.prepare(&[other.path().join("x")]).is_err());
        assert!(staging.clear_dir(root.path()).is_err());
        assert!(other.path().exists());
    }

    #[test]
    fn test_clear_dir_removes_contents() {
        let root = tempdir().unwrap();
        let mut staging = StagingArea::new(root.path());
        let search = staging.layout().axis_search();
        std::fs::create_dir_all(search.join("candidate-0000")).unwrap();
        staging.clear_dir(&search).unwrap();
        assert!(search.is_dir());
        assert_eq!(std::fs::read_dir(&search).unwrap().count(), 0);
        staging.clear_dir(&search).unwrap();
        assert_eq!(staging.manifest().len(), 1);
    }
}
