//! Forward smoothing of axis values across the z-views of one sample.

use crate::config::OutlierThresholds;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Axis values keyed by z-view directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZStackSeries {
    entries: Vec<(PathBuf, f64)>,
}

impl ZStackSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, view: impl Into<PathBuf>, value: f64) {
        self.entries.push((view.into(), value));
    }

    pub fn get(&self, view: &Path) -> Option<f64> {
        self.entries
            .iter()
            .find(|(p, _)| p == view)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, f64)> {
        self.entries.iter().map(|(p, v)| (p.as_path(), *v))
    }

    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Views grouped by parent directory, each group sorted by name.
    fn groups(&self) -> BTreeMap<PathBuf, Vec<usize>> {
        let mut groups: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for (i, (view, _)) in self.entries.iter().enumerate() {
            let parent = view.parent().map(Path::to_path_buf).unwrap_or_default();
            groups.entry(parent).or_default().push(i);
        }
        for members in groups.values_mut() {
            members.sort_by(|&a, &b| self.entries[a].0.file_name().cmp(&self.entries[b].0.file_name()));
        }
        groups
    }
}

impl FromIterator<(PathBuf, f64)> for ZStackSeries {
    fn from_iter<I: IntoIterator<Item = (PathBuf, f64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Correct every parent group of `series` independently.
///
/// The returned series keeps the input order of the views.
pub fn correct_series(series: &ZStackSeries, thresholds: &OutlierThresholds) -> ZStackSeries {
    let mut corrected = series.clone();
    for (parent, members) in series.groups() {
        let mut values: Vec<f64> = members.iter().map(|&i| series.entries[i].1).collect();
        let before = values.clone();
        correct_run(&mut values, thresholds);
        if values != before {
            tracing::info!(
                "Corrected axis outliers under {}: {:?} -> {:?}",
                parent.display(),
                before,
                values
            );
        }
        for (&i, v) in members.iter().zip(values) {
            corrected.entries[i].1 = v;
        }
    }
    corrected
}

/// One forward pass over values in z order.
///
/// A first value more than `first_view_margin` above the minimum is replaced
/// by the minimum; afterwards every jump larger than `max_jump` is replaced by
/// a step of `jump_step` from the previous (already corrected) value.
pub fn correct_run(values: &mut [f64], thresholds: &OutlierThresholds) {
    let Some(min) = values.iter().copied().reduce(f64::min) else {
        return;
    };
    if values[0] > min + thresholds.first_view_margin {
        values[0] = min;
    }
    for i in 1..values.len() {
        if (values[i] - values[i - 1]).abs() > thresholds.max_jump {
            values[i] = values[i - 1] + thresholds.jump_step;
        }
    }
}
