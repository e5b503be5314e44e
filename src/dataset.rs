//! Subject discovery over a dataset directory.

use crate::error::Result;
use crate::subject::Subject;
use std::path::{Path, PathBuf};

/// Conventional partition directory names, in reporting order.
pub const PARTITIONS: [&str; 3] = ["train", "val", "test"];

/// Subject directories directly under `dir`, sorted by name.
///
/// Plain files and hidden entries (leading `.`) are ignored.
pub fn discover_subject_dirs<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Subjects directly under `dir`, sorted by identifier.
pub fn discover_subjects<P: AsRef<Path>>(dir: P) -> Result<Vec<Subject>> {
    discover_subject_dirs(dir)?
        .into_iter()
        .map(Subject::from_dir)
        .collect()
}

/// Number of subjects per partition of a dataset root.
///
/// Looks for `train`, `val` and `test` below `dataset_dir`; a missing
/// partition counts as zero. The result is sorted by count, largest first,
/// ties keeping the partition order.
pub fn partition_counts<P: AsRef<Path>>(dataset_dir: P) -> Result<Vec<(String, usize)>> {
    let root = dataset_dir.as_ref();
    let mut counts = Vec::with_capacity(PARTITIONS.len());
    for name in PARTITIONS {
        let dir = root.join(name);
        let n = if dir.is_dir() {
            discover_subject_dirs(&dir)?.len()
        } else {
            0
        };
        counts.push((name.to_string(), n));
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(counts)
}
