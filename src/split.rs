//! Reproducible hold-out split of a subject population.
//!
//! **Destructive.** [`SplitPlan::execute`] and [`split_dataset`] *move*
//! subject directories: the source directory permanently loses every
//! selected subject. Use [`plan_split`] alone to preview a split.

use crate::dataset::discover_subject_dirs;
use crate::error::{Error, Result};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Default seed of the hold-out selection.
pub const DEFAULT_SPLIT_SEED: u64 = 42;

/// Default number of subjects held out.
pub const DEFAULT_SPLIT_COUNT: usize = 100;

/// Subjects chosen for a split, not yet moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    source: PathBuf,
    population: usize,
    selected: Vec<PathBuf>,
}

impl SplitPlan {
    /// Source directory.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Number of subjects found in the source.
    pub fn population(&self) -> usize {
        self.population
    }

    /// Selected subject directories, in selection order.
    pub fn selected(&self) -> &[PathBuf] {
        &self.selected
    }

    /// Identifiers of the selected subjects.
    pub fn selected_ids(&self) -> Vec<String> {
        self.selected
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect()
    }

    /// Move the selected subjects into `dest`, creating it if needed.
    ///
    /// **Destructive**: the subjects disappear from the source. Fails before
    /// moving anything if a selected subject already exists in `dest`.
    /// Returns the new subject paths.
    pub fn execute<P: AsRef<Path>>(&self, dest: P) -> Result<Vec<PathBuf>> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;

        let targets = self
            .selected
            .iter()
            .map(|src| {
                let name = src.file_name().ok_or_else(|| {
                    Error::Configuration(format!("{} has no file name", src.display()))
                })?;
                Ok((src, dest.join(name)))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some((_, clash)) = targets.iter().find(|(_, t)| t.exists()) {
            return Err(Error::Configuration(format!(
                "{} already exists, refusing to overwrite",
                clash.display()
            )));
        }

        for (src, target) in &targets {
            move_dir(src, target)?;
            debug!(from = %src.display(), to = %target.display(), "moved subject");
        }
        info!(
            moved = targets.len(),
            source = %self.source.display(),
            dest = %dest.display(),
            "split complete"
        );
        Ok(targets.into_iter().map(|(_, t)| t).collect())
    }
}

/// Choose `count` subjects of `source` uniformly without replacement.
///
/// Subjects are listed in name order before sampling, so the same seed on
/// the same population always selects the same subjects. Nothing on disk
/// changes.
pub fn plan_split<P: AsRef<Path>>(source: P, count: usize, seed: u64) -> Result<SplitPlan> {
    let source = source.as_ref();
    let mut subjects = discover_subject_dirs(source)?;
    let population = subjects.len();
    if count > population {
        return Err(Error::InsufficientPopulation {
            requested: count,
            available: population,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let picks = index::sample(&mut rng, population, count);
    let selected = picks
        .iter()
        .map(|i| std::mem::take(&mut subjects[i]))
        .collect();

    Ok(SplitPlan {
        source: source.to_path_buf(),
        population,
        selected,
    })
}

/// Move `count` randomly chosen subjects from `source` to `dest`.
///
/// **Destructive**; see [`SplitPlan::execute`]. The population check runs
/// before any filesystem change.
pub fn split_dataset<P: AsRef<Path>, Q: AsRef<Path>>(
    source: P,
    dest: Q,
    count: usize,
    seed: u64,
) -> Result<Vec<PathBuf>> {
    plan_split(source, count, seed)?.execute(dest)
}

/// Rename, or copy then delete when the rename crosses filesystems.
fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(src = %src.display(), "rename crosses devices, copying");
            copy_dir_all(src, dst)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
const CROSS_DEVICE_CODE: i32 = 18; // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_CODE: i32 = 17; // ERROR_NOT_SAME_DEVICE
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE_CODE: i32 = -1;

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(CROSS_DEVICE_CODE)
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn populate(root: &Path, n: usize) {
        for i in 0..n {
            let dir = root.join(format!("subject-{i:03}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vol.nii"), i.to_string()).unwrap();
        }
    }

    #[test]
    fn test_plan_is_reproducible_and_distinct() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 30);

        let a = plan_split(dir.path(), 10, 42).unwrap();
        let b = plan_split(dir.path(), 10, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.population(), 30);

        let unique: BTreeSet<_> = a.selected_ids().into_iter().collect();
        assert_eq!(unique.len(), 10);

        let c = plan_split(dir.path(), 10, 7).unwrap();
        assert_ne!(a.selected(), c.selected());
    }

    #[test]
    fn test_insufficient_population_moves_nothing() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("train");
        let dest = dir.path().join("test");
        populate(&src, 5);

        let err = split_dataset(&src, &dest, 6, 42).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPopulation {
                requested: 6,
                available: 5
            }
        ));
        assert_eq!(discover_subject_dirs(&src).unwrap().len(), 5);
        assert!(!dest.exists());
    }

    #[test]
    fn test_execute_moves_contents() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("train");
        let dest = dir.path().join("test");
        populate(&src, 8);

        let moved = split_dataset(&src, &dest, 3, 1).unwrap();
        assert_eq!(moved.len(), 3);
        for path in &moved {
            assert!(path.join("vol.nii").is_file());
            assert!(!src.join(path.file_name().unwrap()).exists());
        }
        assert_eq!(discover_subject_dirs(&src).unwrap().len(), 5);
    }

    #[test]
    fn test_collision_aborts_before_moving() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("train");
        let dest = dir.path().join("test");
        populate(&src, 4);

        let plan = plan_split(&src, 4, 0).unwrap();
        fs::create_dir_all(dest.join("subject-002")).unwrap();

        assert!(matches!(plan.execute(&dest), Err(Error::Configuration(_))));
        assert_eq!(discover_subject_dirs(&src).unwrap().len(), 4);
    }

    #[test]
    fn test_copy_fallback() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file"), b"data").unwrap();

        let dst = dir.path().join("b");
        copy_dir_all(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("nested/file")).unwrap(), b"data");
    }

    #[test]
    fn test_copy_fallback_deep_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let mut deep = src.clone();
        for level in 0..64 {
            deep.push(format!("d{level}"));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf"), b"x").unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();

        let dst = dir.path().join("b");
        copy_dir_all(&src, &dst).unwrap();
        let copied = dst.join(deep.strip_prefix(&src).unwrap()).join("leaf");
        assert_eq!(fs::read(copied).unwrap(), b"x");
        assert!(dst.join("empty").is_dir());
    }

    #[test]
    fn test_rename_failure_is_not_swallowed() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("missing");
        let dst = dir.path().join("dest");
        let err = move_dir(&src, &dst).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
        assert!(!dst.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cross_device_detection() {
        assert!(is_cross_device(&io::Error::from_raw_os_error(18)));
        assert!(!is_cross_device(&io::Error::from_raw_os_error(13)));
        assert!(!is_cross_device(&io::Error::other("x")));
    }

    #[test]
    fn test_zero_count_is_a_noop() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 3);
        let plan = plan_split(dir.path(), 0, 42).unwrap();
        assert!(plan.selected().is_empty());
    }
}
