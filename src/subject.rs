//! Subjects on disk and the per-subject preprocessing transform.
//!
//! A subject is a directory named after its identifier holding one volume
//! per [`Modality`] plus a segmentation:
//!
//! ```text
//! BraTS-GLI-00000-000/
//!     BraTS-GLI-00000-000-t2f.nii.gz
//!     BraTS-GLI-00000-000-t1n.nii.gz
//!     BraTS-GLI-00000-000-t1c.nii.gz
//!     BraTS-GLI-00000-000-t2w.nii.gz
//!     BraTS-GLI-00000-000-seg.nii.gz
//! ```

use crate::error::{Error, Result};
use crate::nifti;
use crate::transforms::{normalize, resample_nearest, resample_trilinear};
use ndarray::{stack, Array3, Array4, Axis};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default file extension of subject volumes.
pub const DEFAULT_EXTENSION: &str = "nii.gz";

/// Filename suffix of the segmentation volume.
pub const LABEL_SUFFIX: &str = "seg";

/// Imaging modality, in channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    /// T2 fluid-attenuated inversion recovery.
    Flair,
    /// Native T1.
    T1,
    /// Contrast-enhanced T1.
    T1ce,
    /// T2-weighted.
    T2,
}

impl Modality {
    /// All modalities; index equals channel.
    pub const ALL: [Modality; 4] = [Self::Flair, Self::T1, Self::T1ce, Self::T2];

    /// Filename suffix identifying this modality.
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Flair => "t2f",
            Self::T1 => "t1n",
            Self::T1ce => "t1c",
            Self::T2 => "t2w",
        }
    }

    /// Channel index in the stacked image.
    pub const fn channel(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flair => "flair",
            Self::T1 => "t1",
            Self::T1ce => "t1ce",
            Self::T2 => "t2",
        };
        f.write_str(name)
    }
}

/// A subject directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject {
    dir: PathBuf,
    id: String,
}

impl Subject {
    /// Subject rooted at `dir`; the directory's base name is the identifier.
    ///
    /// The directory itself is not checked; missing files surface when
    /// volumes are loaded.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "cannot derive a subject id from {}",
                    dir.display()
                ))
            })?
            .to_string();
        Ok(Self { dir, id })
    }

    /// Subject identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subject directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn volume_path(&self, suffix: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}-{suffix}.{extension}", self.id))
    }

    /// Path of one modality volume.
    pub fn modality_path(&self, modality: Modality, extension: &str) -> PathBuf {
        self.volume_path(modality.suffix(), extension)
    }

    /// Path of the segmentation volume.
    pub fn label_path(&self, extension: &str) -> PathBuf {
        self.volume_path(LABEL_SUFFIX, extension)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Load a 3-D volume as `f32`.
///
/// Any failure, including a volume that is not 3-D, is reported as
/// [`Error::Load`] naming `path`.
pub fn load_volume<P: AsRef<Path>>(path: P) -> Result<Array3<f32>> {
    let path = path.as_ref();
    nifti::load(path)
        .and_then(|img| img.to_volume())
        .map_err(|e| Error::load(path, e))
}

/// Load a segmentation volume as `u8` class indices.
///
/// Every voxel must hold an integral value in `0..=255`.
pub fn load_labels<P: AsRef<Path>>(path: P) -> Result<Array3<u8>> {
    let path = path.as_ref();
    let volume = load_volume(path)?;
    if let Some(bad) = volume
        .iter()
        .find(|v| !(v.fract() == 0.0 && (0.0..=255.0).contains(*v)))
    {
        return Err(Error::load(
            path,
            Error::InvalidFileFormat(format!("label value {bad} is not a class index")),
        ));
    }
    Ok(volume.mapv(|v| v as u8))
}

/// Loads, normalizes, resamples and stacks one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPreprocessor {
    target_shape: [usize; 3],
    extension: String,
}

impl Default for SubjectPreprocessor {
    fn default() -> Self {
        Self {
            target_shape: [128, 128, 128],
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl SubjectPreprocessor {
    /// Preprocessor resampling to `target_shape`, reading `*.{extension}`.
    pub fn new(target_shape: [usize; 3], extension: impl Into<String>) -> Result<Self> {
        if target_shape.contains(&0) {
            return Err(Error::shape(format!(
                "target shape {target_shape:?} must be positive"
            )));
        }
        let extension = extension.into().trim_start_matches('.').to_string();
        if extension.is_empty() {
            return Err(Error::Configuration("file extension is empty".into()));
        }
        Ok(Self {
            target_shape,
            extension,
        })
    }

    /// Output spatial shape.
    pub fn target_shape(&self) -> [usize; 3] {
        self.target_shape
    }

    /// Volume file extension, without the leading dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Normalize then resample one modality; errors name the file.
    fn modality(&self, subject: &Subject, modality: Modality) -> Result<Array3<f32>> {
        let path = subject.modality_path(modality, &self.extension);
        let volume = load_volume(&path)?;
        let normalized = normalize(&volume).map_err(|e| attach_path(e, &path))?;
        resample_trilinear(&normalized, self.target_shape).map_err(|e| attach_path(e, &path))
    }

    /// Produce the `(D, H, W, 4)` image and `(D, H, W)` label of a subject.
    ///
    /// Channels follow [`Modality::ALL`].
    pub fn preprocess(&self, subject: &Subject) -> Result<(Array4<f32>, Array3<u8>)> {
        let channels = Modality::ALL
            .iter()
            .map(|&m| self.modality(subject, m))
            .collect::<Result<Vec<_>>>()?;

        let label_path = subject.label_path(&self.extension);
        let labels = load_labels(&label_path)?;
        let labels =
            resample_nearest(&labels, self.target_shape).map_err(|e| attach_path(e, &label_path))?;

        let views: Vec<_> = channels.iter().map(|c| c.view()).collect();
        let image = stack(Axis(3), &views)
            .map_err(|e| Error::shape(format!("cannot stack modalities of {subject}: {e}")))?;

        debug!(subject = %subject, shape = ?image.dim(), "preprocessed subject");
        Ok((image, labels))
    }

    /// [`preprocess`](Self::preprocess) a subject given its directory.
    pub fn preprocess_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(Array4<f32>, Array3<u8>)> {
        self.preprocess(&Subject::from_dir(dir.as_ref())?)
    }
}

/// Prefix a preprocessing error with the file it came from.
fn attach_path(error: Error, path: &Path) -> Error {
    match error {
        Error::DegenerateVolume(msg) => {
            Error::DegenerateVolume(format!("{}: {msg}", path.display()))
        }
        Error::Shape(msg) => Error::Shape(format!("{}: {msg}", path.display())),
        other => other,
    }
}
