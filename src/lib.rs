//! # brats-prep
//!
//! Preprocessing and batch generation for multi-modal brain MRI segmentation
//! datasets laid out BraTS style: one directory per subject holding four
//! imaging modalities and a segmentation volume.
//!
//! ## Pipeline
//!
//! - [`nifti`]: NIfTI-1 reading and writing (`.nii`, `.nii.gz`)
//! - [`transforms`]: normalization, resampling and joint augmentation
//! - [`subject`]: per-subject load, normalize, resample and stack
//! - [`loader`]: endless, shuffled batch iterator
//! - [`split`]: reproducible hold-out split (moves directories)
//!
//! ## Quick Start
//!
//! ```ignore
//! use brats_prep::{dataset, BatchGenerator, GeneratorOptions, SubjectPreprocessor};
//!
//! let pool = dataset::discover_subjects("data/train")?;
//! let pre = SubjectPreprocessor::new([128, 128, 128], "nii.gz")?;
//! let mut batches = BatchGenerator::seeded(pool, pre, GeneratorOptions::new(2), Some(42))?;
//!
//! let batch = batches.next_batch()?;
//! assert_eq!(batch.images.shape()[4], 4);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod nifti;
pub mod split;
pub mod subject;
pub mod transforms;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use loader::{Batch, BatchGenerator, FailurePolicy, GeneratorOptions};
pub use split::{plan_split, split_dataset, SplitPlan};
pub use subject::{load_volume, Modality, Subject, SubjectPreprocessor};
pub use transforms::Interpolation;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
