//! `NIfTI` file format support.
//!
//! Reads and writes single-file NIfTI-1 volumes (`.nii` and `.nii.gz`), the
//! format every modality and segmentation of a subject is stored in.

pub(crate) mod header;
pub(crate) mod image;
pub mod io;

pub use header::{DataType, NiftiHeader};
pub use image::NiftiImage;
pub use io::{load, load_header, save};
