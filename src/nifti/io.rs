//! NIfTI reading and writing.
//!
//! - `.nii` files are memory-mapped and decoded on demand
//! - `.nii.gz` files are decompressed in one shot with libdeflate, falling back
//!   to streaming flate2 for multi-member or >4GB streams

use super::header::NiftiHeader;
use super::image::NiftiImage;
use crate::error::{Error, Result};
use flate2::bufread::MultiGzDecoder;
use libdeflater::{CompressionLvl, Compressor, DecompressionError, Decompressor};
use memmap2::Mmap;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

const GZIP_BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound on deflate's expansion ratio; larger ISIZE values are bogus.
const MAX_DEFLATE_RATIO: usize = 1032;

thread_local! {
    static DECOMPRESSOR: RefCell<Decompressor> = RefCell::new(Decompressor::new());
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// Load a NIfTI image from file.
///
/// Supports both `.nii` and `.nii.gz`, chosen by extension.
///
/// # Example
/// ```ignore
/// let img = brats_prep::nifti::load("BraTS-GLI-00000-000-t2f.nii.gz")?;
/// let volume = img.to_volume()?;
/// ```
#[must_use = "this function returns a loaded image that should be used"]
pub fn load<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    let path = path.as_ref();
    if is_gzipped(path) {
        load_gzipped(path)
    } else {
        load_uncompressed(path)
    }
}

/// Read only the header of a NIfTI file.
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
    let path = path.as_ref();
    let mut bytes = vec![0u8; NiftiHeader::SIZE];
    let file = File::open(path)?;

    if is_gzipped(path) {
        let mut decoder = MultiGzDecoder::new(BufReader::new(file));
        decoder
            .read_exact(&mut bytes)
            .map_err(|e| Error::Decompression(format!("gzip header decode failed: {e}")))?;
    } else {
        BufReader::new(file).read_exact(&mut bytes)?;
    }
    NiftiHeader::from_bytes(&bytes)
}

/// Check that the buffer holds the whole voxel payload.
///
/// Header extensions, if any, sit between the header and `vox_offset` and are
/// skipped.
fn payload_range(total: usize, header: &NiftiHeader) -> Result<(usize, usize)> {
    let offset = header.vox_offset;
    let size = header.data_size()?;
    let end = header.payload_end()?;
    if total < end {
        return Err(Error::InvalidFileFormat(format!(
            "file truncated: {total} bytes, header expects {end}"
        )));
    }
    Ok((offset, size))
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path) -> Result<NiftiImage> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only; concurrent external modification can
    // corrupt the decoded values but not memory safety of the slice itself.
    let mmap = unsafe { Mmap::map(&file)? };

    let header = NiftiHeader::from_bytes(&mmap)?;
    let (offset, size) = payload_range(mmap.len(), &header)?;
    Ok(NiftiImage::from_shared_mmap(header, Arc::new(mmap), offset, size))
}

fn load_gzipped(path: &Path) -> Result<NiftiImage> {
    let compressed = std::fs::read(path)?;
    let mut output = decompress_gzip(&compressed)?;

    // ISIZE only covers the last member, so a multi-member stream can come
    // back short; decode the whole stream in that case.
    let complete = NiftiHeader::from_bytes(&output)
        .and_then(|h| h.payload_end())
        .is_ok_and(|end| output.len() >= end);
    if !complete {
        output = decompress_gzip_streaming(&compressed)?;
    }

    let header = NiftiHeader::from_bytes(&output)?;
    let (offset, size) = payload_range(output.len(), &header)?;
    Ok(NiftiImage::from_shared_bytes(
        header,
        Arc::new(output),
        offset,
        size,
    ))
}

/// Uncompressed size from the gzip trailer (RFC 1952 ISIZE, modulo 2^32).
fn gzip_isize(compressed: &[u8]) -> usize {
    match compressed.len().checked_sub(4) {
        Some(at) => {
            let t = &compressed[at..];
            u32::from_le_bytes([t[0], t[1], t[2], t[3]]) as usize
        }
        None => 0,
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, compressed));
    let mut output = Vec::with_capacity(gzip_isize(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let estimate = gzip_isize(compressed);
    if estimate > compressed.len().saturating_mul(MAX_DEFLATE_RATIO) {
        return decompress_gzip_streaming(compressed);
    }

    let mut output = vec![0u8; estimate.max(NiftiHeader::SIZE)];
    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));

    match result {
        Ok(written) => {
            output.truncate(written);
            Ok(output)
        }
        // Undersized buffer or a stream libdeflate rejects: let flate2 decide.
        Err(DecompressionError::InsufficientSpace | DecompressionError::BadData) => {
            decompress_gzip_streaming(compressed)
        }
    }
}

/// Save a NIfTI image; `.nii.gz` paths are gzip-compressed.
///
/// # Example
/// ```ignore
/// brats_prep::nifti::save(&img, "out/seg.nii.gz")?;
/// ```
pub fn save<P: AsRef<Path>>(image: &NiftiImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let header = image.header();
    let header_bytes = header.to_bytes();
    let padding = header.vox_offset.saturating_sub(NiftiHeader::SIZE);
    let data = image.data_to_bytes()?;

    if is_gzipped(path) {
        let mut uncompressed = Vec::with_capacity(header_bytes.len() + padding + data.len());
        uncompressed.extend_from_slice(&header_bytes);
        uncompressed.resize(uncompressed.len() + padding, 0u8);
        uncompressed.extend_from_slice(&data);

        let mut compressor = Compressor::new(CompressionLvl::fastest());
        let mut compressed = vec![0u8; compressor.gzip_compress_bound(uncompressed.len())];
        let written = compressor
            .gzip_compress(&uncompressed, &mut compressed)
            .map_err(|e| Error::Io(std::io::Error::other(format!("compression failed: {e:?}"))))?;
        compressed.truncate(written);
        std::fs::write(path, compressed)?;
    } else {
        let mut writer = BufWriter::with_capacity(1024 * 1024, File::create(path)?);
        writer.write_all(&header_bytes)?;
        writer.write_all(&vec![0u8; padding])?;
        writer.write_all(&data)?;
        writer.flush()?;
    }
    Ok(())
}
