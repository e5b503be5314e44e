//! In-memory NIfTI image with lazily decoded voxel data.

use super::header::{DataType, NiftiHeader};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memmap2::Mmap;
use ndarray::{Array3, ArrayD, IxDyn, ShapeBuilder};
use rayon::prelude::*;
use std::sync::Arc;

/// Below this many voxels decoding stays on the calling thread.
const PARALLEL_DECODE_THRESHOLD: usize = 1 << 16;

/// Backing buffer for raw voxel bytes.
#[derive(Debug, Clone)]
enum RawBuffer {
    Mapped(Arc<Mmap>),
    Heap(Arc<Vec<u8>>),
}

impl RawBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => &m[..],
            Self::Heap(v) => &v[..],
        }
    }
}

#[derive(Debug, Clone)]
enum Storage {
    /// Undecoded bytes as stored on disk (Fortran order, file endianness).
    Raw {
        buf: RawBuffer,
        offset: usize,
        len: usize,
    },
    F32(ArrayD<f32>),
    U8(ArrayD<u8>),
}

/// A NIfTI volume: header plus voxel data.
///
/// Data read from disk stays in its stored representation until one of the
/// `to_*` accessors decodes it.
#[derive(Debug, Clone)]
pub struct NiftiImage {
    header: NiftiHeader,
    storage: Storage,
}

impl NiftiImage {
    pub(crate) fn from_shared_mmap(
        header: NiftiHeader,
        mmap: Arc<Mmap>,
        offset: usize,
        len: usize,
    ) -> Self {
        Self {
            header,
            storage: Storage::Raw {
                buf: RawBuffer::Mapped(mmap),
                offset,
                len,
            },
        }
    }

    pub(crate) fn from_shared_bytes(
        header: NiftiHeader,
        bytes: Arc<Vec<u8>>,
        offset: usize,
        len: usize,
    ) -> Self {
        Self {
            header,
            storage: Storage::Raw {
                buf: RawBuffer::Heap(bytes),
                offset,
                len,
            },
        }
    }

    /// Wrap a floating-point volume with a default header.
    pub fn from_volume(volume: Array3<f32>) -> Self {
        let (d, h, w) = volume.dim();
        Self {
            header: NiftiHeader::for_volume([d, h, w], DataType::Float32),
            storage: Storage::F32(volume.into_dyn()),
        }
    }

    /// Wrap a label volume with a default header.
    pub fn from_labels(labels: Array3<u8>) -> Self {
        let (d, h, w) = labels.dim();
        Self {
            header: NiftiHeader::for_volume([d, h, w], DataType::UInt8),
            storage: Storage::U8(labels.into_dyn()),
        }
    }

    /// Image header.
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Mutable header access, e.g. to set intensity scaling before saving.
    pub fn header_mut(&mut self) -> &mut NiftiHeader {
        &mut self.header
    }

    /// Shape over the header's dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.header.shape()
    }

    /// Storage datatype.
    pub fn dtype(&self) -> DataType {
        self.header.datatype
    }

    /// Decode all voxels as `f32`, applying `scl_slope`/`scl_inter`.
    ///
    /// The returned array uses Fortran layout, matching the file order.
    pub fn to_f32(&self) -> Result<ArrayD<f32>> {
        let shape = self.header.shape();
        let values = self.decode_f32()?;
        ArrayD::from_shape_vec(IxDyn(&shape).f(), values)
            .map_err(|e| Error::shape(format!("cannot shape voxel data as {shape:?}: {e}")))
    }

    /// Decode a 3-D volume as `f32`.
    ///
    /// 4-D and higher images are accepted when every extra dimension is 1.
    pub fn to_volume(&self) -> Result<Array3<f32>> {
        let [d, h, w] = self.header.shape3().ok_or_else(|| {
            Error::shape(format!(
                "expected a 3-D volume, got shape {:?}",
                self.header.shape()
            ))
        })?;
        let values = self.decode_f32()?;
        Array3::from_shape_vec((d, h, w).f(), values)
            .map_err(|e| Error::shape(format!("cannot shape voxel data as {:?}: {e}", [d, h, w])))
    }

    fn decode_f32(&self) -> Result<Vec<f32>> {
        let mut values = match &self.storage {
            Storage::Raw { buf, offset, len } => {
                let bytes = buf
                    .as_slice()
                    .get(*offset..offset + len)
                    .ok_or_else(|| Error::InvalidFileFormat("voxel data out of range".into()))?;
                if self.header.little_endian {
                    decode_bytes::<LittleEndian>(bytes, self.header.datatype)
                } else {
                    decode_bytes::<BigEndian>(bytes, self.header.datatype)
                }
            }
            Storage::F32(a) => a.t().iter().copied().collect(),
            Storage::U8(a) => a.t().iter().map(|&v| f32::from(v)).collect(),
        };

        if self.header.has_scaling() {
            let (slope, inter) = (self.header.scl_slope, self.header.scl_inter);
            values.par_iter_mut().for_each(|v| *v = *v * slope + inter);
        }
        Ok(values)
    }

    /// Voxel payload as little-endian bytes in Fortran order.
    pub(crate) fn data_to_bytes(&self) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Raw { buf, offset, len } => {
                let bytes = buf
                    .as_slice()
                    .get(*offset..offset + len)
                    .ok_or_else(|| Error::InvalidFileFormat("voxel data out of range".into()))?;
                if self.header.little_endian {
                    Ok(bytes.to_vec())
                } else {
                    Ok(swap_to_little_endian(bytes, self.header.datatype.byte_size()))
                }
            }
            Storage::F32(a) => {
                let mut out = vec![0u8; a.len() * 4];
                for (chunk, &v) in out.chunks_exact_mut(4).zip(a.t().iter()) {
                    LittleEndian::write_f32(chunk, v);
                }
                Ok(out)
            }
            Storage::U8(a) => Ok(a.t().iter().copied().collect()),
        }
    }
}

fn swap_to_little_endian(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for chunk in out.chunks_exact_mut(width) {
        chunk.reverse();
    }
    out
}

/// Decode raw voxel bytes of `datatype` into `f32`.
fn decode_bytes<E: ByteOrder>(bytes: &[u8], datatype: DataType) -> Vec<f32> {
    let width = datatype.byte_size();
    let convert = move |c: &[u8]| -> f32 {
        match datatype {
            DataType::UInt8 => f32::from(c[0]),
            DataType::Int8 => f32::from(c[0] as i8),
            DataType::Int16 => f32::from(E::read_i16(c)),
            DataType::UInt16 => f32::from(E::read_u16(c)),
            DataType::Int32 => E::read_i32(c) as f32,
            DataType::UInt32 => E::read_u32(c) as f32,
            DataType::Float32 => E::read_f32(c),
            DataType::Float64 => E::read_f64(c) as f32,
        }
    };

    if bytes.len() / width >= PARALLEL_DECODE_THRESHOLD {
        bytes.par_chunks_exact(width).map(convert).collect()
    } else {
        bytes.chunks_exact(width).map(convert).collect()
    }
}
