//! NIfTI-1 header parsing and serialization.
//!
//! Only the fields needed to locate, decode and rescale voxel data are kept;
//! the spatial transform rows are carried through so written files stay valid.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte offsets of the NIfTI-1 header fields we read or write.
mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const SROW_Y: usize = 296;
    pub const SROW_Z: usize = 312;
    pub const MAGIC: usize = 344;
}

/// Voxel storage types understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit floating point
    Float32 = 16,
    /// 64-bit floating point
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
}

impl DataType {
    /// Parse from a NIfTI datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(Self::UInt8),
            4 => Ok(Self::Int16),
            8 => Ok(Self::Int32),
            16 => Ok(Self::Float32),
            64 => Ok(Self::Float64),
            256 => Ok(Self::Int8),
            512 => Ok(Self::UInt16),
            768 => Ok(Self::UInt32),
            _ => Err(Error::UnsupportedDataType(code)),
        }
    }

    /// Bytes per voxel.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Rust type name, used in messages.
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::UInt8 => "u8",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Parsed NIfTI-1 header.
#[derive(Debug, Clone)]
pub struct NiftiHeader {
    /// Number of dimensions (1-7).
    pub ndim: u8,
    /// Extent along each dimension; entries past `ndim` are 1.
    pub dim: [usize; 7],
    /// Voxel storage type.
    pub datatype: DataType,
    /// qfac at index 0, voxel spacing at `1..=ndim`.
    pub pixdim: [f32; 8],
    /// Byte offset of the voxel data.
    pub vox_offset: usize,
    /// Intensity scaling slope; 0 disables scaling.
    pub scl_slope: f32,
    /// Intensity scaling intercept.
    pub scl_inter: f32,
    /// Raw `xyzt_units` byte.
    pub xyzt_units: u8,
    /// Free-text description.
    pub descrip: String,
    /// qform transform code.
    pub qform_code: i16,
    /// sform transform code.
    pub sform_code: i16,
    /// Rows of the sform affine.
    pub srow: [[f32; 4]; 3],
    pub(crate) little_endian: bool,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            ndim: 3,
            dim: [1; 7],
            datatype: DataType::Float32,
            pixdim: [1.0; 8],
            vox_offset: 352,
            scl_slope: 1.0,
            scl_inter: 0.0,
            xyzt_units: 2, // millimetres
            descrip: String::new(),
            qform_code: 0,
            sform_code: 1,
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            little_endian: true,
        }
    }
}

impl NiftiHeader {
    /// Size of a NIfTI-1 header in bytes.
    pub const SIZE: usize = 348;

    /// Header for a 3-D volume of the given shape and storage type.
    pub fn for_volume(shape: [usize; 3], datatype: DataType) -> Self {
        let mut header = Self {
            datatype,
            ..Self::default()
        };
        header.dim[..3].copy_from_slice(&shape);
        header
    }

    /// Parse a header, detecting byte order from `sizeof_hdr`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidFileFormat(format!(
                "header too short: got {} bytes, need {}",
                bytes.len(),
                Self::SIZE
            )));
        }

        let head = &bytes[offsets::SIZEOF_HDR..offsets::SIZEOF_HDR + 4];
        if LittleEndian::read_i32(head) == Self::SIZE as i32 {
            Self::parse::<LittleEndian>(bytes, true)
        } else if BigEndian::read_i32(head) == Self::SIZE as i32 {
            Self::parse::<BigEndian>(bytes, false)
        } else {
            Err(Error::InvalidMagic([head[0], head[1], head[2], head[3]]))
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn parse<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic == b"ni1\0" {
            return Err(Error::InvalidFileFormat(
                "split .hdr/.img pairs are not supported".to_string(),
            ));
        }
        if magic != b"n+1\0" {
            return Err(Error::InvalidMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }

        let ndim = E::read_i16(&bytes[DIM..DIM + 2]);
        if !(1..=7).contains(&ndim) {
            return Err(Error::InvalidDimensions(format!(
                "ndim must be 1..=7, got {ndim}"
            )));
        }

        let mut dim = [1usize; 7];
        for (i, d) in dim.iter_mut().enumerate().take(ndim as usize) {
            let at = DIM + 2 + i * 2;
            let raw = E::read_i16(&bytes[at..at + 2]);
            if raw <= 0 {
                return Err(Error::InvalidDimensions(format!(
                    "dimension {i} must be positive, got {raw}"
                )));
            }
            *d = raw as usize;
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        let bitpix = E::read_i16(&bytes[BITPIX..BITPIX + 2]);
        if bitpix as usize != datatype.byte_size() * 8 {
            return Err(Error::InvalidDimensions(format!(
                "bitpix {bitpix} does not match datatype {datatype}"
            )));
        }

        let mut pixdim = [0.0f32; 8];
        for (i, p) in pixdim.iter_mut().enumerate() {
            let at = PIXDIM + i * 4;
            *p = E::read_f32(&bytes[at..at + 4]);
        }

        let vox_offset = E::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 || vox_offset < Self::SIZE as f32
        {
            return Err(Error::InvalidFileFormat(format!(
                "vox_offset must be an integer >= {}, got {vox_offset}",
                Self::SIZE
            )));
        }
        if f64::from(vox_offset) > f64::from(u32::MAX) {
            return Err(Error::InvalidFileFormat(format!(
                "vox_offset {vox_offset} is out of range"
            )));
        }

        let read_row = |at: usize| {
            let mut row = [0.0f32; 4];
            for (i, v) in row.iter_mut().enumerate() {
                *v = E::read_f32(&bytes[at + i * 4..at + i * 4 + 4]);
            }
            row
        };

        let header = Self {
            ndim: ndim as u8,
            dim,
            datatype,
            pixdim,
            vox_offset: vox_offset as usize,
            scl_slope: E::read_f32(&bytes[SCL_SLOPE..SCL_SLOPE + 4]),
            scl_inter: E::read_f32(&bytes[SCL_INTER..SCL_INTER + 4]),
            xyzt_units: bytes[XYZT_UNITS],
            descrip: String::from_utf8_lossy(&bytes[DESCRIP..DESCRIP + 80])
                .trim_end_matches('\0')
                .to_string(),
            qform_code: E::read_i16(&bytes[QFORM_CODE..QFORM_CODE + 2]),
            sform_code: E::read_i16(&bytes[SFORM_CODE..SFORM_CODE + 2]),
            srow: [read_row(SROW_X), read_row(SROW_Y), read_row(SROW_Z)],
            little_endian,
        };
        header.payload_end()?;
        Ok(header)
    }

    /// Serialize as a little-endian NIfTI-1 header.
    #[allow(clippy::wildcard_imports)]
    pub fn to_bytes(&self) -> Vec<u8> {
        use offsets::*;
        type E = LittleEndian;

        let mut buf = vec![0u8; Self::SIZE];
        E::write_i32(&mut buf[SIZEOF_HDR..SIZEOF_HDR + 4], Self::SIZE as i32);

        E::write_i16(&mut buf[DIM..DIM + 2], i16::from(self.ndim));
        for (i, &d) in self.dim.iter().enumerate() {
            let at = DIM + 2 + i * 2;
            E::write_i16(&mut buf[at..at + 2], d.min(i16::MAX as usize) as i16);
        }

        E::write_i16(&mut buf[DATATYPE..DATATYPE + 2], self.datatype as i16);
        E::write_i16(
            &mut buf[BITPIX..BITPIX + 2],
            (self.datatype.byte_size() * 8) as i16,
        );
        for (i, &p) in self.pixdim.iter().enumerate() {
            let at = PIXDIM + i * 4;
            E::write_f32(&mut buf[at..at + 4], p);
        }

        E::write_f32(&mut buf[VOX_OFFSET..VOX_OFFSET + 4], self.vox_offset as f32);
        E::write_f32(&mut buf[SCL_SLOPE..SCL_SLOPE + 4], self.scl_slope);
        E::write_f32(&mut buf[SCL_INTER..SCL_INTER + 4], self.scl_inter);
        buf[XYZT_UNITS] = self.xyzt_units;

        let descrip = self.descrip.as_bytes();
        let len = descrip.len().min(79);
        buf[DESCRIP..DESCRIP + len].copy_from_slice(&descrip[..len]);

        E::write_i16(&mut buf[QFORM_CODE..QFORM_CODE + 2], self.qform_code);
        E::write_i16(&mut buf[SFORM_CODE..SFORM_CODE + 2], self.sform_code);
        for (row, at) in self.srow.iter().zip([SROW_X, SROW_Y, SROW_Z]) {
            for (i, &v) in row.iter().enumerate() {
                E::write_f32(&mut buf[at + i * 4..at + i * 4 + 4], v);
            }
        }

        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        buf
    }

    /// Shape over the first `ndim` dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim as usize].to_vec()
    }

    /// Spatial shape if the image is 3-D, allowing trailing singleton dimensions.
    pub fn shape3(&self) -> Option<[usize; 3]> {
        let trailing_ok = self.dim[3..self.ndim.max(3) as usize].iter().all(|&d| d == 1);
        (self.ndim >= 3 && trailing_ok).then(|| [self.dim[0], self.dim[1], self.dim[2]])
    }

    /// Voxel spacing for the first `ndim` dimensions.
    pub fn spacing(&self) -> Vec<f32> {
        self.pixdim[1..=self.ndim as usize].to_vec()
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> Result<usize> {
        self.dim[..self.ndim as usize]
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                Error::InvalidDimensions(format!(
                    "voxel count overflows for shape {:?}",
                    self.shape()
                ))
            })
    }

    /// Size of the voxel payload in bytes.
    pub fn data_size(&self) -> Result<usize> {
        self.num_voxels()?
            .checked_mul(self.datatype.byte_size())
            .ok_or_else(|| {
                Error::InvalidDimensions(format!(
                    "payload size overflows for shape {:?}",
                    self.shape()
                ))
            })
    }

    /// Byte offset one past the end of the voxel payload.
    pub fn payload_end(&self) -> Result<usize> {
        self.vox_offset
            .checked_add(self.data_size()?)
            .ok_or_else(|| Error::InvalidFileFormat("payload end overflows".to_string()))
    }

    /// True if the file was stored little-endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Whether `scl_slope`/`scl_inter` should be applied to stored values.
    pub fn has_scaling(&self) -> bool {
        self.scl_slope != 0.0
            && self.scl_slope.is_finite()
            && (self.scl_slope != 1.0 || self.scl_inter != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_little_endian() {
        let mut header = NiftiHeader::for_volume([64, 48, 32], DataType::Int16);
        header.pixdim[1..4].copy_from_slice(&[1.0, 2.0, 3.0]);
        header.descrip = "brats".to_string();

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), NiftiHeader::SIZE);

        let parsed = NiftiHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.shape(), vec![64, 48, 32]);
        assert_eq!(parsed.datatype, DataType::Int16);
        assert_eq!(parsed.spacing(), vec![1.0, 2.0, 3.0]);
        assert_eq!(parsed.descrip, "brats");
        assert!(parsed.is_little_endian());
    }

    #[test]
    fn test_big_endian_detection() {
        let mut bytes = vec![0u8; NiftiHeader::SIZE];
        BigEndian::write_i32(&mut bytes[0..4], 348);
        BigEndian::write_i16(&mut bytes[40..42], 3);
        for i in 0..3 {
            BigEndian::write_i16(&mut bytes[42 + i * 2..44 + i * 2], 4);
        }
        BigEndian::write_i16(&mut bytes[70..72], 2);
        BigEndian::write_i16(&mut bytes[72..74], 8);
        BigEndian::write_f32(&mut bytes[108..112], 352.0);
        bytes[344..348].copy_from_slice(b"n+1\0");

        let header = NiftiHeader::from_bytes(&bytes).unwrap();
        assert!(!header.is_little_endian());
        assert_eq!(header.shape3(), Some([4, 4, 4]));
        assert_eq!(header.datatype, DataType::UInt8);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = NiftiHeader::default().to_bytes();
        bytes[344..348].copy_from_slice(b"BAD!");
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(Error::InvalidMagic(m)) if &m == b"BAD!"
        ));
    }

    #[test]
    fn test_split_pair_rejected() {
        let mut bytes = NiftiHeader::default().to_bytes();
        bytes[344..348].copy_from_slice(b"ni1\0");
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(Error::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_bitpix_mismatch() {
        let mut bytes = NiftiHeader::default().to_bytes();
        LittleEndian::write_i16(&mut bytes[72..74], 8);
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(Error::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_oversized_dimensions_rejected() {
        let mut bytes = NiftiHeader::default().to_bytes();
        LittleEndian::write_i16(&mut bytes[40..42], 7);
        for i in 0..7 {
            LittleEndian::write_i16(&mut bytes[42 + i * 2..44 + i * 2], i16::MAX);
        }
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(Error::InvalidDimensions(msg)) if msg.contains("overflows")
        ));

        let mut header = NiftiHeader::default();
        header.ndim = 7;
        header.dim = [usize::MAX / 2; 7];
        assert!(header.num_voxels().is_err());
        assert!(header.data_size().is_err());
    }

    #[test]
    fn test_vox_offset_out_of_range() {
        let mut bytes = NiftiHeader::default().to_bytes();
        LittleEndian::write_f32(&mut bytes[108..112], 1e30);
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(Error::InvalidFileFormat(msg)) if msg.contains("vox_offset")
        ));

        let mut header = NiftiHeader::for_volume([2, 2, 2], DataType::Float32);
        assert_eq!(header.payload_end().unwrap(), 352 + 32);
        header.vox_offset = usize::MAX;
        assert!(header.payload_end().is_err());
    }

    #[test]
    fn test_shape3_accepts_trailing_singletons() {
        let mut header = NiftiHeader::for_volume([5, 6, 7], DataType::Float32);
        header.ndim = 4;
        assert_eq!(header.shape3(), Some([5, 6, 7]));

        header.dim[3] = 2;
        assert_eq!(header.shape3(), None);

        header.ndim = 2;
        assert_eq!(header.shape3(), None);
    }

    #[test]
    fn test_scaling_flags() {
        let mut header = NiftiHeader::default();
        assert!(!header.has_scaling());
        header.scl_slope = 0.0;
        assert!(!header.has_scaling());
        header.scl_slope = 2.0;
        assert!(header.has_scaling());
    }
}
