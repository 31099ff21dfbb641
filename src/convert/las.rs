//! LAS/LAZ public header parsing.
//!
//! Only the fixed public header block and the first variable length record
//! header are read; point data is never touched. This is enough to report
//! point-cloud metadata and to recognise files that are already COPC.

use crate::model::PointCloudProperties;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const SIGNATURE: &[u8; 4] = b"LASF";

/// Size of the LAS 1.4 public header block.
pub const HEADER_SIZE_14: u16 = 375;

/// Size of the LAS 1.2 public header block.
pub const HEADER_SIZE_12: u16 = 227;

/// Size of a variable length record header.
pub const VLR_HEADER_SIZE: u64 = 54;

/// Point format id bit set by LASzip for compressed data.
const COMPRESSED_BIT: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum LasError {
    #[error("missing LASF signature")]
    NotLas,

    #[error("unsupported LAS version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("header size {0} is smaller than the public header block")]
    BadHeaderSize(u16),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Header of one variable length record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlrHeader {
    pub user_id: String,
    pub record_id: u16,
    pub record_length: u16,
}

/// Fields of the LAS public header block used by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LasHeader {
    pub version: (u8, u8),
    pub header_size: u16,
    pub offset_to_points: u32,
    pub vlr_count: u32,
    /// Point data format id with the compression bits masked off.
    pub point_format: u8,
    pub compressed: bool,
    pub point_record_length: u16,
    pub point_count: u64,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    /// `[min_x, min_y, min_z, max_x, max_y, max_z]`
    pub bounds: [f64; 6],
    pub first_vlr: Option<VlrHeader>,
}

impl LasHeader {
    pub fn read_from_path(path: &Path) -> Result<Self, LasError> {
        let file = File::open(path)?;
        Self::read_from(&mut BufReader::new(file))
    }

    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, LasError> {
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if &signature != SIGNATURE {
            return Err(LasError::NotLas);
        }

        reader.seek(SeekFrom::Start(24))?;
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        if major != 1 || minor > 4 {
            return Err(LasError::UnsupportedVersion(major, minor));
        }

        reader.seek(SeekFrom::Start(94))?;
        let header_size = reader.read_u16::<LittleEndian>()?;
        let min_size = if minor >= 4 { HEADER_SIZE_14 } else { HEADER_SIZE_12 };
        if header_size < min_size {
            return Err(LasError::BadHeaderSize(header_size));
        }
        let offset_to_points = reader.read_u32::<LittleEndian>()?;
        let vlr_count = reader.read_u32::<LittleEndian>()?;
        let raw_format = reader.read_u8()?;
        let point_record_length = reader.read_u16::<LittleEndian>()?;
        let legacy_count = reader.read_u32::<LittleEndian>()?;

        reader.seek(SeekFrom::Start(131))?;
        let scale = read_triplet(reader)?;
        let offset = read_triplet(reader)?;

        // Stored as max/min pairs per axis
        let mut extents = [0f64; 6];
        for value in extents.iter_mut() {
            *value = reader.read_f64::<LittleEndian>()?;
        }
        let bounds = [extents[1], extents[3], extents[5], extents[0], extents[2], extents[4]];

        let mut point_count = legacy_count as u64;
        if minor >= 4 {
            reader.seek(SeekFrom::Start(247))?;
            let count = reader.read_u64::<LittleEndian>()?;
            if count > 0 {
                point_count = count;
            }
        }

        let first_vlr = if vlr_count > 0 {
            reader.seek(SeekFrom::Start(header_size as u64))?;
            Some(read_vlr_header(reader)?)
        } else {
            None
        };

        Ok(Self {
            version: (major, minor),
            header_size,
            offset_to_points,
            vlr_count,
            point_format: raw_format & 0x3f,
            compressed: raw_format & COMPRESSED_BIT != 0,
            point_record_length,
            point_count,
            scale,
            offset,
            bounds,
            first_vlr,
        })
    }

    /// A COPC file is LAS 1.4 whose first VLR is the `copc` info record.
    pub fn is_copc(&self) -> bool {
        self.version == (1, 4)
            && self
                .first_vlr
                .as_ref()
                .is_some_and(|vlr| vlr.user_id == "copc" && vlr.record_id == 1)
    }

    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version.0, self.version.1)
    }

    pub fn properties(&self) -> PointCloudProperties {
        PointCloudProperties {
            las_version: self.version_string(),
            point_format: self.point_format,
            point_count: self.point_count,
            bounds: self.bounds,
            scale: self.scale,
            offset: self.offset,
            compressed: self.compressed,
            copc: self.is_copc(),
        }
    }
}

fn read_triplet<R: Read>(reader: &mut R) -> std::io::Result<[f64; 3]> {
    Ok([
        reader.read_f64::<LittleEndian>()?,
        reader.read_f64::<LittleEndian>()?,
        reader.read_f64::<LittleEndian>()?,
    ])
}

fn read_vlr_header<R: Read>(reader: &mut R) -> std::io::Result<VlrHeader> {
    let _reserved = reader.read_u16::<LittleEndian>()?;
    let mut user_id = [0u8; 16];
    reader.read_exact(&mut user_id)?;
    let record_id = reader.read_u16::<LittleEndian>()?;
    let record_length = reader.read_u16::<LittleEndian>()?;
    let mut description = [0u8; 32];
    reader.read_exact(&mut description)?;

    let end = user_id.iter().position(|&b| b == 0).unwrap_or(user_id.len());
    Ok(VlrHeader {
        user_id: String::from_utf8_lossy(&user_id[..end]).into_owned(),
        record_id,
        record_length,
    })
}
