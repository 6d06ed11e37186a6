//! Binary-format engine for Final Fantasy VII field assets: the LZS
//! compression codec, LGP archive containers, field-file section tables
//! and the PlayStation background compositor.
//!
//! This crate only decodes and re-encodes bytes; it never logs, prints or
//! reads process-wide configuration. Editor front ends consume the decoded
//! data and push edited sections back through [`field::FieldFile::save`].

use thiserror::Error;

pub mod background;
pub mod field;
pub mod lgp;
pub mod lzs;
pub mod palette;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("declared compressed size {declared} + 4 does not match file length {actual}")]
    SizeMismatch { declared: u32, actual: u64 },
    #[error("corrupt LZS stream: {0}")]
    CorruptStream(String),
    #[error("section data out of range: {0}")]
    TruncatedSection(String),
    #[error("tile references palette {index} but only {loaded} palettes are loaded")]
    PaletteIndexOutOfRange { index: u16, loaded: usize },
    #[error("archive conflict table exceeds {} entries", lgp::MAX_CONFLICTS)]
    ConflictTableOverflow,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn u16_le(data: &[u8], pos: usize) -> Result<u16> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(Error::TruncatedSection(format!(
            "u16 read at {} exceeds buffer of {} bytes",
            pos,
            data.len()
        ))),
    }
}

pub(crate) fn i16_le(data: &[u8], pos: usize) -> Result<i16> {
    Ok(u16_le(data, pos)? as i16)
}

pub(crate) fn u32_le(data: &[u8], pos: usize) -> Result<u32> {
    match data.get(pos..pos + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(Error::TruncatedSection(format!(
            "u32 read at {} exceeds buffer of {} bytes",
            pos,
            data.len()
        ))),
    }
}
