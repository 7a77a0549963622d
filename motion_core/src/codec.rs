//! Binary wire and storage format for [`TimeSeries`].
//!
//! All multi-byte fields are little-endian:
//!
//! ```text
//! u8   magic        0x61
//! u8   version      0x64
//! u8   type count
//! u8   samples per second
//! f64  start
//! u32  sample count
//! [u8; 4] * type count      channel tags
//! f32  * sample count       row-major samples
//! ```
//!
//! This is the only on-disk and on-wire representation; archived recordings
//! depend on it staying byte-compatible.

use crate::channel::{ChannelType, TAG_LEN};
use crate::error::CodecError;
use crate::series::TimeSeries;
use crate::{Error, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const MAGIC: u8 = 0x61;
pub const VERSION: u8 = 0x64;

/// Size of the fixed part of the header
pub const HEADER_LEN: usize = 16;

/// Bounds-checked little-endian reader over a byte slice
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, count: usize) -> std::result::Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(count)
            .ok_or(CodecError::NotEnoughInput)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(CodecError::NotEnoughInput)?;
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> std::result::Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Consume one byte, failing with `error` when it differs from `value`
    pub fn expect_u8(
        &mut self,
        value: u8,
        error: CodecError,
    ) -> std::result::Result<(), CodecError> {
        if self.u8()? != value {
            return Err(error);
        }
        Ok(())
    }

    pub fn u32_le(&mut self) -> std::result::Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn f64_le(&mut self) -> std::result::Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn tag(&mut self) -> std::result::Result<[u8; TAG_LEN], CodecError> {
        self.array()
    }

    /// Read `count` consecutive f32 values
    pub fn f32s_le(&mut self, count: usize) -> std::result::Result<Vec<f32>, CodecError> {
        let len = count
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or(CodecError::NotEnoughInput)?;
        let bytes = self.take(len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Decode a series from its wire representation
pub fn decode(bytes: &[u8]) -> std::result::Result<TimeSeries, CodecError> {
    let mut reader = ByteReader::new(bytes);

    reader.expect_u8(MAGIC, CodecError::BadHeader)?;
    reader.expect_u8(VERSION, CodecError::BadHeader)?;
    let type_count = reader.u8()?;
    let samples_per_second = reader.u8()?;
    let start = reader.f64_le()?;
    let sample_count = reader.u32_le()?;

    let types = (0..type_count)
        .map(|_| {
            let tag = reader.tag()?;
            ChannelType::from_tag(tag).ok_or(CodecError::BadHeader)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let samples = reader.f32s_le(sample_count as usize)?;
    if reader.remaining() > 0 {
        tracing::debug!("Ignoring {} trailing bytes after samples", reader.remaining());
    }

    Ok(TimeSeries::new(types, start, samples_per_second, samples)?)
}

/// Stream the wire representation of `series` into `writer`
pub fn encode_to<W: Write>(series: &TimeSeries, writer: &mut W) -> std::io::Result<()> {
    let types = series.types();
    let samples = series.samples();
    let type_count = u8::try_from(types.len()).map_err(|_| too_large("channel types"))?;
    let sample_count = u32::try_from(samples.len()).map_err(|_| too_large("samples"))?;

    writer.write_all(&[MAGIC, VERSION, type_count, series.samples_per_second()])?;
    writer.write_all(&series.start().to_le_bytes())?;
    writer.write_all(&sample_count.to_le_bytes())?;
    for t in types {
        writer.write_all(&t.tag())?;
    }
    for s in samples {
        writer.write_all(&s.to_le_bytes())?;
    }
    Ok(())
}

fn too_large(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("too many {} for the recording header", what),
    )
}

/// Encode `series`; `decode(&encode(x)) == x` for every valid series
pub fn encode(series: &TimeSeries) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_LEN + series.types().len() * TAG_LEN + series.samples().len() * 4,
    );
    // Writing into a Vec cannot fail
    let _ = encode_to(series, &mut out);
    out
}

/// Load a recording from disk
pub fn read_recording(path: &Path) -> Result<TimeSeries> {
    let bytes = std::fs::read(path)?;
    let series = decode(&bytes)?;
    tracing::debug!(
        "Read {} rows ({:.1}s) from {:?}",
        series.row_count(),
        series.duration(),
        path
    );
    Ok(series)
}

/// Atomically write a recording to disk
pub fn write_recording(path: &Path, series: &TimeSeries) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = std::io::BufWriter::new(temp.as_file_mut());
        encode_to(series, &mut writer)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::debug!("Wrote {} rows to {:?}", series.row_count(), path);
    Ok(())
}
