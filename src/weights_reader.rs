//! Darknet .weights stream reader
//!
//! The file has no shape metadata: a small version header followed by raw
//! little-endian f32 spans whose lengths come entirely from the cfg graph.
//! Reads are strictly sequential and sized exactly to each requested span.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;
use serde::Serialize;

use crate::batch_norm::NormParams;
use crate::error::StreamError;

/// Version header at the start of every weights file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WeightsHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    /// Images seen during training.
    pub seen: i64,
}

impl WeightsHeader {
    /// Versions from 0.2 on store `seen` as 64 bits.
    pub fn has_wide_seen(major: i32, minor: i32) -> bool {
        i64::from(major) * 10 + i64::from(minor) >= 2
    }

    /// Size of this header on disk.
    pub fn encoded_len(&self) -> u64 {
        if Self::has_wide_seen(self.major, self.minor) {
            3 * 4 + 8
        } else {
            3 * 4 + 4
        }
    }
}

/// Raw payload of one convolution layer, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightBlock {
    pub biases: Vec<f32>,
    pub norm: Option<NormParams>,
    pub weights: Vec<f32>,
}

/// Sequential little-endian reader that tracks its byte position.
pub struct WeightsReader<R> {
    inner: R,
    bytes_read: u64,
}

impl WeightsReader<File> {
    /// Open a weights file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StreamError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("opened weights file {}", path.display());
        Ok(Self::new(file))
    }
}

impl<R: Read> WeightsReader<R> {
    /// Wrap an already open stream positioned at the header.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Bytes consumed so far, header included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn read_i32(&mut self) -> Result<i32, StreamError> {
        let value = self
            .inner
            .read_i32::<LittleEndian>()
            .map_err(|e| self.header_error(e))?;
        self.bytes_read += 4;
        Ok(value)
    }

    fn header_error(&self, e: io::Error) -> StreamError {
        if e.kind() == ErrorKind::UnexpectedEof {
            StreamError::TruncatedHeader {
                bytes_read: self.bytes_read,
            }
        } else {
            StreamError::Io(e)
        }
    }

    /// Read the version header and the images-seen counter.
    pub fn read_header(&mut self) -> Result<WeightsHeader, StreamError> {
        let major = self.read_i32()?;
        let minor = self.read_i32()?;
        let revision = self.read_i32()?;

        let seen = if WeightsHeader::has_wide_seen(major, minor) {
            let seen = self
                .inner
                .read_i64::<LittleEndian>()
                .map_err(|e| self.header_error(e))?;
            self.bytes_read += 8;
            seen
        } else {
            i64::from(self.read_i32()?)
        };

        let header = WeightsHeader {
            major,
            minor,
            revision,
            seen,
        };
        debug!(
            "weights version {}.{}.{}, {} images seen",
            major, minor, revision, seen
        );
        Ok(header)
    }

    /// Reads exactly `count` floats or fails with `ShortRead`. The buffer
    /// grows with the data actually read, not with `count`.
    pub fn read_floats(&mut self, count: usize) -> Result<Vec<f32>, StreamError> {
        let byte_len = count
            .checked_mul(4)
            .ok_or(StreamError::Oversized(count))?;

        let mut bytes = Vec::new();
        self.inner
            .by_ref()
            .take(byte_len as u64)
            .read_to_end(&mut bytes)?;

        if bytes.len() != byte_len {
            return Err(StreamError::ShortRead {
                offset: self.bytes_read,
                requested: count,
                available: bytes.len() / 4,
            });
        }

        let mut values = vec![0.0f32; count];
        LittleEndian::read_f32_into(&bytes, &mut values);
        self.bytes_read += byte_len as u64;
        Ok(values)
    }

    /// True when at least one byte remains after everything consumed so far.
    pub fn has_trailing_data(&mut self) -> Result<bool, StreamError> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn header_bytes(major: i32, minor: i32, wide: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_i32::<LittleEndian>(major).unwrap();
        buf.write_i32::<LittleEndian>(minor).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap();
        if wide {
            buf.write_i64::<LittleEndian>(1 << 40).unwrap();
        } else {
            buf.write_i32::<LittleEndian>(12345).unwrap();
        }
        buf
    }

    #[test]
    fn wide_seen_counter() {
        let mut reader = WeightsReader::new(Cursor::new(header_bytes(0, 2, true)));
        let header = reader.read_header().unwrap();
        assert_eq!(header.seen, 1 << 40);
        assert_eq!(reader.bytes_read(), 20);
        assert_eq!(header.encoded_len(), 20);
    }

    #[test]
    fn narrow_seen_counter() {
        let mut reader = WeightsReader::new(Cursor::new(header_bytes(0, 1, false)));
        let header = reader.read_header().unwrap();
        assert_eq!(header.seen, 12345);
        assert_eq!(reader.bytes_read(), 16);
        assert!(!reader.has_trailing_data().unwrap());
    }

    #[test]
    fn major_version_one_is_wide() {
        assert!(WeightsHeader::has_wide_seen(1, 0));
        assert!(!WeightsHeader::has_wide_seen(0, 1));
    }

    #[test]
    fn extreme_versions_do_not_overflow() {
        assert!(WeightsHeader::has_wide_seen(i32::MAX, i32::MAX));
        assert!(!WeightsHeader::has_wide_seen(i32::MIN, 0));

        let mut reader = WeightsReader::new(Cursor::new(header_bytes(i32::MAX, 0, true)));
        let header = reader.read_header().unwrap();
        assert_eq!(header.major, i32::MAX);
        assert_eq!(reader.bytes_read(), 20);
    }

    #[test]
    fn huge_request_on_short_stream() {
        let mut reader = WeightsReader::new(Cursor::new(vec![0u8; 6]));
        match reader.read_floats(1 << 59) {
            Err(StreamError::ShortRead { offset, requested, available }) => {
                assert_eq!(offset, 0);
                assert_eq!(requested, 1 << 59);
                assert_eq!(available, 1);
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn truncated_header() {
        let mut bytes = header_bytes(0, 2, true);
        bytes.truncate(14);
        let mut reader = WeightsReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_header(),
            Err(StreamError::TruncatedHeader { bytes_read: 12 })
        ));
    }

    #[test]
    fn reads_little_endian_floats() {
        let mut bytes = Vec::new();
        for v in [1.5f32, -2.25, 0.0, 3.0e-7] {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
        let mut reader = WeightsReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_floats(3).unwrap(), [1.5, -2.25, 0.0]);
        assert_eq!(reader.read_floats(1).unwrap(), [3.0e-7]);
        assert_eq!(reader.read_floats(0).unwrap(), Vec::<f32>::new());
        assert_eq!(reader.bytes_read(), 16);
    }

    #[test]
    fn short_read_reports_position() {
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
        bytes.push(0xff);
        let mut reader = WeightsReader::new(Cursor::new(bytes));
        reader.read_floats(1).unwrap();
        match reader.read_floats(4) {
            Err(StreamError::ShortRead { offset, requested, available }) => {
                assert_eq!(offset, 4);
                assert_eq!(requested, 4);
                assert_eq!(available, 2);
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }
}
