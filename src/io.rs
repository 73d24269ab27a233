//! Low-level I/O: an offset-tracking little-endian writer and a
//! bounds-checked little-endian decoder.
//!
//! Every number in the header, type table and layout table of an nbin file
//! is little-endian. A short read is always an [`NbinError::UnexpectedEof`].

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{NbinError, Result};

/// A buffered writer that tracks the current offset.
#[derive(Debug)]
pub struct SeqWriter<W: Write> {
    writer: BufWriter<W>,
    current_offset: u64,
}

impl SeqWriter<File> {
    /// Creates (or truncates) `path` for reading and writing: the instance
    /// region is mapped read-write after the tables are written.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> SeqWriter<W> {
    /// Wraps a writer. Offsets start at 0.
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
            current_offset: 0,
        }
    }

    /// Writes a complete buffer. Returns the offset where the writing started.
    pub fn write_all(&mut self, buffer: &[u8]) -> Result<u64> {
        let start_offset = self.current_offset;
        self.writer.write_all(buffer)?;
        self.current_offset += buffer.len() as u64;
        Ok(start_offset)
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> Result<u64> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) -> Result<u64> {
        self.write_all(&value.to_le_bytes())
    }

    /// Flushes the buffer to the inner writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the current cursor position.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Flushes and gives the inner writer back.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| NbinError::from(e.into_error()))
    }
}

/// Appends little-endian values to an in-memory record.
pub(crate) trait PutLe {
    fn put_u8(&mut self, value: u8);
    fn put_i32(&mut self, value: i32);
    fn put_i64(&mut self, value: i64);
    fn put_str(&mut self, value: &str) -> Result<()>;
}

impl PutLe for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_i32(&mut self, value: i32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put_str(&mut self, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| NbinError::Format(format!("string of {} bytes", value.len())))?;
        self.put_i32(len);
        self.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Sequential little-endian decoder over any reader.
#[derive(Debug)]
pub struct ByteReader<R: Read> {
    inner: R,
    position: u64,
}

impl<R: Read> ByteReader<R> {
    /// Wraps a reader. Positions start at 0.
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fills `buf` completely, or fails with [`NbinError::UnexpectedEof`].
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| match NbinError::from(e) {
            NbinError::UnexpectedEof(_) => NbinError::UnexpectedEof(format!(
                "{} bytes needed at offset {}",
                buf.len(),
                self.position
            )),
            other => other,
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut raw = [0u8; N];
        self.read_exact(&mut raw)?;
        Ok(raw)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Reads a non-negative `i32` count or length.
    pub fn read_len(&mut self, what: &str) -> Result<usize> {
        let value = self.read_i32()?;
        usize::try_from(value)
            .map_err(|_| NbinError::Format(format!("negative {what}: {value}")))
    }

    /// Reads `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if read < len {
            return Err(NbinError::UnexpectedEof(format!(
                "{len} bytes needed at offset {}, {read} available",
                self.position
            )));
        }
        self.position += len as u64;
        Ok(buf)
    }

    /// Reads an `i32`-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_len("string length")?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| NbinError::Format(format!("invalid UTF-8: {e}")))
    }

    /// Gives the reader back.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_tracks_offsets() -> Result<()> {
        let mut writer = SeqWriter::new(Vec::new());
        assert_eq!(writer.write_all(b"NBIN")?, 0);
        assert_eq!(writer.write_i32(-3)?, 4);
        assert_eq!(writer.write_i64(1)?, 8);
        assert_eq!(writer.current_offset(), 16);
        let bytes = writer.into_inner()?;
        assert_eq!(&bytes[4..8], &[0xfd, 0xff, 0xff, 0xff]);
        Ok(())
    }

    #[test]
    fn reader_decodes_and_detects_truncation() -> Result<()> {
        let mut record = Vec::new();
        record.put_i32(7);
        record.put_str("héllo")?;
        record.put_u8(2);

        let mut reader = ByteReader::new(&record[..]);
        assert_eq!(reader.read_i32()?, 7);
        assert_eq!(reader.read_str()?, "héllo");
        assert_eq!(reader.read_u8()?, 2);
        assert_eq!(reader.position(), record.len() as u64);
        assert!(matches!(reader.read_i64(), Err(NbinError::UnexpectedEof(_))));

        let mut short = ByteReader::new(&record[..6]);
        short.read_i32()?;
        assert!(matches!(short.read_str(), Err(NbinError::UnexpectedEof(_))));
        Ok(())
    }
}
