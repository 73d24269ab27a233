use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{NbinError, Result};
use crate::memory::{BaseAddress, ByteOrder, MemoryAllocation};

#[derive(Debug)]
enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A memory-mapped file region. Always virtual and little-endian: this is
/// the instance region of an nbin file.
#[derive(Debug)]
pub struct MappedAllocation {
    mapping: Option<Mapping>,
    offset: u64,
    len: u64,
}

impl MappedAllocation {
    /// Maps `len` bytes of `file` at `offset` read-write, growing the file if needed.
    pub fn create(file: &File, offset: u64, len: u64) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| NbinError::Format("mapped region overflows".into()))?;
        if file.metadata()?.len() < end {
            file.set_len(end)?;
        }
        let map_len = usize::try_from(len)
            .map_err(|_| NbinError::Format(format!("region of {len} bytes is not mappable")))?;

        // Safety: the file was just created by this process and is not shared.
        // External modification while mapped is outside of our control.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().offset(offset).len(map_len).map_mut(file)? };

        log::debug!("mapped {len} bytes read-write at file offset {offset}");
        Ok(Self {
            mapping: Some(Mapping::ReadWrite(map)),
            offset,
            len,
        })
    }

    /// Maps `len` bytes of `file` at `offset` read-only.
    pub fn open(file: &File, offset: u64, len: u64) -> Result<Self> {
        let file_len = file.metadata()?.len();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| NbinError::Format("mapped region overflows".into()))?;
        if file_len < end {
            return Err(NbinError::UnexpectedEof(format!(
                "instance region needs {end} bytes, file has {file_len}"
            )));
        }
        let map_len = usize::try_from(len)
            .map_err(|_| NbinError::Format(format!("region of {len} bytes is not mappable")))?;

        // Safety: Mmap is fundamentally unsafe as external processes could modify the file.
        // We assume exclusive access for the lifetime of the allocation.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().offset(offset).len(map_len).map(file)? };

        log::debug!("mapped {len} bytes read-only at file offset {offset}");
        Ok(Self {
            mapping: Some(Mapping::ReadOnly(map)),
            offset,
            len,
        })
    }

    /// Opens `path` and maps `len` bytes at `offset` read-only.
    pub fn open_path<P: AsRef<Path>>(path: P, offset: u64, len: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::open(&file, offset, len)
    }

    /// File offset of the region.
    pub fn file_offset(&self) -> u64 {
        self.offset
    }

    /// True if the mapping accepts writes.
    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Some(Mapping::ReadWrite(_)))
    }

    /// Flushes pending writes of a read-write mapping to the file.
    pub fn flush(&self) -> Result<()> {
        if let Some(Mapping::ReadWrite(map)) = &self.mapping {
            map.flush()?;
        }
        Ok(())
    }
}

impl MemoryAllocation for MappedAllocation {
    fn base_address(&self) -> BaseAddress {
        BaseAddress::Virtual
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::Little
    }

    fn bytes(&self) -> Result<&[u8]> {
        match &self.mapping {
            Some(Mapping::ReadWrite(map)) => Ok(&map[..]),
            Some(Mapping::ReadOnly(map)) => Ok(&map[..]),
            None => Err(NbinError::ResourceState("mapped allocation released".into())),
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.mapping {
            Some(Mapping::ReadWrite(map)) => Ok(&mut map[..]),
            Some(Mapping::ReadOnly(_)) => Err(NbinError::ResourceState(
                "mapped allocation is read-only".into(),
            )),
            None => Err(NbinError::ResourceState("mapped allocation released".into())),
        }
    }

    fn release(&mut self) -> Result<()> {
        match self.mapping.take() {
            Some(Mapping::ReadWrite(map)) => {
                map.flush()?;
                log::debug!("unmapped {} bytes at file offset {}", self.len, self.offset);
            }
            Some(Mapping::ReadOnly(_)) => {
                log::debug!("unmapped {} bytes at file offset {}", self.len, self.offset);
            }
            None => {}
        }
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.mapping.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn write_then_read_back() -> Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(b"HEAD")?;

        let mut region = MappedAllocation::create(&file, 4, 16)?;
        region.slice_mut(8, 8)?.write_i64(0, -5)?;
        region.release()?;
        region.release()?;

        let region = MappedAllocation::open(&file, 4, 16)?;
        assert_eq!(region.slice(8, 8)?.read_i64(0)?, -5);
        assert!(!region.is_writable());
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> Result<()> {
        let file = tempfile::tempfile()?;
        file.set_len(8)?;
        let mut region = MappedAllocation::open(&file, 0, 8)?;
        assert!(matches!(
            region.slice_mut(0, 4),
            Err(NbinError::ResourceState(_))
        ));
        Ok(())
    }

    #[test]
    fn short_file_is_eof() -> Result<()> {
        let file = tempfile::tempfile()?;
        file.set_len(4)?;
        assert!(matches!(
            MappedAllocation::open(&file, 0, 8),
            Err(NbinError::UnexpectedEof(_))
        ));
        Ok(())
    }
}
