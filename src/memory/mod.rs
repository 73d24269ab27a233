//! The memory capability contract.
//!
//! The engine never touches a concrete buffer type. It asks a
//! [`MemoryAllocation`] for byte windows ([`MemorySlice`] /
//! [`MemorySliceMut`]) and reads or writes typed values through them, in the
//! allocation's declared [`ByteOrder`]. Two backends are provided:
//! [`HeapAllocation`] (an owned buffer) and [`MappedAllocation`] (a
//! memory-mapped file region).
//!
//! ## Addresses
//!
//! An allocation is either at a real address (native memory, a direct
//! buffer) or *virtual* (a file region, a buffer that will be shipped
//! elsewhere). See [`BaseAddress`] for how instance addresses are encoded in
//! each case.

use std::fmt;

use crate::error::{NbinError, Result};

/// Defines the `HeapAllocation` backend.
pub mod heap;
/// Defines the `MappedAllocation` backend.
pub mod mapped;

pub use heap::HeapAllocation;
pub use mapped::MappedAllocation;

/// The virtual origin of a root allocation: offset 0 is encoded as address 1,
/// so that address 0 always stays the null pointer.
pub const VIRTUAL_ORIGIN: u64 = 1;

/// Byte order of the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// The byte order of the running platform.
    pub const NATIVE: ByteOrder = if cfg!(target_endian = "little") {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    };
}

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseAddress {
    /// A real memory address: an instance at offset `o` is at `base + o`.
    Real(u64),
    /// No real address. Addresses are assigned by the owning
    /// [`InstanceSet`](crate::instances::InstanceSet), starting at
    /// [`VIRTUAL_ORIGIN`] for a root set.
    Virtual,
}

impl BaseAddress {
    /// True for [`BaseAddress::Virtual`].
    pub fn is_virtual(self) -> bool {
        matches!(self, Self::Virtual)
    }
}

impl fmt::Display for BaseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(address) => write!(f, "{address:#x}"),
            Self::Virtual => f.write_str("virtual"),
        }
    }
}

/// An addressable byte region of known size that owns its backing resource.
pub trait MemoryAllocation: fmt::Debug {
    /// Where the region lives.
    fn base_address(&self) -> BaseAddress;

    /// Region size in bytes.
    fn len(&self) -> u64;

    /// True if the region has no byte.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte order used by the typed accessors of this region's slices.
    fn byte_order(&self) -> ByteOrder;

    /// The whole region. Fails once released.
    fn bytes(&self) -> Result<&[u8]>;

    /// The whole region, writable. Fails once released, or if the region is read-only.
    fn bytes_mut(&mut self) -> Result<&mut [u8]>;

    /// Frees the backing resource. Calling it again is a no-op.
    fn release(&mut self) -> Result<()>;

    /// True once [`release`](Self::release) ran.
    fn is_released(&self) -> bool;

    /// A read window of `size` bytes at `offset`.
    fn slice(&self, offset: u64, size: u32) -> Result<MemorySlice<'_>> {
        let order = self.byte_order();
        let bytes = window(self.bytes()?, offset, size)?;
        Ok(MemorySlice::new(bytes, order))
    }

    /// A write window of `size` bytes at `offset`.
    fn slice_mut(&mut self, offset: u64, size: u32) -> Result<MemorySliceMut<'_>> {
        let order = self.byte_order();
        let bytes = window_mut(self.bytes_mut()?, offset, size)?;
        Ok(MemorySliceMut::new(bytes, order))
    }
}

impl<A: MemoryAllocation + ?Sized> MemoryAllocation for Box<A> {
    fn base_address(&self) -> BaseAddress {
        self.as_ref().base_address()
    }

    fn len(&self) -> u64 {
        self.as_ref().len()
    }

    fn byte_order(&self) -> ByteOrder {
        self.as_ref().byte_order()
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.as_ref().bytes()
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.as_mut().bytes_mut()
    }

    fn release(&mut self) -> Result<()> {
        self.as_mut().release()
    }

    fn is_released(&self) -> bool {
        self.as_ref().is_released()
    }
}

fn bounds(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let out_of_bounds = || {
        NbinError::Format(format!(
            "slice [{offset}, +{size}) out of bounds of {len} bytes"
        ))
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let size = usize::try_from(size).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(size).ok_or_else(out_of_bounds)?;
    if end > len {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}

fn window(bytes: &[u8], offset: u64, size: u32) -> Result<&[u8]> {
    let range = bounds(offset, u64::from(size), bytes.len())?;
    Ok(&bytes[range])
}

fn window_mut(bytes: &mut [u8], offset: u64, size: u32) -> Result<&mut [u8]> {
    let range = bounds(offset, u64::from(size), bytes.len())?;
    Ok(&mut bytes[range])
}

/// Read access to a byte window.
#[derive(Debug, Clone, Copy)]
pub struct MemorySlice<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

/// Read/write access to a byte window.
#[derive(Debug)]
pub struct MemorySliceMut<'a> {
    bytes: &'a mut [u8],
    order: ByteOrder,
}

impl<'a> MemorySlice<'a> {
    /// Wraps raw bytes.
    pub fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    /// Window size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty window.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte order of the typed accessors.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn field<const N: usize>(&self, offset: u32) -> Result<[u8; N]> {
        let range = bounds(u64::from(offset), N as u64, self.bytes.len())?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.bytes[range]);
        Ok(raw)
    }

    /// Reads a `boolean` (any non-zero byte is `true`).
    pub fn read_bool(&self, offset: u32) -> Result<bool> {
        Ok(self.read_i8(offset)? != 0)
    }

    /// Reads `out.len()` booleans starting at `offset`.
    pub fn read_bools(&self, offset: u32, out: &mut [bool]) -> Result<()> {
        let range = bounds(u64::from(offset), out.len() as u64, self.bytes.len())?;
        for (dst, src) in out.iter_mut().zip(&self.bytes[range]) {
            *dst = *src != 0;
        }
        Ok(())
    }
}

impl<'a> MemorySliceMut<'a> {
    /// Wraps raw bytes.
    pub fn new(bytes: &'a mut [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    /// Window size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty window.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte order of the typed accessors.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// A read view of the same window.
    pub fn as_slice(&self) -> MemorySlice<'_> {
        MemorySlice::new(self.bytes, self.order)
    }

    fn put<const N: usize>(&mut self, offset: u32, raw: [u8; N]) -> Result<()> {
        let range = bounds(u64::from(offset), N as u64, self.bytes.len())?;
        self.bytes[range].copy_from_slice(&raw);
        Ok(())
    }

    /// Writes a `boolean` as one byte, 0 or 1.
    pub fn write_bool(&mut self, offset: u32, value: bool) -> Result<()> {
        self.write_i8(offset, i8::from(value))
    }

    /// Writes booleans as consecutive bytes starting at `offset`.
    pub fn write_bools(&mut self, offset: u32, values: &[bool]) -> Result<()> {
        let range = bounds(u64::from(offset), values.len() as u64, self.bytes.len())?;
        for (dst, src) in self.bytes[range].iter_mut().zip(values) {
            *dst = u8::from(*src);
        }
        Ok(())
    }
}

macro_rules! typed_access {
    ($($ty:ty => $read:ident, $reads:ident, $write:ident, $writes:ident;)*) => {
        impl MemorySlice<'_> {
            $(
                #[doc = concat!("Reads one `", stringify!($ty), "` at `offset`.")]
                pub fn $read(&self, offset: u32) -> Result<$ty> {
                    let raw = self.field::<{ std::mem::size_of::<$ty>() }>(offset)?;
                    Ok(match self.order {
                        ByteOrder::Little => <$ty>::from_le_bytes(raw),
                        ByteOrder::Big => <$ty>::from_be_bytes(raw),
                    })
                }

                #[doc = concat!("Reads `out.len()` consecutive `", stringify!($ty), "` starting at `offset`.")]
                pub fn $reads(&self, offset: u32, out: &mut [$ty]) -> Result<()> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let total = (out.len() * WIDTH) as u64;
                    let range = bounds(u64::from(offset), total, self.bytes.len())?;
                    for (dst, chunk) in out.iter_mut().zip(self.bytes[range].chunks_exact(WIDTH)) {
                        let mut raw = [0u8; WIDTH];
                        raw.copy_from_slice(chunk);
                        *dst = match self.order {
                            ByteOrder::Little => <$ty>::from_le_bytes(raw),
                            ByteOrder::Big => <$ty>::from_be_bytes(raw),
                        };
                    }
                    Ok(())
                }
            )*
        }

        impl MemorySliceMut<'_> {
            $(
                #[doc = concat!("Writes one `", stringify!($ty), "` at `offset`.")]
                pub fn $write(&mut self, offset: u32, value: $ty) -> Result<()> {
                    let raw = match self.order {
                        ByteOrder::Little => value.to_le_bytes(),
                        ByteOrder::Big => value.to_be_bytes(),
                    };
                    self.put(offset, raw)
                }

                #[doc = concat!("Writes consecutive `", stringify!($ty), "` starting at `offset`.")]
                pub fn $writes(&mut self, offset: u32, values: &[$ty]) -> Result<()> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let total = (values.len() * WIDTH) as u64;
                    let range = bounds(u64::from(offset), total, self.bytes.len())?;
                    for (chunk, value) in self.bytes[range].chunks_exact_mut(WIDTH).zip(values) {
                        let raw = match self.order {
                            ByteOrder::Little => value.to_le_bytes(),
                            ByteOrder::Big => value.to_be_bytes(),
                        };
                        chunk.copy_from_slice(&raw);
                    }
                    Ok(())
                }
            )*
        }
    };
}

typed_access! {
    i8 => read_i8, read_i8s, write_i8, write_i8s;
    i16 => read_i16, read_i16s, write_i16, write_i16s;
    i32 => read_i32, read_i32s, write_i32, write_i32s;
    i64 => read_i64, read_i64s, write_i64, write_i64s;
    u64 => read_u64, read_u64s, write_u64, write_u64s;
    f32 => read_f32, read_f32s, write_f32, write_f32s;
    f64 => read_f64, read_f64s, write_f64, write_f64s;
}
