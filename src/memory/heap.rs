use crate::error::{NbinError, Result};
use crate::memory::{BaseAddress, ByteOrder, MemoryAllocation};

/// An allocation backed by an owned, zero-initialized buffer.
#[derive(Debug)]
pub struct HeapAllocation {
    buffer: Vec<u8>,
    base: BaseAddress,
    order: ByteOrder,
    released: bool,
}

impl HeapAllocation {
    /// A virtual, little-endian buffer of `len` bytes: the layout of the file
    /// instance region.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    /// Wraps existing bytes as a virtual, little-endian region.
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            base: BaseAddress::Virtual,
            order: ByteOrder::Little,
            released: false,
        }
    }

    /// A buffer that declares itself to live at `address`.
    ///
    /// Address 0 is the null pointer and is rejected.
    pub fn with_address(len: usize, address: u64) -> Result<Self> {
        if address == 0 {
            return Err(NbinError::ResourceState(
                "base address 0 is the null pointer".into(),
            ));
        }
        Ok(Self {
            base: BaseAddress::Real(address),
            ..Self::new(len)
        })
    }

    /// A native-order buffer whose base is its own address, like a direct
    /// buffer handed to native code.
    pub fn direct(len: usize) -> Self {
        let buffer = vec![0; len];
        let address = buffer.as_ptr() as u64;
        Self {
            buffer,
            base: BaseAddress::Real(address),
            order: ByteOrder::NATIVE,
            released: false,
        }
    }

    /// Overrides the byte order.
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Gives the bytes back.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl MemoryAllocation for HeapAllocation {
    fn base_address(&self) -> BaseAddress {
        self.base
    }

    fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn byte_order(&self) -> ByteOrder {
        self.order
    }

    fn bytes(&self) -> Result<&[u8]> {
        if self.released {
            return Err(NbinError::ResourceState("heap allocation released".into()));
        }
        Ok(&self.buffer)
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if self.released {
            return Err(NbinError::ResourceState("heap allocation released".into()));
        }
        Ok(&mut self.buffer)
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            log::debug!("releasing heap allocation of {} bytes", self.buffer.len());
            self.buffer = Vec::new();
            self.released = true;
        }
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent_and_final() -> Result<()> {
        let mut allocation = HeapAllocation::new(8);
        allocation.release()?;
        allocation.release()?;
        assert!(allocation.is_released());
        assert!(matches!(allocation.bytes(), Err(NbinError::ResourceState(_))));
        Ok(())
    }

    #[test]
    fn base_addresses() -> Result<()> {
        assert_eq!(HeapAllocation::new(4).base_address(), BaseAddress::Virtual);
        assert_eq!(
            HeapAllocation::with_address(4, 0x1000)?.base_address(),
            BaseAddress::Real(0x1000)
        );
        assert!(HeapAllocation::with_address(4, 0).is_err());
        let direct = HeapAllocation::direct(4);
        assert!(matches!(direct.base_address(), BaseAddress::Real(a) if a != 0));
        assert_eq!(direct.byte_order(), ByteOrder::NATIVE);
        Ok(())
    }
}
