use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    /// The requested range lies outside the backing store.
    #[error("guest memory access out of range: offset=0x{offset:x} len={len} size=0x{size:x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("guest memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Byte-addressable storage owned by a device model and exposed to the physical address space
/// through [`crate::PhysicalAddressSpace::map_memory_region`].
///
/// Offsets are region-relative and `u64` so that a region may span the whole 4 GiB bus.
pub trait GuestMemory {
    fn size(&self) -> u64;

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn write_from(&mut self, offset: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Zero `len` bytes starting at `offset`.
    fn clear_range(&mut self, offset: u64, len: usize) -> GuestMemoryResult<()> {
        self.write_from(offset, &vec![0u8; len])
    }

    fn read_u8_le(&self, offset: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&self, offset: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, offset: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, offset: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8_le(&mut self, offset: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(offset, &[value])
    }

    fn write_u16_le(&mut self, offset: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, offset: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, offset: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }
}

/// Device-owned region shared with the address space's alias wrappers.
pub type SharedGuestMemory = Rc<RefCell<dyn GuestMemory>>;

pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> GuestMemoryResult<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(GuestMemoryError::OutOfRange { offset, len, size })?;
    if end > size {
        return Err(GuestMemoryError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// Contiguous heap-backed region, the usual backing store for framebuffers and option ROM
/// shadows.
#[derive(Debug, Clone)]
pub struct DenseMemory {
    data: Box<[u8]>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let size_usize =
            usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            data: vec![0u8; size_usize].into_boxed_slice(),
        })
    }

    /// Wrap `self` for sharing with [`crate::PhysicalAddressSpace::map_memory_region`].
    pub fn into_shared(self) -> SharedGuestMemory {
        Rc::new(RefCell::new(self))
    }

    #[inline]
    fn range_to_usize(&self, offset: u64, len: usize) -> GuestMemoryResult<(usize, usize)> {
        check_range(self.size(), offset, len)?;
        // `check_range` bounds `offset + len` by the slice length, so both fit in usize.
        let start = offset as usize;
        Ok((start, start + len))
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let (start, end) = self.range_to_usize(offset, dst.len())?;
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_from(&mut self, offset: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let (start, end) = self.range_to_usize(offset, src.len())?;
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn clear_range(&mut self, offset: u64, len: usize) -> GuestMemoryResult<()> {
        let (start, end) = self.range_to_usize(offset, len)?;
        self.data[start..end].fill(0);
        Ok(())
    }
}
