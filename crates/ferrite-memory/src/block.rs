use std::fmt;

use tracing::trace;

use crate::phys::{GuestMemory, SharedGuestMemory};

pub const BLOCK_SHIFT: u32 = 12;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;
pub const BLOCK_MASK: u32 = (BLOCK_SIZE as u32) - 1;

/// Position of a block in the address space's block arena.
///
/// Slot 0 is permanently the unconnected sentinel, so an index lookup can never produce a
/// missing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub const UNCONNECTED: BlockId = BlockId(0);

    pub fn is_unconnected(self) -> bool {
        self == Self::UNCONNECTED
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Unconnected,
    Ram,
    Rom,
    Mapped,
    Code,
}

impl BlockKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            BlockKind::Unconnected => 0,
            BlockKind::Ram => 1,
            BlockKind::Rom => 2,
            BlockKind::Mapped => 3,
            BlockKind::Code => 4,
        }
    }
}

/// Forwards every access to a device-owned region at `base + offset`.
#[derive(Clone)]
pub struct MapWrapper {
    pub(crate) region: usize,
    pub(crate) memory: SharedGuestMemory,
    pub(crate) base: u64,
}

impl MapWrapper {
    /// Registration index of the region this wrapper aliases.
    pub fn region(&self) -> usize {
        self.region
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl fmt::Debug for MapWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapWrapper")
            .field("region", &self.region)
            .field("base", &format_args!("{:#x}", self.base))
            .finish_non_exhaustive()
    }
}

/// Page that tracks decoded code. Storage is only allocated on the first write; until then it
/// reads as zero.
#[derive(Debug, Clone, Default)]
pub struct CodePage {
    data: Option<Box<[u8]>>,
}

impl CodePage {
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    fn storage(&mut self) -> &mut [u8] {
        self.data
            .get_or_insert_with(|| vec![0u8; BLOCK_SIZE].into_boxed_slice())
    }
}

/// One 4 KiB unit of the physical bus.
#[derive(Debug, Clone)]
pub enum MemoryBlock {
    /// Open bus: reads float high, writes vanish.
    Unconnected,
    Ram(Box<[u8]>),
    Rom(Box<[u8]>),
    Mapped(MapWrapper),
    Code(CodePage),
}

impl MemoryBlock {
    /// Zeroed RAM page.
    pub fn ram() -> Self {
        MemoryBlock::Ram(vec![0u8; BLOCK_SIZE].into_boxed_slice())
    }

    pub fn ram_from(bytes: impl Into<Box<[u8]>>) -> Self {
        MemoryBlock::Ram(bytes.into())
    }

    pub fn rom(bytes: impl Into<Box<[u8]>>) -> Self {
        MemoryBlock::Rom(bytes.into())
    }

    pub fn lazy_code() -> Self {
        MemoryBlock::Code(CodePage::default())
    }

    pub(crate) fn mapped(region: usize, memory: SharedGuestMemory, base: u64) -> Self {
        MemoryBlock::Mapped(MapWrapper {
            region,
            memory,
            base,
        })
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            MemoryBlock::Unconnected => BlockKind::Unconnected,
            MemoryBlock::Ram(_) => BlockKind::Ram,
            MemoryBlock::Rom(_) => BlockKind::Rom,
            MemoryBlock::Mapped(_) => BlockKind::Mapped,
            MemoryBlock::Code(_) => BlockKind::Code,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            MemoryBlock::Ram(data) | MemoryBlock::Rom(data) => data.len(),
            MemoryBlock::Unconnected | MemoryBlock::Mapped(_) | MemoryBlock::Code(_) => BLOCK_SIZE,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, MemoryBlock::Unconnected)
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the block. Bytes past the end of the
    /// block's storage read as `0xFF`.
    pub fn copy_from(&self, offset: usize, dst: &mut [u8]) {
        match self {
            MemoryBlock::Unconnected => dst.fill(0xFF),
            MemoryBlock::Ram(data) | MemoryBlock::Rom(data) => {
                copy_out(data, offset, dst);
            }
            MemoryBlock::Code(page) => match &page.data {
                Some(data) => copy_out(data, offset, dst),
                None => dst.fill(0),
            },
            MemoryBlock::Mapped(wrapper) => {
                let result = wrapper
                    .memory
                    .borrow()
                    .read_into(wrapper.base + offset as u64, dst);
                if let Err(err) = result {
                    trace!(%err, "mapped read past end of region");
                    dst.fill(0xFF);
                }
            }
        }
    }

    /// Copy `src` into the block starting at `offset`. ROM and the sentinel drop the write.
    pub fn copy_into(&mut self, offset: usize, src: &[u8]) {
        match self {
            MemoryBlock::Unconnected => trace!(offset, len = src.len(), "write to unconnected block"),
            MemoryBlock::Rom(_) => trace!(offset, len = src.len(), "write to rom block ignored"),
            MemoryBlock::Ram(data) => copy_in(data, offset, src),
            MemoryBlock::Code(page) => copy_in(page.storage(), offset, src),
            MemoryBlock::Mapped(wrapper) => {
                let result = wrapper
                    .memory
                    .borrow_mut()
                    .write_from(wrapper.base + offset as u64, src);
                if let Err(err) = result {
                    trace!(%err, "mapped write past end of region");
                }
            }
        }
    }

    pub fn clear(&mut self) {
        let size = self.size();
        self.clear_range(0, size);
    }

    pub fn clear_range(&mut self, offset: usize, len: usize) {
        match self {
            MemoryBlock::Unconnected | MemoryBlock::Rom(_) => {}
            MemoryBlock::Ram(data) => {
                if let Some(range) = data.get_mut(offset..offset.saturating_add(len)) {
                    range.fill(0);
                }
            }
            MemoryBlock::Code(page) => {
                if offset == 0 && len >= BLOCK_SIZE {
                    page.data = None;
                } else if let Some(data) = page.data.as_mut() {
                    if let Some(range) = data.get_mut(offset..offset.saturating_add(len)) {
                        range.fill(0);
                    }
                }
            }
            MemoryBlock::Mapped(wrapper) => {
                let result = wrapper
                    .memory
                    .borrow_mut()
                    .clear_range(wrapper.base + offset as u64, len);
                if let Err(err) = result {
                    trace!(%err, "mapped clear past end of region");
                }
            }
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        self.copy_from(offset, &mut buf);
        buf
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_array(offset))
    }

    /// Low and high quad-words of the 128-bit value at `offset`.
    pub fn read_u128(&self, offset: usize) -> u128 {
        u128::from_le_bytes(self.read_array(offset))
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.copy_into(offset, &[value]);
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.copy_into(offset, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.copy_into(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.copy_into(offset, &value.to_le_bytes());
    }

    pub fn write_u128(&mut self, offset: usize, value: u128) {
        self.copy_into(offset, &value.to_le_bytes());
    }

    /// Raw storage for snapshotting; `None` for the sentinel, mapped wrappers and unallocated
    /// code pages.
    pub(crate) fn contents(&self) -> Option<&[u8]> {
        match self {
            MemoryBlock::Ram(data) | MemoryBlock::Rom(data) => Some(&data[..]),
            MemoryBlock::Code(page) => page.data.as_deref(),
            MemoryBlock::Unconnected | MemoryBlock::Mapped(_) => None,
        }
    }

    pub(crate) fn code_page_from(data: Option<Box<[u8]>>) -> Self {
        MemoryBlock::Code(CodePage { data })
    }
}

fn copy_out(data: &[u8], offset: usize, dst: &mut [u8]) {
    let avail = data.len().saturating_sub(offset).min(dst.len());
    if avail > 0 {
        dst[..avail].copy_from_slice(&data[offset..offset + avail]);
    }
    dst[avail..].fill(0xFF);
}

fn copy_in(data: &mut [u8], offset: usize, src: &[u8]) {
    let avail = data.len().saturating_sub(offset).min(src.len());
    if avail > 0 {
        data[offset..offset + avail].copy_from_slice(&src[..avail]);
    }
}
