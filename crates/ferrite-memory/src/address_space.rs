use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use ferrite_snapshot::codec::{Decoder, Encoder};
use ferrite_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use tracing::{debug, warn};

use crate::block::{BlockId, BlockKind, MemoryBlock, BLOCK_MASK, BLOCK_SHIFT, BLOCK_SIZE};
use crate::code::{CodeRegistrationHook, NoopCodeHook};
use crate::error::{ExecError, MapError};
use crate::index::{BlockIndex, A20_MASK};
use crate::phys::SharedGuestMemory;

const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Top of the legacy BIOS window; the system BIOS image always ends here.
pub const SYSTEM_BIOS_END: u32 = 0x0010_0000;

/// The 4 GiB physical bus.
///
/// Every address resolves to exactly one [`MemoryBlock`]. Addresses nobody has mapped resolve to
/// the shared unconnected sentinel, which reads as all ones and swallows writes.
pub struct PhysicalAddressSpace {
    blocks: Vec<MemoryBlock>,
    /// Number of unmasked index slots referencing each block.
    refs: Vec<u32>,
    free: Vec<BlockId>,
    index: BlockIndex,
    ram_size: u32,
    regions: Vec<SharedGuestMemory>,
    mapped_region_count: u32,
    paging_active: bool,
    translation_flush: bool,
    code_hook: Box<dyn CodeRegistrationHook>,
}

impl fmt::Debug for PhysicalAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalAddressSpace")
            .field("ram_size", &self.ram_size)
            .field("gate_a20", &self.index.gate_a20())
            .field("mapped_region_count", &self.mapped_region_count)
            .field("arena_len", &self.blocks.len())
            .field("regions", &self.regions.len())
            .finish_non_exhaustive()
    }
}

impl PhysicalAddressSpace {
    /// Empty bus whose quick index covers `ram_size` bytes. The A20 gate starts disabled.
    pub fn new(ram_size: u32) -> Self {
        Self {
            blocks: vec![MemoryBlock::Unconnected],
            refs: vec![0],
            free: Vec::new(),
            index: BlockIndex::new(quick_pages(ram_size), false),
            ram_size,
            regions: Vec::new(),
            mapped_region_count: 0,
            paging_active: false,
            translation_flush: false,
            code_hook: Box::new(NoopCodeHook),
        }
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    pub fn set_code_hook(&mut self, hook: Box<dyn CodeRegistrationHook>) {
        self.code_hook = hook;
    }

    // ---------------------------------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------------------------------

    /// Block answering accesses to `addr` under the current A20 gate state.
    #[inline]
    pub fn block_id_at(&self, addr: u32) -> BlockId {
        self.index.lookup(addr)
    }

    /// Quick-table answer for `addr`, or `None` when `addr` lies above system RAM.
    pub fn quick_block_id_at(&self, addr: u32) -> Option<BlockId> {
        self.index.lookup_quick(addr)
    }

    /// Sparse-table answer for `addr`. Agrees with the quick table wherever both cover `addr`.
    pub fn sparse_block_id_at(&self, addr: u32) -> BlockId {
        self.index.lookup_sparse(addr)
    }

    /// Block installed at `addr` ignoring the A20 gate.
    #[inline]
    pub fn unmasked_block_id_at(&self, addr: u32) -> BlockId {
        self.index.lookup_unmasked(addr)
    }

    pub fn block(&self, id: BlockId) -> &MemoryBlock {
        &self.blocks[id.index()]
    }

    pub fn block_at(&self, addr: u32) -> &MemoryBlock {
        self.block(self.block_id_at(addr))
    }

    /// Block that execution starting at `addr` would fetch from.
    pub fn code_block_at(&self, addr: u32) -> Result<BlockId, ExecError> {
        let id = self.block_id_at(addr);
        if id.is_unconnected() {
            return Err(ExecError::Unconnected { addr });
        }
        Ok(id)
    }

    // ---------------------------------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------------------------------

    fn read_span(&self, addr: u32, dst: &mut [u8]) {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset + dst.len() <= BLOCK_SIZE {
            self.block_at(addr).copy_from(offset, dst);
            return;
        }
        for (i, byte) in dst.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u32);
            *byte = self.block_at(a).read_u8((a & BLOCK_MASK) as usize);
        }
    }

    fn write_span(&mut self, addr: u32, src: &[u8]) {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset + src.len() <= BLOCK_SIZE {
            self.write_in_block(addr, src);
            return;
        }
        for (i, byte) in src.iter().enumerate() {
            self.write_in_block(addr.wrapping_add(i as u32), std::slice::from_ref(byte));
        }
    }

    /// `src` must not cross a block boundary.
    fn write_in_block(&mut self, addr: u32, src: &[u8]) {
        let id = self.block_id_at(addr);
        let block = &mut self.blocks[id.index()];
        block.copy_into((addr & BLOCK_MASK) as usize, src);
        if block.kind() == BlockKind::Code {
            self.code_hook.code_page_written(addr, src.len());
        }
    }

    fn read_array<const N: usize>(&self, addr: u32) -> [u8; N] {
        let mut buf = [0u8; N];
        self.read_span(addr, &mut buf);
        buf
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.block_at(addr).read_u8((addr & BLOCK_MASK) as usize)
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes(self.read_array(addr))
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes(self.read_array(addr))
    }

    pub fn read_u64(&self, addr: u32) -> u64 {
        u64::from_le_bytes(self.read_array(addr))
    }

    pub fn read_u128(&self, addr: u32) -> u128 {
        u128::from_le_bytes(self.read_array(addr))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        self.write_in_block(addr, &[value]);
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) {
        self.write_span(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_span(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: u32, value: u64) {
        self.write_span(addr, &value.to_le_bytes());
    }

    pub fn write_u128(&mut self, addr: u32, value: u128) {
        self.write_span(addr, &value.to_le_bytes());
    }

    /// Bulk read, split on block boundaries. Wraps at the top of the address space.
    pub fn copy_from_contents(&self, addr: u32, dst: &mut [u8]) {
        let mut addr = addr;
        let mut dst = dst;
        while !dst.is_empty() {
            let chunk = chunk_len(addr, dst.len());
            let (head, tail) = dst.split_at_mut(chunk);
            self.read_span(addr, head);
            addr = addr.wrapping_add(chunk as u32);
            dst = tail;
        }
    }

    /// Bulk write, split on block boundaries.
    ///
    /// A chunk landing on unconnected memory promotes that block to a fresh code-tracked page
    /// and reports it to the code registration hook before the data is stored.
    pub fn copy_into_contents(&mut self, addr: u32, src: &[u8]) {
        let mut addr = addr;
        let mut src = src;
        while !src.is_empty() {
            let chunk = chunk_len(addr, src.len());
            if self.block_id_at(addr).is_unconnected() {
                self.promote(addr);
            }
            self.write_in_block(addr, &src[..chunk]);
            addr = addr.wrapping_add(chunk as u32);
            src = &src[chunk..];
        }
    }

    fn promote(&mut self, addr: u32) {
        let effective = if self.index.gate_a20() {
            addr
        } else {
            addr & A20_MASK
        };
        let base = effective & !BLOCK_MASK;
        let id = self.alloc(MemoryBlock::lazy_code());
        self.install(base >> BLOCK_SHIFT, id);
        self.mapped_region_count += 1;
        debug!(base = format_args!("{base:#010x}"), "promoted unconnected block to code page");
        self.code_hook.page_promoted(base);
    }

    // ---------------------------------------------------------------------------------------------
    // Index mutation
    // ---------------------------------------------------------------------------------------------

    fn alloc(&mut self, block: MemoryBlock) -> BlockId {
        match self.free.pop() {
            Some(id) => {
                self.blocks[id.index()] = block;
                id
            }
            None => {
                // The arena holds at most one live block per page plus the sentinel.
                let id = BlockId(
                    u32::try_from(self.blocks.len()).expect("block arena exceeds 2^32 entries"),
                );
                self.blocks.push(block);
                self.refs.push(0);
                id
            }
        }
    }

    fn release(&mut self, id: BlockId) {
        if id.is_unconnected() {
            return;
        }
        let refs = &mut self.refs[id.index()];
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            self.blocks[id.index()] = MemoryBlock::Unconnected;
            self.free.push(id);
        }
    }

    fn install(&mut self, page: u32, id: BlockId) {
        if !id.is_unconnected() {
            self.refs[id.index()] += 1;
        }
        let old = self.index.set(page, id);
        self.release(old);
    }

    fn validate_range(start: u32, length: u64) -> Result<(), MapError> {
        if start & BLOCK_MASK != 0 {
            return Err(MapError::Misaligned { start });
        }
        if length % BLOCK_SIZE as u64 != 0 {
            return Err(MapError::PartialBlock { length });
        }
        if u64::from(start) + length > ADDRESS_SPACE_END {
            return Err(MapError::RangeOverflow { start, length });
        }
        Ok(())
    }

    fn pages(start: u32, length: u64) -> impl Iterator<Item = u32> {
        let first = start >> BLOCK_SHIFT;
        let count = (length >> BLOCK_SHIFT) as u32;
        (0..count).map(move |i| first + i)
    }

    /// Index of `memory` in the region table, registering it if new.
    ///
    /// Snapshots refer to mapped regions by this index.
    pub fn register_region(&mut self, memory: &SharedGuestMemory) -> usize {
        if let Some(pos) = self.regions.iter().position(|r| Rc::ptr_eq(r, memory)) {
            return pos;
        }
        self.regions.push(memory.clone());
        self.regions.len() - 1
    }

    /// Alias `[start, start + length)` onto `underlying[0..length)`, one wrapper per block.
    pub fn map_memory_region(
        &mut self,
        underlying: SharedGuestMemory,
        start: u32,
        length: u64,
    ) -> Result<(), MapError> {
        Self::validate_range(start, length)?;
        let size = underlying.borrow().size();
        if length > size {
            return Err(MapError::UnderlyingTooShort { length, size });
        }

        let region = self.register_region(&underlying);
        self.unmap_pages(start, length);
        for (i, page) in Self::pages(start, length).enumerate() {
            let base = (i as u64) << BLOCK_SHIFT;
            let id = self.alloc(MemoryBlock::mapped(region, underlying.clone(), base));
            self.install(page, id);
            self.mapped_region_count += 1;
        }
        debug!(
            start = format_args!("{start:#010x}"),
            length = format_args!("{length:#x}"),
            region,
            "mapped memory region"
        );
        Ok(())
    }

    /// Install `block` at the block-aligned address `start`, replacing whatever was there.
    pub fn allocate_memory(&mut self, start: u32, block: MemoryBlock) -> Result<BlockId, MapError> {
        if start & BLOCK_MASK != 0 {
            return Err(MapError::Misaligned { start });
        }
        if block.size() != BLOCK_SIZE {
            return Err(MapError::WrongBlockSize { size: block.size() });
        }

        self.unmap_pages(start, BLOCK_SIZE as u64);
        if !block.is_connected() {
            return Ok(BlockId::UNCONNECTED);
        }
        let kind = block.kind();
        let id = self.alloc(block);
        self.install(start >> BLOCK_SHIFT, id);
        self.mapped_region_count += 1;
        debug!(start = format_args!("{start:#010x}"), ?kind, "allocated block");
        Ok(id)
    }

    /// Return `[start, start + length)` to the unconnected sentinel.
    pub fn unmap(&mut self, start: u32, length: u64) -> Result<(), MapError> {
        Self::validate_range(start, length)?;
        self.unmap_pages(start, length);
        debug!(
            start = format_args!("{start:#010x}"),
            length = format_args!("{length:#x}"),
            "unmapped range"
        );
        Ok(())
    }

    fn unmap_pages(&mut self, start: u32, length: u64) {
        for page in Self::pages(start, length) {
            if !self.index.get(page).is_unconnected() {
                self.mapped_region_count = self.mapped_region_count.saturating_sub(1);
                self.install(page, BlockId::UNCONNECTED);
            }
        }
    }

    /// Substitute `new` for every slot holding `old`, in both A20 variants.
    ///
    /// Returns the id of the new block, or `None` if `old` is the sentinel or is not installed
    /// anywhere. `new` must be a connected 4 KiB block; use [`Self::unmap`] to disconnect pages.
    pub fn replace_blocks(
        &mut self,
        old: BlockId,
        new: MemoryBlock,
    ) -> Result<Option<BlockId>, MapError> {
        if !new.is_connected() {
            return Err(MapError::UnconnectedReplacement);
        }
        if new.size() != BLOCK_SIZE {
            return Err(MapError::WrongBlockSize { size: new.size() });
        }
        if old.is_unconnected() {
            return Ok(None);
        }
        let id = self.alloc(new);
        let replaced = self.index.replace(old, id);
        if replaced == 0 {
            self.blocks[id.index()] = MemoryBlock::Unconnected;
            self.free.push(id);
            return Ok(None);
        }
        self.refs[id.index()] = replaced as u32;
        self.refs[old.index()] = 1;
        self.release(old);
        Ok(Some(id))
    }

    /// Map `image` as ROM so that it ends at 1 MiB. A partial first block is padded with `0xFF`
    /// in front of the image.
    pub fn load_system_bios(&mut self, image: &[u8]) -> Result<(), MapError> {
        if image.is_empty() || image.len() > SYSTEM_BIOS_END as usize {
            return Err(MapError::InvalidRomImage { len: image.len() });
        }
        let len = image.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let mut padded = vec![0xFFu8; len];
        padded[len - image.len()..].copy_from_slice(image);

        let start = SYSTEM_BIOS_END - len as u32;
        for (i, chunk) in padded.chunks_exact(BLOCK_SIZE).enumerate() {
            let addr = start + (i * BLOCK_SIZE) as u32;
            self.allocate_memory(addr, MemoryBlock::rom(chunk.to_vec()))?;
        }
        debug!(
            start = format_args!("{start:#010x}"),
            len = image.len(),
            "loaded system bios"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // A20, paging link, lifecycle
    // ---------------------------------------------------------------------------------------------

    pub fn gate_a20_state(&self) -> bool {
        self.index.gate_a20()
    }

    /// Switch between the masked and unmasked index. Raises a translation flush request when
    /// paging is active, since cached linear translations may now point at the wrong block.
    pub fn set_gate_a20_state(&mut self, enabled: bool) {
        self.index.set_gate_a20(enabled);
        if self.paging_active {
            self.translation_flush = true;
        }
        debug!(enabled, "a20 gate");
    }

    pub fn set_paging_active(&mut self, active: bool) {
        self.paging_active = active;
    }

    pub fn paging_active(&self) -> bool {
        self.paging_active
    }

    /// Take the pending translation flush request, if any.
    pub fn take_translation_flush(&mut self) -> bool {
        std::mem::take(&mut self.translation_flush)
    }

    pub fn mapped_region_count(&self) -> u32 {
        self.mapped_region_count
    }

    pub fn allocated_buffer_size(&self) -> u64 {
        u64::from(self.mapped_region_count) * BLOCK_SIZE as u64
    }

    /// Zero every writable block. ROM and the sentinel are unaffected.
    pub fn clear(&mut self) {
        for block in self.blocks.iter_mut().skip(1) {
            block.clear();
        }
    }

    /// Clear memory, disable the A20 gate and drop the paging link.
    pub fn reset(&mut self) {
        self.clear();
        self.paging_active = false;
        self.translation_flush = false;
        self.set_gate_a20_state(false);
    }
}

fn quick_pages(ram_size: u32) -> usize {
    (ram_size >> BLOCK_SHIFT) as usize
}

fn chunk_len(addr: u32, remaining: usize) -> usize {
    let to_boundary = BLOCK_SIZE - (addr & BLOCK_MASK) as usize;
    to_boundary.min(remaining)
}

// -------------------------------------------------------------------------------------------------
// Snapshot
// -------------------------------------------------------------------------------------------------

const TAG_RAM_SIZE: u16 = 1;
const TAG_GATE_A20: u16 = 2;
const TAG_MAPPED_REGION_COUNT: u16 = 3;
const TAG_PAGING_ACTIVE: u16 = 4;
const TAG_TRANSLATION_FLUSH: u16 = 5;
const TAG_BLOCKS: u16 = 6;
const TAG_INDEX: u16 = 7;
const TAG_REGION_COUNT: u16 = 8;

const KNOWN_TAGS: &[u16] = &[
    TAG_RAM_SIZE,
    TAG_GATE_A20,
    TAG_MAPPED_REGION_COUNT,
    TAG_PAGING_ACTIVE,
    TAG_TRANSLATION_FLUSH,
    TAG_BLOCKS,
    TAG_INDEX,
    TAG_REGION_COUNT,
];

fn encode_block(enc: Encoder, block: &MemoryBlock) -> Encoder {
    let enc = enc.u8(block.kind().tag());
    match block {
        MemoryBlock::Ram(data) | MemoryBlock::Rom(data) => enc.vec_u8(data),
        MemoryBlock::Code(_) => match block.contents() {
            Some(data) => enc.bool(true).vec_u8(data),
            None => enc.bool(false),
        },
        MemoryBlock::Mapped(wrapper) => enc.u32(wrapper.region as u32).u64(wrapper.base),
        MemoryBlock::Unconnected => enc,
    }
}

fn block_payload(d: &mut Decoder<'_>) -> SnapshotResult<Vec<u8>> {
    let bytes = d.vec_u8()?;
    if bytes.len() != BLOCK_SIZE {
        return Err(SnapshotError::InvalidFieldEncoding("block length"));
    }
    Ok(bytes.to_vec())
}

impl PhysicalAddressSpace {
    fn decode_block(&self, d: &mut Decoder<'_>) -> SnapshotResult<MemoryBlock> {
        let tag = d.u8()?;
        let block = match tag {
            t if t == BlockKind::Ram.tag() => MemoryBlock::ram_from(block_payload(d)?),
            t if t == BlockKind::Rom.tag() => MemoryBlock::rom(block_payload(d)?),
            t if t == BlockKind::Code.tag() => {
                let data = if d.bool()? {
                    let bytes = d.vec_u8()?;
                    if bytes.len() != BLOCK_SIZE {
                        return Err(SnapshotError::InvalidFieldEncoding("code page length"));
                    }
                    Some(bytes.to_vec().into_boxed_slice())
                } else {
                    None
                };
                MemoryBlock::code_page_from(data)
            }
            t if t == BlockKind::Mapped.tag() => {
                let region = d.u32()? as usize;
                let base = d.u64()?;
                let memory = self
                    .regions
                    .get(region)
                    .ok_or(SnapshotError::InvalidFieldEncoding("mapped region index"))?;
                MemoryBlock::mapped(region, memory.clone(), base)
            }
            _ => return Err(SnapshotError::InvalidFieldEncoding("block kind")),
        };
        Ok(block)
    }
}

impl IoSnapshot for PhysicalAddressSpace {
    const DEVICE_ID: [u8; 4] = *b"PHYS";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_RAM_SIZE, self.ram_size);
        w.field_bool(TAG_GATE_A20, self.index.gate_a20());
        w.field_u32(TAG_MAPPED_REGION_COUNT, self.mapped_region_count);
        w.field_bool(TAG_PAGING_ACTIVE, self.paging_active);
        w.field_bool(TAG_TRANSLATION_FLUSH, self.translation_flush);
        w.field_u32(TAG_REGION_COUNT, self.regions.len() as u32);

        // Arena ids are renumbered densely in first-use order so equal bus contents encode to
        // equal bytes regardless of allocation history.
        let mut ordinals: HashMap<BlockId, u32> = HashMap::new();
        let mut order: Vec<BlockId> = Vec::new();
        let mut entries = Vec::new();
        for (page, id) in self.index.occupied() {
            let ordinal = *ordinals.entry(id).or_insert_with(|| {
                order.push(id);
                (order.len() - 1) as u32
            });
            entries.push((page, ordinal));
        }

        let mut blocks = Encoder::new().u32(order.len() as u32);
        for id in &order {
            blocks = encode_block(blocks, self.block(*id));
        }
        w.field_bytes(TAG_BLOCKS, blocks.finish());

        let mut index = Encoder::new().u32(entries.len() as u32);
        for (page, ordinal) in entries {
            index = index.u32(page).u32(ordinal);
        }
        w.field_bytes(TAG_INDEX, index.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        for tag in r.tags().filter(|t| !KNOWN_TAGS.contains(t)) {
            warn!(tag, "ignoring unknown address space snapshot field");
        }

        if let Some(count) = r.u32(TAG_REGION_COUNT)? {
            if count as usize > self.regions.len() {
                return Err(SnapshotError::InvalidFieldEncoding("mapped region count"));
            }
        }

        let ram_size = r.u32(TAG_RAM_SIZE)?.unwrap_or(self.ram_size);
        let gate_a20 = r.bool(TAG_GATE_A20)?.unwrap_or(false);

        // Decode everything before touching `self`.
        let mut blocks = vec![MemoryBlock::Unconnected];
        if let Some(buf) = r.bytes(TAG_BLOCKS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()?;
            for _ in 0..count {
                blocks.push(self.decode_block(&mut d)?);
            }
            d.finish()?;
        }

        let mut entries = Vec::new();
        let mut refs = vec![0u32; blocks.len()];
        if let Some(buf) = r.bytes(TAG_INDEX) {
            let mut d = Decoder::new(buf);
            let count = d.u32()?;
            for _ in 0..count {
                let page = d.u32()?;
                let ordinal = d.u32()?;
                if page >= 1 << (32 - BLOCK_SHIFT) {
                    return Err(SnapshotError::InvalidFieldEncoding("index page"));
                }
                let id = ordinal
                    .checked_add(1)
                    .map(BlockId)
                    .ok_or(SnapshotError::InvalidFieldEncoding("index block ordinal"))?;
                let slot = refs
                    .get_mut(id.index())
                    .ok_or(SnapshotError::InvalidFieldEncoding("index block ordinal"))?;
                *slot += 1;
                entries.push((page, id));
            }
            d.finish()?;
        }

        self.index = BlockIndex::restore(quick_pages(ram_size), gate_a20, entries);
        self.blocks = blocks;
        self.refs = refs;
        self.free.clear();
        self.ram_size = ram_size;
        self.mapped_region_count = r.u32(TAG_MAPPED_REGION_COUNT)?.unwrap_or(0);
        self.paging_active = r.bool(TAG_PAGING_ACTIVE)?.unwrap_or(false);
        self.translation_flush = r.bool(TAG_TRANSLATION_FLUSH)?.unwrap_or(false);
        Ok(())
    }
}
