//! Page-granular block index with mirrored A20 variants.
//!
//! Two index sets are maintained side by side: the unmasked set maps every page to its natural
//! block, the masked set maps every page to the block of the same page with bit 20 cleared.
//! Toggling the A20 gate only flips which set answers lookups.

use crate::block::{BlockId, BLOCK_SHIFT};

/// Address mask applied by the A20 gate when it is disabled.
pub const A20_MASK: u32 = 0xFFEF_FFFF;

const A20_PAGE_BIT: u32 = !A20_MASK >> BLOCK_SHIFT;
const GROUP_BITS: u32 = 10;
const GROUP_SLOTS: usize = 1 << GROUP_BITS;
const GROUP_COUNT: usize = 1 << (32 - BLOCK_SHIFT - GROUP_BITS);
const SLOT_MASK: u32 = (GROUP_SLOTS as u32) - 1;

const UNMASKED: usize = 0;
const MASKED: usize = 1;

type Group = Box<[BlockId; GROUP_SLOTS]>;

#[derive(Debug, Clone)]
struct IndexSet {
    /// Flat table over the system RAM pages.
    quick: Box<[BlockId]>,
    /// Two-level table over all 2^20 pages. Mirrors `quick` for the pages it covers.
    sparse: Box<[Option<Group>]>,
}

impl IndexSet {
    fn new(quick_pages: usize) -> Self {
        Self {
            quick: vec![BlockId::UNCONNECTED; quick_pages].into_boxed_slice(),
            sparse: vec![None; GROUP_COUNT].into_boxed_slice(),
        }
    }

    #[inline]
    fn quick(&self, page: u32) -> Option<BlockId> {
        self.quick.get(page as usize).copied()
    }

    #[inline]
    fn sparse(&self, page: u32) -> BlockId {
        match &self.sparse[(page >> GROUP_BITS) as usize] {
            Some(group) => group[(page & SLOT_MASK) as usize],
            None => BlockId::UNCONNECTED,
        }
    }

    #[inline]
    fn lookup(&self, page: u32) -> BlockId {
        match self.quick(page) {
            Some(id) => id,
            None => self.sparse(page),
        }
    }

    /// Store `id` at `page`, returning the previous occupant.
    fn store(&mut self, page: u32, id: BlockId) -> BlockId {
        if let Some(slot) = self.quick.get_mut(page as usize) {
            *slot = id;
        }
        let group = &mut self.sparse[(page >> GROUP_BITS) as usize];
        let slot = (page & SLOT_MASK) as usize;
        match group {
            Some(group) => std::mem::replace(&mut group[slot], id),
            None if id.is_unconnected() => BlockId::UNCONNECTED,
            None => {
                let mut fresh = Box::new([BlockId::UNCONNECTED; GROUP_SLOTS]);
                fresh[slot] = id;
                *group = Some(fresh);
                BlockId::UNCONNECTED
            }
        }
    }

    fn replace(&mut self, old: BlockId, new: BlockId) -> usize {
        let mut replaced = 0;
        let slots = self
            .quick
            .iter_mut()
            .chain(self.sparse.iter_mut().flatten().flat_map(|g| g.iter_mut()));
        for slot in slots {
            if *slot == old {
                *slot = new;
                replaced += 1;
            }
        }
        replaced
    }

    fn occupied(&self) -> impl Iterator<Item = (u32, BlockId)> + '_ {
        self.sparse
            .iter()
            .enumerate()
            .filter_map(|(g, group)| group.as_ref().map(|group| (g as u32, group)))
            .flat_map(|(g, group)| {
                group
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| !id.is_unconnected())
                    .map(move |(slot, id)| ((g << GROUP_BITS) | slot as u32, *id))
            })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BlockIndex {
    sets: [IndexSet; 2],
    active: usize,
    quick_pages: usize,
}

impl BlockIndex {
    pub(crate) fn new(quick_pages: usize, gate_a20: bool) -> Self {
        Self {
            sets: [IndexSet::new(quick_pages), IndexSet::new(quick_pages)],
            active: if gate_a20 { UNMASKED } else { MASKED },
            quick_pages,
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, addr: u32) -> BlockId {
        self.sets[self.active].lookup(addr >> BLOCK_SHIFT)
    }

    pub(crate) fn lookup_quick(&self, addr: u32) -> Option<BlockId> {
        self.sets[self.active].quick(addr >> BLOCK_SHIFT)
    }

    pub(crate) fn lookup_sparse(&self, addr: u32) -> BlockId {
        self.sets[self.active].sparse(addr >> BLOCK_SHIFT)
    }

    #[inline]
    pub(crate) fn lookup_unmasked(&self, addr: u32) -> BlockId {
        self.sets[UNMASKED].lookup(addr >> BLOCK_SHIFT)
    }

    pub(crate) fn gate_a20(&self) -> bool {
        self.active == UNMASKED
    }

    pub(crate) fn set_gate_a20(&mut self, enabled: bool) {
        self.active = if enabled { UNMASKED } else { MASKED };
    }

    /// Install `id` at `page` in the unmasked set and keep the masked set consistent. Returns the
    /// block previously installed at `page`.
    pub(crate) fn set(&mut self, page: u32, id: BlockId) -> BlockId {
        let old = self.sets[UNMASKED].store(page, id);
        if page & A20_PAGE_BIT == 0 {
            self.sets[MASKED].store(page, id);
            self.sets[MASKED].store(page | A20_PAGE_BIT, id);
        }
        old
    }

    pub(crate) fn get(&self, page: u32) -> BlockId {
        self.sets[UNMASKED].lookup(page)
    }

    /// Substitute `new` for `old` in every slot of both sets. Returns the number of unmasked
    /// slots that changed.
    pub(crate) fn replace(&mut self, old: BlockId, new: BlockId) -> usize {
        self.sets[MASKED].replace(old, new);
        // Quick slots are mirrored in the sparse table; count only the sparse hits.
        let quick = self.sets[UNMASKED]
            .quick
            .iter()
            .filter(|id| **id == old)
            .count();
        self.sets[UNMASKED].replace(old, new) - quick
    }

    /// Non-sentinel unmasked entries in ascending page order.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (u32, BlockId)> + '_ {
        self.sets[UNMASKED].occupied()
    }

    /// Rebuild an index from unmasked `(page, block)` entries, deriving the masked set.
    pub(crate) fn restore(
        quick_pages: usize,
        gate_a20: bool,
        entries: impl IntoIterator<Item = (u32, BlockId)>,
    ) -> Self {
        let mut index = Self::new(quick_pages, gate_a20);
        for (page, id) in entries {
            index.sets[UNMASKED].store(page, id);
        }
        index.rebuild_masked();
        index
    }

    /// Recompute the masked set from the unmasked one.
    fn rebuild_masked(&mut self) {
        let mut masked = IndexSet::new(self.quick_pages);
        for (page, id) in self.sets[UNMASKED].occupied() {
            if page & A20_PAGE_BIT == 0 {
                masked.store(page, id);
                masked.store(page | A20_PAGE_BIT, id);
            }
        }
        self.sets[MASKED] = masked;
    }

    pub(crate) fn clear(&mut self) {
        self.sets = [
            IndexSet::new(self.quick_pages),
            IndexSet::new(self.quick_pages),
        ];
    }
}
