use proptest::prelude::*;

use super::ram_bus;
use crate::{MemoryBlock, PhysicalAddressSpace, A20_MASK, BLOCK_SIZE};

const MIB: u32 = 1024 * 1024;

#[derive(Clone, Debug)]
enum Op {
    Allocate(u32),
    Unmap(u32, u32),
    Gate(bool),
}

fn arb_page_addr(max_pages: u32) -> impl Strategy<Value = u32> {
    (0..max_pages).prop_map(|p| p * BLOCK_SIZE as u32)
}

fn arb_op() -> impl Strategy<Value = Op> {
    // Keep most traffic below 4 MiB so the quick/sparse boundary and the 1 MiB alias get hit,
    // with occasional high pages for the sparse-only region.
    let addr = prop_oneof![
        4 => arb_page_addr(4 * MIB / BLOCK_SIZE as u32),
        1 => (0u32..0x10_0000).prop_map(|p| p << 12),
    ]
    .boxed();
    prop_oneof![
        4 => addr.clone().prop_map(Op::Allocate),
        2 => (addr, 1u32..8).prop_map(|(a, n)| Op::Unmap(a, n)),
        1 => any::<bool>().prop_map(Op::Gate),
    ]
}

fn apply(bus: &mut PhysicalAddressSpace, op: &Op) {
    match *op {
        Op::Allocate(addr) => {
            bus.allocate_memory(addr, MemoryBlock::ram()).unwrap();
        }
        Op::Unmap(addr, pages) => {
            let len = u64::from(pages) * BLOCK_SIZE as u64;
            if u64::from(addr) + len <= 1 << 32 {
                bus.unmap(addr, len).unwrap();
            }
        }
        Op::Gate(enabled) => bus.set_gate_a20_state(enabled),
    }
}

proptest! {
    #[test]
    fn a20_disabled_reads_alias_the_low_megabyte(
        offset in 0u32..MIB,
        value in any::<u32>(),
        via_alias in any::<bool>(),
    ) {
        let mut bus = ram_bus(2 * MIB);
        bus.set_gate_a20_state(false);

        let low = offset & !3;
        let high = low | MIB;
        let target = if via_alias { high } else { low };
        bus.write_u32(target, value);

        prop_assert_eq!(bus.read_u32(high), bus.read_u32(high & A20_MASK));
        prop_assert_eq!(bus.read_u32(low), value);
        prop_assert_eq!(bus.read_u32(high), value);
    }

    #[test]
    fn a20_enabled_never_aliases(offset in 0u32..MIB, value in 1u32..) {
        let mut bus = ram_bus(2 * MIB);
        bus.set_gate_a20_state(true);

        let low = offset & !3;
        bus.write_u32(low | MIB, value);
        prop_assert_eq!(bus.read_u32(low), 0);
        prop_assert_eq!(bus.read_u32(low | MIB), value);
    }

    #[test]
    fn masked_index_is_a_pure_function_of_the_unmasked_one(
        ops in proptest::collection::vec(arb_op(), 1..40),
        probes in proptest::collection::vec(any::<u32>(), 32),
    ) {
        let mut bus = PhysicalAddressSpace::new(2 * MIB);
        for op in &ops {
            apply(&mut bus, op);
        }

        for addr in probes.iter().copied().chain([0x10_0000, 0x1F_F000, 0x20_0000]) {
            let expected = if bus.gate_a20_state() {
                bus.unmasked_block_id_at(addr)
            } else {
                bus.unmasked_block_id_at(addr & A20_MASK)
            };
            prop_assert_eq!(bus.block_id_at(addr), expected);

            if let Some(quick) = bus.quick_block_id_at(addr) {
                prop_assert_eq!(quick, bus.sparse_block_id_at(addr));
            }
        }
    }

    #[test]
    fn unmapped_ranges_read_all_ones(start_page in 0u32..512, pages in 1u32..16) {
        let mut bus = ram_bus(2 * MIB);
        bus.set_gate_a20_state(true);
        let start = start_page * BLOCK_SIZE as u32;
        let len = pages * BLOCK_SIZE as u32;
        bus.unmap(start, u64::from(len)).unwrap();

        for addr in (start..start + len).step_by(509) {
            prop_assert_eq!(bus.read_u8(addr), 0xFF);
            prop_assert_eq!(bus.read_u16(addr & !1), 0xFFFF);
            prop_assert_eq!(bus.read_u32(addr & !3), 0xFFFF_FFFF);
            prop_assert_eq!(bus.read_u64(addr & !7), u64::MAX);
        }
    }

    #[test]
    fn misaligned_mutations_change_nothing(start in any::<u32>(), len in any::<u32>()) {
        prop_assume!(start % BLOCK_SIZE as u32 != 0 || len % BLOCK_SIZE as u32 != 0);
        let mut bus = ram_bus(MIB);
        let count = bus.mapped_region_count();
        let before: Vec<_> = (0..MIB).step_by(BLOCK_SIZE).map(|a| bus.block_id_at(a)).collect();

        prop_assert!(bus.unmap(start, u64::from(len)).is_err());
        if start % BLOCK_SIZE as u32 != 0 {
            prop_assert!(bus.allocate_memory(start, MemoryBlock::ram()).is_err());
        }

        let after: Vec<_> = (0..MIB).step_by(BLOCK_SIZE).map(|a| bus.block_id_at(a)).collect();
        prop_assert_eq!(before, after);
        prop_assert_eq!(bus.mapped_region_count(), count);
    }
}
