use ferrite_memory::{
    BlockKind, DenseMemory, GuestMemory, MemoryBlock, PhysicalAddressSpace, BLOCK_SIZE,
};

const MIB: u32 = 1024 * 1024;

fn pc_layout() -> PhysicalAddressSpace {
    let mut bus = PhysicalAddressSpace::new(4 * MIB);
    for addr in (0..4 * MIB).step_by(BLOCK_SIZE) {
        if (0xA0000..0x10_0000).contains(&addr) {
            continue;
        }
        bus.allocate_memory(addr, MemoryBlock::lazy_code()).unwrap();
    }
    bus
}

#[test]
fn vga_window_remap_moves_the_aperture() {
    let mut bus = pc_layout();
    let vram = DenseMemory::new(0x2_0000).unwrap().into_shared();

    bus.map_memory_region(vram.clone(), 0xA0000, 0x2_0000).unwrap();
    bus.write_u16(0xB8000, 0x0741);
    assert_eq!(vram.borrow().read_u16_le(0x1_8000).unwrap(), 0x0741);

    // Guest reprograms the memory map to a 64 KiB window at 0xA0000.
    bus.unmap(0xA0000, 0x2_0000).unwrap();
    bus.map_memory_region(vram.clone(), 0xA0000, 0x1_0000).unwrap();
    assert_eq!(bus.read_u16(0xB8000), 0xFFFF);
    assert_eq!(bus.block_at(0xAF000).kind(), BlockKind::Mapped);

    vram.borrow_mut().write_u8_le(0x10, 0x5A).unwrap();
    assert_eq!(bus.read_u8(0xA0010), 0x5A);
}

#[test]
fn allocated_buffer_size_tracks_connected_blocks() {
    let mut bus = pc_layout();
    let ram_pages = u64::from(4 * MIB) / BLOCK_SIZE as u64 - 96;
    assert_eq!(bus.allocated_buffer_size(), ram_pages * BLOCK_SIZE as u64);

    bus.load_system_bios(&vec![0xCC; 0x1_0000]).unwrap();
    assert_eq!(
        bus.allocated_buffer_size(),
        (ram_pages + 16) * BLOCK_SIZE as u64
    );

    bus.unmap(0, u64::from(MIB)).unwrap();
    assert_eq!(
        bus.allocated_buffer_size(),
        (ram_pages - 160) * BLOCK_SIZE as u64
    );
}

#[test]
fn bulk_copy_spans_ram_and_hole() {
    let mut bus = pc_layout();
    let data: Vec<u8> = (0..0x3000).map(|i| (i % 251) as u8).collect();
    bus.copy_into_contents(0x9_F000, &data);

    // The hole is promoted to code pages on the way through.
    assert_eq!(bus.block_at(0xA0000).kind(), BlockKind::Code);
    let mut back = vec![0u8; data.len()];
    bus.copy_from_contents(0x9_F000, &mut back);
    assert_eq!(back, data);
}

#[test]
fn clear_preserves_rom_and_mapped_wrappers_see_zeroes() {
    let mut bus = pc_layout();
    let vram = DenseMemory::new(0x1000).unwrap().into_shared();
    bus.map_memory_region(vram.clone(), 0xB8000, 0x1000).unwrap();
    bus.load_system_bios(&[0xEA; BLOCK_SIZE]).unwrap();
    bus.write_u32(0xB8000, 0x1234_5678);
    bus.write_u32(0x500, 0x1234_5678);

    bus.clear();
    assert_eq!(bus.read_u32(0x500), 0);
    assert_eq!(bus.read_u32(0xB8000), 0);
    assert_eq!(bus.read_u8(0xFF000), 0xEA);
}
