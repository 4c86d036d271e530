mod common;

use common::{init_tracing, machine, small_config, ScriptedCpu};
use ferrite_memory::BlockKind;
use ferrite_platform::{Machine, MachineConfig, MachineError};
use ferrite_snapshot::IoSnapshot;

fn bios_image() -> Vec<u8> {
    let mut image = vec![0x90u8; 0x2000];
    image[0x1FF0] = 0xEA;
    image
}

#[test]
fn ram_is_mapped_around_the_legacy_hole() {
    init_tracing();
    let config = MachineConfig {
        ram_size_bytes: 0x20_0000,
        a20_enabled_at_reset: true,
        ..MachineConfig::default()
    };
    let m = Machine::new(config, ScriptedCpu::default()).unwrap();
    let memory = m.memory();
    assert_eq!(memory.block_at(0x9_F000).kind(), BlockKind::Ram);
    assert_eq!(memory.block_at(0xA_0000).kind(), BlockKind::Unconnected);
    assert_eq!(memory.block_at(0xF_F000).kind(), BlockKind::Unconnected);
    assert_eq!(memory.block_at(0x10_0000).kind(), BlockKind::Ram);
    assert_eq!(memory.read_u32(0xB_8000), 0xFFFF_FFFF);
}

#[test]
fn bios_is_visible_through_the_a20_alias_until_the_gate_opens() {
    init_tracing();
    let config = MachineConfig {
        ram_size_bytes: 0x20_0000,
        ..MachineConfig::default()
    };
    let mut m = Machine::new(config, ScriptedCpu::default()).unwrap();
    m.set_system_bios(bios_image()).unwrap();

    assert_eq!(m.memory().read_u8(0xF_FFF0), 0xEA);
    assert_eq!(m.memory().read_u8(0x1F_FFF0), 0xEA);

    m.memory_mut().set_gate_a20_state(true);
    assert_eq!(m.memory().read_u8(0x1F_FFF0), 0x00);
    assert_eq!(m.memory().block_at(0x1F_F000).kind(), BlockKind::Ram);
}

#[test]
fn reset_restores_configured_state() {
    let mut m = machine(ScriptedCpu::default());
    m.set_system_bios(bios_image()).unwrap();
    m.memory_mut().write_u16(0x500, 0x1234);
    m.memory_mut().set_gate_a20_state(true);
    m.io_write(0x21, 1, 0xFF);

    m.reset().unwrap();
    assert_eq!(m.memory().read_u16(0x500), 0);
    assert!(!m.memory().gate_a20_state());
    assert_eq!(m.memory().read_u8(0xF_FFF0), 0xEA);
    assert_eq!(m.io_read(0x21, 1), 0x00);
    assert_eq!(m.pic().borrow().vector_bases(), (0x08, 0x70));
    assert_eq!(m.cpu().resets, 1);
}

#[test]
fn masked_lines_do_not_raise_intr() {
    let mut m = machine(ScriptedCpu::default());
    m.io_write(0x21, 1, 0xFF);
    m.set_irq(3, true);
    assert!(!m.cpu().intr);

    m.io_write(0x21, 1, 0x00);
    assert!(m.cpu().intr);
    assert_eq!(m.cpu_get_interrupt(), 0x0B);
}

#[test]
fn spurious_acknowledge_returns_line_seven() {
    let mut m = machine(ScriptedCpu::default());
    assert_eq!(m.cpu_get_interrupt(), 0x0F);
}

#[test]
fn snapshot_round_trip_restores_memory_and_controller() {
    let mut m = machine(ScriptedCpu::default());
    m.memory_mut().write_u64(0x2000, 0x0102_0304_0506_0708);
    m.memory_mut().set_gate_a20_state(true);
    m.io_write(0x4D1, 1, 0x02);
    m.set_irq(9, true);
    let saved = m.save_state();

    let mut restored = machine(ScriptedCpu::default());
    restored.restore(&saved).unwrap();
    assert_eq!(restored.memory().read_u64(0x2000), 0x0102_0304_0506_0708);
    assert!(restored.memory().gate_a20_state());
    assert!(restored.cpu().intr);
    assert_eq!(restored.cpu_get_interrupt(), 0x71);

    assert_eq!(m.save_state(), saved);
}

#[test]
fn restore_rejects_foreign_blob_without_side_effects() {
    let mut m = machine(ScriptedCpu::default());
    m.memory_mut().write_u8(0x10, 0x55);
    let pic_blob = m.pic().borrow().save_state();

    let err = m.restore(&pic_blob).unwrap_err();
    assert!(matches!(err, MachineError::Snapshot(_)));
    assert_eq!(m.memory().read_u8(0x10), 0x55);
}

#[test]
fn invalid_configuration_is_rejected() {
    let config = MachineConfig {
        instructions_between_interrupts: 0,
        ..small_config()
    };
    assert!(matches!(
        Machine::new(config, ScriptedCpu::default()),
        Err(MachineError::InvalidConfig(_))
    ));
}

#[test]
fn oversized_bios_is_a_map_error() {
    let mut m = machine(ScriptedCpu::default());
    let err = m.set_system_bios(vec![0; 0x20_0000]).unwrap_err();
    assert!(matches!(err, MachineError::Map(_)));
}
