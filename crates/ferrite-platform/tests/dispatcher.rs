mod common;

use common::{machine, small_config, ScriptedCpu, Step, RESET_IP};
use ferrite_cpu_core::{CpuExit, CpuMode, ExceptionKind, ProcessorException};
use ferrite_memory::ExecError;
use ferrite_platform::{Machine, MachineConfig, MachineError, SliceExit};

#[test]
fn one_call_runs_at_most_one_hundred_blocks() {
    let mut m = machine(ScriptedCpu::default());
    assert_eq!(m.execute().unwrap(), 100);
    assert_eq!(m.cpu().blocks.len(), 100);

    assert_eq!(m.execute().unwrap(), 100);
    assert_eq!(m.cpu().blocks.len(), 200);
}

#[test]
fn returns_retired_instruction_count() {
    let mut m = machine(ScriptedCpu::with_script(
        std::iter::repeat(Step::Retire(3)).take(100),
    ));
    assert_eq!(m.execute().unwrap(), 300);
    assert_eq!(m.cpu().ip, RESET_IP + 300);
}

#[test]
fn interrupts_are_offered_after_every_instruction_by_default() {
    let mut m = machine(ScriptedCpu::default());
    m.execute().unwrap();
    let polls = &m.cpu().interrupt_polls;
    assert_eq!(polls.len(), 100);
    assert!(polls.iter().all(|&(mode, n)| mode == CpuMode::Real && n == 1));
}

#[test]
fn interrupt_cadence_carries_across_slices() {
    let config = MachineConfig {
        max_blocks_per_slice: 10,
        instructions_between_interrupts: 4,
        ..small_config()
    };
    let mut m = Machine::new(config, ScriptedCpu::default()).unwrap();

    assert_eq!(m.execute().unwrap(), 10);
    assert_eq!(m.cpu().interrupt_polls, vec![(CpuMode::Real, 4); 2]);

    // Two instructions were left over; the next poll comes after two more.
    m.execute().unwrap();
    assert_eq!(m.cpu().interrupt_polls.len(), 5);
    assert_eq!(m.cpu().blocks.len(), 20);
}

#[test]
fn pending_irq_is_acknowledged_during_the_slice() {
    let mut m = machine(ScriptedCpu::default());
    m.set_irq(4, true);
    assert!(m.cpu().intr);

    m.execute().unwrap();
    assert_eq!(m.cpu().vectors, vec![0x0C]);
    assert!(!m.cpu().intr);

    // A lower priority line raised mid-service is held back until EOI.
    m.set_irq(6, true);
    assert!(!m.cpu().intr);
    m.io_write(0x20, 1, 0x20);
    assert!(m.cpu().intr);
    m.execute().unwrap();
    assert_eq!(m.cpu().vectors, vec![0x0C, 0x0E]);
}

#[test]
fn mode_switch_ends_the_slice_and_next_slice_uses_new_mode() {
    let mut m = machine(ScriptedCpu::with_script([
        Step::Retire(1),
        Step::Retire(1),
        Step::EnterProtectedMode,
    ]));
    let slice = m.execute_slice().unwrap();
    assert_eq!(slice.executed, 2);
    assert_eq!(slice.exit, SliceExit::ModeSwitch);

    m.execute().unwrap();
    let blocks = &m.cpu().blocks;
    assert_eq!(blocks[2].0, CpuMode::Real);
    assert!(blocks[3..].iter().all(|&(mode, _)| mode == CpuMode::Protected));
}

#[test]
fn virtual8086_mode_fetches_through_the_linear_space() {
    let mut cpu = ScriptedCpu::default();
    cpu.protected = true;
    cpu.virtual8086 = true;
    let mut m = machine(cpu);
    m.execute().unwrap();
    assert_eq!(m.cpu().blocks[0], (CpuMode::Virtual8086, RESET_IP));
}

#[test]
fn exception_goes_to_the_handler_and_ends_the_slice() {
    let gp = ProcessorException::GENERAL_PROTECTION_0;
    let mut m = machine(ScriptedCpu::with_script([
        Step::Retire(5),
        Step::Exit(CpuExit::Exception(gp)),
    ]));

    let slice = m.execute_slice().unwrap();
    assert_eq!(slice.executed, 5);
    assert_eq!(slice.exit, SliceExit::Exception(gp));
    assert_eq!(m.cpu().exceptions, vec![(CpuMode::Real, gp)]);
    assert!(!m.get_and_clear_triple_faulted());
}

#[test]
fn triple_fault_resets_machine_and_latches_flags_once() {
    let mut m = machine(ScriptedCpu::with_script([
        Step::Retire(1),
        Step::Exit(CpuExit::TripleFault),
    ]));
    m.memory_mut().write_u32(0x1000, 0xDEAD_BEEF);

    assert_eq!(m.execute().unwrap(), 1);
    assert_eq!(m.cpu().resets, 1);
    assert_eq!(m.memory().read_u32(0x1000), 0);

    assert!(m.get_and_clear_triple_faulted());
    assert!(!m.get_and_clear_triple_faulted());
    assert!(m.get_and_clear_trace_trap());
    assert!(!m.get_and_clear_trace_trap());
}

#[test]
fn escalating_exception_handler_is_a_triple_fault() {
    let mut cpu = ScriptedCpu::with_script([Step::Exit(CpuExit::Exception(
        ProcessorException::with_error_code(ExceptionKind::PageFault, 2, true),
    ))]);
    cpu.escalate_exceptions = true;
    let mut m = machine(cpu);

    let slice = m.execute_slice().unwrap();
    assert_eq!(slice.exit, SliceExit::TripleFault);
    assert_eq!(m.cpu().resets, 1);
    assert!(m.get_and_clear_triple_faulted());
}

#[test]
fn trace_trap_stops_after_the_current_block() {
    let mut m = machine(ScriptedCpu::default());
    let trap = m.trace_trap();
    m.cpu_mut().trap_after = Some((7, trap));

    let slice = m.execute_slice().unwrap();
    assert_eq!(slice.executed, 7);
    assert_eq!(slice.exit, SliceExit::TraceTrap);
    assert!(m.get_and_clear_trace_trap());
    assert!(!m.get_and_clear_trace_trap());

    m.cpu_mut().trap_after = None;
    assert_eq!(m.execute().unwrap(), 100);
}

#[test]
fn fetching_from_unconnected_memory_is_an_error() {
    let mut cpu = ScriptedCpu::default();
    cpu.ip = 0x0020_0000;
    let mut m = machine(cpu);
    assert_eq!(
        m.execute(),
        Err(MachineError::Exec(ExecError::Unconnected { addr: 0x0020_0000 }))
    );
    assert!(m.cpu().blocks.is_empty());
}

#[test]
fn unconnected_fetch_reports_instructions_already_retired() {
    let mut m = machine(ScriptedCpu::with_script([
        Step::Retire(4),
        Step::Retire(2),
        Step::Jump(0x0020_0000),
    ]));

    let slice = m.execute_slice().unwrap();
    assert_eq!(slice.executed, 7);
    assert_eq!(
        slice.exit,
        SliceExit::Unconnected(ExecError::Unconnected { addr: 0x0020_0000 })
    );
    assert_eq!(m.cpu().blocks.len(), 3);
    assert_eq!(m.cpu().resets, 0);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn slice_never_exceeds_block_budget(
            counts in proptest::collection::vec(1u32..8, 0..250),
            max_blocks in 1u32..150,
            cadence in 1u32..6,
        ) {
            let config = MachineConfig {
                max_blocks_per_slice: max_blocks,
                instructions_between_interrupts: cadence,
                ..small_config()
            };
            let script = counts.iter().map(|&n| Step::Retire(n));
            let mut m = Machine::new(config, ScriptedCpu::with_script(script)).unwrap();

            let executed = m.execute().unwrap();
            let blocks = m.cpu().blocks.len();
            prop_assert_eq!(blocks, max_blocks as usize);

            // Scripted blocks first, then the default single-instruction blocks.
            let expected: u32 = counts
                .iter()
                .copied()
                .chain(std::iter::repeat(1))
                .take(blocks)
                .sum();
            prop_assert_eq!(executed, expected);

            let polled: u32 = m.cpu().interrupt_polls.iter().map(|&(_, n)| n).sum();
            prop_assert!(polled <= executed);
            prop_assert!(executed - polled < cadence);
        }
    }
}
