//! Intel 8259A programmable interrupt controller pair, cascaded the way the PC/AT wires them:
//! the slave's INT output drives master line 2.
//!
//! Ports: master command/data at `0x20`/`0x21`, slave at `0xA0`/`0xA1`, and the edge/level
//! control registers (ELCR) at `0x4D0`/`0x4D1`.

use bitflags::bitflags;
use ferrite_cpu_core::{EventFlag, InterruptController};
use ferrite_snapshot::codec::{Decoder, Encoder};
use ferrite_snapshot::{IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter};
use tracing::{debug, info, trace, warn};

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;
pub const MASTER_ELCR: u16 = 0x4D0;
pub const SLAVE_ELCR: u16 = 0x4D1;

/// Master line carrying the slave's output.
pub const CASCADE_LINE: u8 = 2;
/// Line reported when an acknowledge finds nothing pending.
pub const SPURIOUS_LINE: u8 = 7;

const MASTER_ELCR_MASK: u8 = 0xF8;
const SLAVE_ELCR_MASK: u8 = 0xDE;

/// `get_priority` result meaning "no bit set".
const NO_PRIORITY: u8 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Icw1: u8 {
        const IC4 = 1 << 0;
        const SINGLE = 1 << 1;
        const LEVEL_TRIGGERED = 1 << 3;
        const INIT = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Ocw3: u8 {
        const READ_ISR = 1 << 0;
        const READ_REGISTER = 1 << 1;
        const POLL = 1 << 2;
        const SELECT = 1 << 3;
        const SPECIAL_MASK = 1 << 5;
        const SET_SPECIAL_MASK = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Icw4: u8 {
        const AUTO_EOI = 1 << 1;
        const SPECIAL_FULLY_NESTED = 1 << 4;
    }
}

/// One 8259A.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pic8259 {
    /// Raw input levels seen on the previous `set_irq`, for edge detection.
    last_irr: u8,
    irr: u8,
    imr: u8,
    isr: u8,
    priority_add: u8,
    irq_base: u8,
    read_isr: bool,
    poll: bool,
    special_mask: bool,
    init_state: u8,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    special_fully_nested: bool,
    four_byte_init: bool,
    elcr: u8,
    elcr_mask: u8,
    is_master: bool,
}

impl Pic8259 {
    fn new(is_master: bool) -> Self {
        let elcr_mask = if is_master {
            MASTER_ELCR_MASK
        } else {
            SLAVE_ELCR_MASK
        };
        Self {
            last_irr: 0,
            irr: 0,
            imr: 0,
            isr: 0,
            priority_add: 0,
            irq_base: 0,
            read_isr: false,
            poll: false,
            special_mask: false,
            init_state: 0,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            special_fully_nested: false,
            four_byte_init: false,
            elcr: 0,
            elcr_mask,
            is_master,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.is_master);
    }

    fn set_irq(&mut self, irq: u8, level: bool) {
        let mask = 1u8 << irq;
        if self.elcr & mask != 0 {
            if level {
                self.irr |= mask;
                self.last_irr |= mask;
            } else {
                self.irr &= !mask;
                self.last_irr &= !mask;
            }
        } else if level {
            if self.last_irr & mask == 0 {
                self.irr |= mask;
            }
            self.last_irr |= mask;
        } else {
            self.last_irr &= !mask;
        }
    }

    /// Distance, in rotated priority order, of the highest priority bit in `mask`.
    fn priority(&self, mask: u8) -> u8 {
        if mask == 0 {
            return NO_PRIORITY;
        }
        let mut priority = 0;
        while mask & (1 << ((priority + self.priority_add) & 7)) == 0 {
            priority += 1;
        }
        priority
    }

    /// Line that would be acknowledged next, if any.
    fn get_irq(&self) -> Option<u8> {
        let priority = self.priority(self.irr & !self.imr);
        if priority == NO_PRIORITY {
            return None;
        }

        let mut in_service = self.isr;
        if self.special_mask {
            in_service &= !self.imr;
        }
        if self.special_fully_nested && self.is_master {
            in_service &= !(1 << CASCADE_LINE);
        }
        let current = self.priority(in_service);
        (priority < current).then_some((priority + self.priority_add) & 7)
    }

    fn int_ack(&mut self, irq: u8) {
        let mask = 1u8 << irq;
        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.priority_add = (irq + 1) & 7;
            }
        } else {
            self.isr |= mask;
        }
        // Level-triggered requests stay asserted until the device drops them.
        if self.elcr & mask == 0 {
            self.irr &= !mask;
        }
    }

    fn write_elcr(&mut self, value: u8) {
        self.elcr = value & self.elcr_mask;
    }

    fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .u8(self.last_irr)
            .u8(self.irr)
            .u8(self.imr)
            .u8(self.isr)
            .u8(self.priority_add)
            .u8(self.irq_base)
            .bool(self.read_isr)
            .bool(self.poll)
            .bool(self.special_mask)
            .u8(self.init_state)
            .bool(self.auto_eoi)
            .bool(self.rotate_on_auto_eoi)
            .bool(self.special_fully_nested)
            .bool(self.four_byte_init)
            .u8(self.elcr)
            .finish()
    }

    fn decode(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let mut d = Decoder::new(bytes);
        let mut next = Self::new(self.is_master);
        next.last_irr = d.u8()?;
        next.irr = d.u8()?;
        next.imr = d.u8()?;
        next.isr = d.u8()?;
        next.priority_add = d.u8()? & 7;
        next.irq_base = d.u8()?;
        next.read_isr = d.bool()?;
        next.poll = d.bool()?;
        next.special_mask = d.bool()?;
        next.init_state = d.u8()?.min(3);
        next.auto_eoi = d.bool()?;
        next.rotate_on_auto_eoi = d.bool()?;
        next.special_fully_nested = d.bool()?;
        next.four_byte_init = d.bool()?;
        next.elcr = d.u8()? & next.elcr_mask;
        d.finish()?;
        *self = next;
        Ok(())
    }
}

const MASTER: usize = 0;
const SLAVE: usize = 1;

/// Master/slave 8259A pair with the CPU's INTR pin modelled as a pair of request latches.
///
/// Raise and clear requests are latched rather than delivered directly; the owner forwards them
/// to the processor after each operation (see [`DualPic8259::take_intr_raise`] and
/// [`DualPic8259::take_intr_clear`]).
#[derive(Debug)]
pub struct DualPic8259 {
    pics: [Pic8259; 2],
    intr_raise: EventFlag,
    intr_clear: EventFlag,
}

impl Default for DualPic8259 {
    fn default() -> Self {
        Self::new()
    }
}

impl DualPic8259 {
    pub fn new() -> Self {
        Self {
            pics: [Pic8259::new(true), Pic8259::new(false)],
            intr_raise: EventFlag::new(),
            intr_clear: EventFlag::new(),
        }
    }

    pub fn reset(&mut self) {
        for pic in &mut self.pics {
            pic.reset();
        }
        self.intr_raise.clear();
        self.intr_clear.clear();
    }

    /// Drive input `line` (0-15; 8-15 are slave lines) to `level`.
    pub fn set_irq(&mut self, line: u8, level: bool) {
        match line {
            0..=7 => self.pics[MASTER].set_irq(line, level),
            8..=15 => self.pics[SLAVE].set_irq(line - 8, level),
            _ => {
                trace!(line, "ignoring out of range irq line");
                return;
            }
        }
        self.update_irq();
    }

    pub fn raise_irq(&mut self, line: u8) {
        self.set_irq(line, true);
    }

    pub fn lower_irq(&mut self, line: u8) {
        self.set_irq(line, false);
    }

    /// Line the master would acknowledge next, without acknowledging it.
    pub fn get_irq(&self) -> Option<u8> {
        self.pics[MASTER].get_irq()
    }

    /// Vector the next acknowledge would return, without changing any state.
    pub fn pending_vector(&self) -> Option<u8> {
        let irq = self.pics[MASTER].get_irq()?;
        if irq == CASCADE_LINE {
            let slave = &self.pics[SLAVE];
            let irq2 = slave.get_irq().unwrap_or(SPURIOUS_LINE);
            Some(slave.irq_base.wrapping_add(irq2))
        } else {
            Some(self.pics[MASTER].irq_base.wrapping_add(irq))
        }
    }

    /// Acknowledge the highest priority request and return its vector.
    ///
    /// Nothing pending on the master degrades to the master's spurious vector (`base + 7`);
    /// nothing pending on the slave behind an asserted cascade line degrades to the slave's
    /// spurious vector.
    pub fn cpu_get_interrupt(&mut self) -> u8 {
        let vector = match self.pics[MASTER].get_irq() {
            Some(irq) => {
                self.pics[MASTER].int_ack(irq);
                if irq == CASCADE_LINE {
                    let irq2 = match self.pics[SLAVE].get_irq() {
                        Some(irq2) => {
                            self.pics[SLAVE].int_ack(irq2);
                            irq2
                        }
                        None => {
                            warn!("spurious interrupt on slave pic");
                            SPURIOUS_LINE
                        }
                    };
                    self.pics[SLAVE].irq_base.wrapping_add(irq2)
                } else {
                    self.pics[MASTER].irq_base.wrapping_add(irq)
                }
            }
            None => {
                warn!("spurious interrupt on master pic");
                self.pics[MASTER].irq_base.wrapping_add(SPURIOUS_LINE)
            }
        };
        self.update_irq();
        vector
    }

    fn update_irq(&mut self) {
        if self.pics[SLAVE].get_irq().is_some() {
            // The cascade input is edge triggered; pulse it.
            self.pics[MASTER].set_irq(CASCADE_LINE, true);
            self.pics[MASTER].set_irq(CASCADE_LINE, false);
        }
        if self.pics[MASTER].get_irq().is_some() {
            self.intr_raise.set();
        }
    }

    /// Whether the controller has asked for INTR to be asserted since the last call.
    pub fn take_intr_raise(&self) -> bool {
        self.intr_raise.take()
    }

    /// Whether the controller has asked for INTR to be deasserted since the last call.
    pub fn take_intr_clear(&self) -> bool {
        self.intr_clear.take()
    }

    fn poll_read(&mut self, which: usize) -> u8 {
        match self.pics[which].get_irq() {
            Some(irq) => {
                if which == SLAVE {
                    let master = &mut self.pics[MASTER];
                    master.isr &= !(1 << CASCADE_LINE);
                    master.irr &= !(1 << CASCADE_LINE);
                }
                let pic = &mut self.pics[which];
                pic.irr &= !(1 << irq);
                pic.isr &= !(1 << irq);
                if which == SLAVE || irq != CASCADE_LINE {
                    self.update_irq();
                }
                irq
            }
            None => {
                self.update_irq();
                SPURIOUS_LINE
            }
        }
    }

    fn write_command(&mut self, which: usize, value: u8) {
        let icw1 = Icw1::from_bits_retain(value);
        if icw1.contains(Icw1::INIT) {
            let pic = &mut self.pics[which];
            pic.reset();
            pic.init_state = 1;
            pic.four_byte_init = icw1.contains(Icw1::IC4);
            self.intr_raise.clear();
            self.intr_clear.set();
            if icw1.contains(Icw1::SINGLE) {
                info!(which, "single pic mode not supported");
            }
            if icw1.contains(Icw1::LEVEL_TRIGGERED) {
                info!(which, "level sensitive irq via icw1 not supported; use elcr");
            }
            debug!(which, "pic init sequence started");
            return;
        }

        let ocw3 = Ocw3::from_bits_retain(value);
        if ocw3.contains(Ocw3::SELECT) {
            let pic = &mut self.pics[which];
            if ocw3.contains(Ocw3::POLL) {
                pic.poll = true;
            }
            if ocw3.contains(Ocw3::READ_REGISTER) {
                pic.read_isr = ocw3.contains(Ocw3::READ_ISR);
            }
            if ocw3.contains(Ocw3::SET_SPECIAL_MASK) {
                pic.special_mask = ocw3.contains(Ocw3::SPECIAL_MASK);
            }
            return;
        }

        // OCW2
        let pic = &mut self.pics[which];
        let command = value >> 5;
        match command {
            0 | 4 => pic.rotate_on_auto_eoi = command == 4,
            1 | 5 => {
                let priority = pic.priority(pic.isr);
                if priority != NO_PRIORITY {
                    let irq = (priority + pic.priority_add) & 7;
                    pic.isr &= !(1 << irq);
                    if command == 5 {
                        pic.priority_add = (irq + 1) & 7;
                    }
                    self.update_irq();
                }
            }
            3 => {
                pic.isr &= !(1 << (value & 7));
                self.update_irq();
            }
            6 => {
                pic.priority_add = (value + 1) & 7;
                self.update_irq();
            }
            7 => {
                let irq = value & 7;
                pic.isr &= !(1 << irq);
                pic.priority_add = (irq + 1) & 7;
                self.update_irq();
            }
            _ => {}
        }
    }

    fn write_data(&mut self, which: usize, value: u8) {
        let pic = &mut self.pics[which];
        match pic.init_state {
            0 => {
                pic.imr = value;
                self.update_irq();
            }
            1 => {
                pic.irq_base = value & 0xF8;
                pic.init_state = 2;
            }
            2 => {
                pic.init_state = if pic.four_byte_init { 3 } else { 0 };
            }
            _ => {
                let icw4 = Icw4::from_bits_truncate(value);
                pic.special_fully_nested = icw4.contains(Icw4::SPECIAL_FULLY_NESTED);
                pic.auto_eoi = icw4.contains(Icw4::AUTO_EOI);
                pic.init_state = 0;
            }
        }
    }

    pub fn port_read_u8(&mut self, port: u16) -> u8 {
        let (which, data_port) = match port {
            MASTER_CMD | MASTER_DATA => (MASTER, port == MASTER_DATA),
            SLAVE_CMD | SLAVE_DATA => (SLAVE, port == SLAVE_DATA),
            MASTER_ELCR => return self.pics[MASTER].elcr,
            SLAVE_ELCR => return self.pics[SLAVE].elcr,
            _ => return 0xFF,
        };

        if self.pics[which].poll {
            let value = self.poll_read(which);
            self.pics[which].poll = false;
            return value;
        }
        let pic = &self.pics[which];
        match (data_port, pic.read_isr) {
            (true, _) => pic.imr,
            (false, true) => pic.isr,
            (false, false) => pic.irr,
        }
    }

    pub fn port_write_u8(&mut self, port: u16, value: u8) {
        match port {
            MASTER_CMD => self.write_command(MASTER, value),
            MASTER_DATA => self.write_data(MASTER, value),
            SLAVE_CMD => self.write_command(SLAVE, value),
            SLAVE_DATA => self.write_data(SLAVE, value),
            MASTER_ELCR => self.pics[MASTER].write_elcr(value),
            SLAVE_ELCR => self.pics[SLAVE].write_elcr(value),
            _ => trace!(port, value, "write to non-pic port"),
        }
    }

    /// Program both controllers the way a PC BIOS does: cascade on line 2, 8086 mode, all
    /// lines unmasked.
    pub fn init_legacy(&mut self, master_base: u8, slave_base: u8) {
        self.port_write_u8(MASTER_CMD, 0x11);
        self.port_write_u8(MASTER_DATA, master_base);
        self.port_write_u8(MASTER_DATA, 1 << CASCADE_LINE);
        self.port_write_u8(MASTER_DATA, 0x01);

        self.port_write_u8(SLAVE_CMD, 0x11);
        self.port_write_u8(SLAVE_DATA, slave_base);
        self.port_write_u8(SLAVE_DATA, CASCADE_LINE);
        self.port_write_u8(SLAVE_DATA, 0x01);
    }

    pub fn vector_bases(&self) -> (u8, u8) {
        (self.pics[MASTER].irq_base, self.pics[SLAVE].irq_base)
    }
}

impl InterruptController for DualPic8259 {
    fn cpu_get_interrupt(&mut self) -> u8 {
        DualPic8259::cpu_get_interrupt(self)
    }
}

const TAG_MASTER: u16 = 1;
const TAG_SLAVE: u16 = 2;
const TAG_INTR_RAISE: u16 = 3;
const TAG_INTR_CLEAR: u16 = 4;

impl IoSnapshot for DualPic8259 {
    const DEVICE_ID: [u8; 4] = *b"PIC8";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_MASTER, self.pics[MASTER].encode());
        w.field_bytes(TAG_SLAVE, self.pics[SLAVE].encode());
        w.field_bool(TAG_INTR_RAISE, self.intr_raise.peek());
        w.field_bool(TAG_INTR_CLEAR, self.intr_clear.peek());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let mut pics = self.pics.clone();
        if let Some(buf) = r.bytes(TAG_MASTER) {
            pics[MASTER].decode(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_SLAVE) {
            pics[SLAVE].decode(buf)?;
        }
        let raise = r.bool(TAG_INTR_RAISE)?.unwrap_or(false);
        let clear = r.bool(TAG_INTR_CLEAR)?.unwrap_or(false);

        self.pics = pics;
        self.intr_raise.clear();
        self.intr_clear.clear();
        if raise {
            self.intr_raise.set();
        }
        if clear {
            self.intr_clear.set();
        }
        Ok(())
    }
}
