//! Port I/O view of the shared interrupt controller.

use std::cell::RefCell;
use std::rc::Rc;

use ferrite_interrupts::pic8259::{
    MASTER_CMD, MASTER_DATA, MASTER_ELCR, SLAVE_CMD, SLAVE_DATA, SLAVE_ELCR,
};
use ferrite_interrupts::DualPic8259;

use crate::io::{IoPortBus, PortIoDevice};

pub type SharedPic = Rc<RefCell<DualPic8259>>;

/// Every port the controller pair decodes.
pub const PIC_PORTS: [u16; 6] = [
    MASTER_CMD,
    MASTER_DATA,
    SLAVE_CMD,
    SLAVE_DATA,
    MASTER_ELCR,
    SLAVE_ELCR,
];

/// One port of a [`SharedPic`]. Word and dword accesses are split into byte accesses on
/// consecutive ports, low byte first.
pub struct PicPort {
    pic: SharedPic,
    port: u16,
}

impl PicPort {
    pub fn new(pic: SharedPic, port: u16) -> Self {
        Self { pic, port }
    }
}

impl PortIoDevice for PicPort {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        debug_assert_eq!(port, self.port);
        let mut pic = self.pic.borrow_mut();
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().take(usize::from(size)).enumerate() {
            *byte = pic.port_read_u8(port.wrapping_add(i as u16));
        }
        u32::from_le_bytes(bytes)
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        debug_assert_eq!(port, self.port);
        let mut pic = self.pic.borrow_mut();
        for (i, byte) in value.to_le_bytes().into_iter().take(usize::from(size)).enumerate() {
            pic.port_write_u8(port.wrapping_add(i as u16), byte);
        }
    }

    fn reset(&mut self) {
        // Every port shares one controller; only the command port resets it.
        if self.port == MASTER_CMD {
            self.pic.borrow_mut().reset();
        }
    }
}

pub fn register_pic(bus: &mut IoPortBus, pic: &SharedPic) {
    for port in PIC_PORTS {
        bus.register(port, Box::new(PicPort::new(pic.clone(), port)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_pic() -> (IoPortBus, SharedPic) {
        let pic = Rc::new(RefCell::new(DualPic8259::new()));
        let mut bus = IoPortBus::new();
        register_pic(&mut bus, &pic);
        (bus, pic)
    }

    fn init_legacy_pc(bus: &mut IoPortBus) {
        bus.write_u8(MASTER_CMD, 0x11);
        bus.write_u8(MASTER_DATA, 0x20);
        bus.write_u8(MASTER_DATA, 0x04);
        bus.write_u8(MASTER_DATA, 0x01);

        bus.write_u8(SLAVE_CMD, 0x11);
        bus.write_u8(SLAVE_DATA, 0x28);
        bus.write_u8(SLAVE_DATA, 0x02);
        bus.write_u8(SLAVE_DATA, 0x01);
    }

    #[test]
    fn eoi_through_the_bus_clears_in_service() {
        let (mut bus, pic) = bus_with_pic();
        init_legacy_pc(&mut bus);

        pic.borrow_mut().raise_irq(1);
        assert_eq!(pic.borrow_mut().cpu_get_interrupt(), 0x21);

        bus.write_u8(MASTER_CMD, 0x0B);
        assert_eq!(bus.read_u8(MASTER_CMD), 0x02);
        bus.write_u8(MASTER_CMD, 0x20);
        assert_eq!(bus.read_u8(MASTER_CMD), 0x00);
    }

    #[test]
    fn word_write_splits_into_command_and_data() {
        let (mut bus, pic) = bus_with_pic();
        init_legacy_pc(&mut bus);

        // OCW3 "read IRR" to 0x20 and IMR 0xAA to 0x21 in one access.
        bus.write(MASTER_CMD, 2, 0xAA0A);
        assert_eq!(bus.read(MASTER_CMD, 2), 0xAA00);

        pic.borrow_mut().raise_irq(0);
        assert_eq!(bus.read(MASTER_CMD, 2), 0xAA01);
    }

    #[test]
    fn elcr_pair_is_readable_as_a_word() {
        let (mut bus, _pic) = bus_with_pic();
        bus.write(MASTER_ELCR, 2, 0xFFFF);
        assert_eq!(bus.read(MASTER_ELCR, 2), 0xDEF8);
    }

    #[test]
    fn bus_reset_reinitialises_the_controller_once() {
        let (mut bus, pic) = bus_with_pic();
        init_legacy_pc(&mut bus);
        bus.write_u8(MASTER_DATA, 0xFF);

        bus.reset();
        assert_eq!(pic.borrow().vector_bases(), (0, 0));
        assert_eq!(bus.read_u8(MASTER_DATA), 0x00);
    }
}
