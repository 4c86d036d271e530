use std::collections::HashMap;

use tracing::trace;

/// A device reachable through `IN`/`OUT`.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Return to the power-on state.
    fn reset(&mut self) {}
}

/// Value an undriven bus floats to for an access of `size` bytes.
fn floating(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// 64K I/O port space, one device per decoded port.
#[derive(Default)]
pub struct IoPortBus {
    ports: HashMap<u16, Box<dyn PortIoDevice>>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `port` to `device`, replacing any previous registration.
    pub fn register(&mut self, port: u16, device: Box<dyn PortIoDevice>) {
        self.ports.insert(port, device);
    }

    /// Sizes other than 1, 2 and 4 are not dispatched; size 0 reads as 0.
    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }
        if !matches!(size, 1 | 2 | 4) {
            return floating(size);
        }
        match self.ports.get_mut(&port) {
            Some(dev) => dev.read(port, size),
            None => {
                trace!(port = format_args!("{port:#06x}"), size, "read from unmapped port");
                floating(size)
            }
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        match self.ports.get_mut(&port) {
            Some(dev) => dev.write(port, size, value),
            None => trace!(
                port = format_args!("{port:#06x}"),
                size,
                value,
                "write to unmapped port"
            ),
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, u32::from(value));
    }

    pub fn reset(&mut self) {
        for dev in self.ports.values_mut() {
            dev.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;

    struct Latch {
        value: Rc<RefCell<u32>>,
        resets: Rc<Cell<u32>>,
    }

    impl PortIoDevice for Latch {
        fn read(&mut self, _port: u16, _size: u8) -> u32 {
            *self.value.borrow()
        }

        fn write(&mut self, _port: u16, _size: u8, value: u32) {
            *self.value.borrow_mut() = value;
        }

        fn reset(&mut self) {
            self.resets.set(self.resets.get() + 1);
            *self.value.borrow_mut() = 0;
        }
    }

    fn latch() -> (Latch, Rc<RefCell<u32>>, Rc<Cell<u32>>) {
        let value = Rc::new(RefCell::new(0));
        let resets = Rc::new(Cell::new(0));
        (
            Latch {
                value: value.clone(),
                resets: resets.clone(),
            },
            value,
            resets,
        )
    }

    #[test]
    fn unmapped_ports_float_high() {
        let mut bus = IoPortBus::new();
        assert_eq!(bus.read(0x80, 1), 0xFF);
        assert_eq!(bus.read(0x80, 2), 0xFFFF);
        assert_eq!(bus.read(0x80, 4), 0xFFFF_FFFF);
        assert_eq!(bus.read(0x80, 0), 0);
        bus.write(0x80, 1, 0x12);
    }

    #[test]
    fn invalid_sizes_are_not_dispatched() {
        let mut bus = IoPortBus::new();
        let (dev, value, _) = latch();
        bus.register(0x1234, Box::new(dev));

        bus.write(0x1234, 3, 0xDEAD_BEEF);
        assert_eq!(*value.borrow(), 0);
        assert_eq!(bus.read(0x1234, 3), 0xFFFF_FFFF);

        bus.write(0x1234, 4, 0x1234_5678);
        assert_eq!(bus.read(0x1234, 4), 0x1234_5678);
    }

    #[test]
    fn registration_replaces_previous_device() {
        let mut bus = IoPortBus::new();
        let (first, first_value, _) = latch();
        let (second, second_value, _) = latch();
        *first_value.borrow_mut() = 0x11;
        *second_value.borrow_mut() = 0x22;

        bus.register(0x60, Box::new(first));
        assert_eq!(bus.read_u8(0x60), 0x11);
        bus.register(0x60, Box::new(second));
        assert_eq!(bus.read_u8(0x60), 0x22);
        assert_eq!(bus.read_u8(0x61), 0xFF);
    }

    #[test]
    fn reset_reaches_every_registered_device() {
        let mut bus = IoPortBus::new();
        let (a, a_value, a_resets) = latch();
        let (b, _, b_resets) = latch();
        bus.register(0x70, Box::new(a));
        bus.register(0x71, Box::new(b));

        bus.write_u8(0x70, 0x8F);
        assert_eq!(*a_value.borrow(), 0x8F);

        bus.reset();
        assert_eq!((a_resets.get(), b_resets.get()), (1, 1));
        assert_eq!(bus.read_u8(0x70), 0);
    }
}
