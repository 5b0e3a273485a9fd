// +-----------------+-------------------------------------------+
// | Range           | Description (default layout)              |
// +-----------------+-------------------------------------------+
// | 0x0000-0x6FFF   | RAM                                       |
// | 0x7000-0xBFFF   | Graphics (not emulated)                   |
// | 0xC000-0xCFFF   | EEPROM (firmware)                         |
// | 0xD000          | Disk controller (not emulated)            |
// | 0x10000         | Bus controller status port (I/O port 00)  |
// | 0x10002-...     | Serial port manager (I/O port 02 onwards) |
// +-----------------+-------------------------------------------+
//
// Memory addresses occupy 0x0000-0xFFFF; I/O port `p` of the CPU lives at
// 0x10000 + p on the same bus.
use std::{cell::RefCell, rc::Rc};

use crate::controller::BusController;

pub const IO_BASE: u32 = 0x10000;

/// What the CPU core sees of the bus.
pub trait MemoryBus {
    fn read(&mut self, address: u32) -> u8;
    fn write(&mut self, address: u32, value: u8);

    /// Writes firmware bytes, bypassing device write protection.
    fn load(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write(address.wrapping_add(i as u32), *byte);
        }
    }

    fn read_word(&mut self, address: u16) -> u16 {
        let low_byte = self.read(address as u32) as u16;
        let high_byte = self.read(address.wrapping_add(1) as u32) as u16;
        (high_byte << 8) | low_byte
    }

    fn write_word(&mut self, address: u16, value: u16) {
        self.write(address as u32, (value & 0x00FF) as u8);
        self.write(address.wrapping_add(1) as u32, (value >> 8) as u8);
    }
}

/// CPU-side handle on a bus controller.
///
/// Unmapped reads float to `unmapped_value` and unmapped writes are dropped,
/// so the CPU never sees a bus error.
#[derive(Debug, Clone)]
pub struct SharedBus {
    pub controller: Rc<RefCell<BusController>>,
    pub unmapped_value: u8,
}

impl SharedBus {
    pub fn new(controller: Rc<RefCell<BusController>>, unmapped_value: u8) -> Self {
        Self {
            controller,
            unmapped_value,
        }
    }
}

impl MemoryBus for SharedBus {
    fn read(&mut self, address: u32) -> u8 {
        match self.controller.borrow().map_and_read(address) {
            Ok(value) => value,
            Err(err) => {
                tracing::trace!("[BUS] {} on read, returning {:02X}", err, self.unmapped_value);
                self.unmapped_value
            }
        }
    }

    fn write(&mut self, address: u32, value: u8) {
        if let Err(err) = self.controller.borrow().map_and_write(address, value) {
            tracing::trace!("[BUS] {} on write of {:02X}", err, value);
        }
    }

    fn load(&mut self, address: u32, data: &[u8]) {
        let controller = self.controller.borrow();
        for (i, byte) in data.iter().enumerate() {
            let target = address.wrapping_add(i as u32);
            if let Err(err) = controller.map_and_poke(target, *byte) {
                tracing::warn!("[BUS] Firmware byte dropped: {}", err);
            }
        }
    }
}

/// 64K of flat RAM plus 256 I/O ports, for running the CPU without a topology.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    pub data: Vec<u8>,
    pub ports: [u8; 256],
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            data: vec![0; 0x10000],
            ports: [0xFF; 256],
        }
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus for FlatMemory {
    fn read(&mut self, address: u32) -> u8 {
        if address >= IO_BASE {
            return self.ports[((address - IO_BASE) & 0xFF) as usize];
        }
        self.data[(address & 0xFFFF) as usize]
    }

    fn write(&mut self, address: u32, value: u8) {
        if address >= IO_BASE {
            self.ports[((address - IO_BASE) & 0xFF) as usize] = value;
            return;
        }
        self.data[(address & 0xFFFF) as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Ram, topology::Topology};

    #[test]
    fn test_unmapped_access_floats() {
        let mut topology = Topology::new();
        let root = topology.add_controller();
        let (ram, _) = topology.add_device(Rc::new(RefCell::new(Ram::new(0, 0x100))));
        topology.connect(root, ram);

        let controller = Rc::new(RefCell::new(BusController::new(root)));
        controller.borrow_mut().scan(&topology).unwrap();
        let mut bus = SharedBus::new(controller, 0xFF);

        bus.write_word(0x00FE, 0xBEEF);
        assert_eq!(bus.read_word(0x00FE), 0xBEEF);
        assert_eq!(bus.read(0x0100), 0xFF);
        bus.write(0x0100, 0x12);
        assert_eq!(bus.read(0x0100), 0xFF);
    }

    #[test]
    fn test_word_access_wraps() {
        let mut memory = FlatMemory::new();
        memory.write_word(0xFFFF, 0x1234);
        assert_eq!(memory.data[0xFFFF], 0x34);
        assert_eq!(memory.data[0x0000], 0x12);
        assert_eq!(memory.read_word(0xFFFF), 0x1234);
    }
}
