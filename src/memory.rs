use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    address::{AddressBlock, AddressMapBuilder},
    device::BusDevice,
    storage::{read_buffer, write_buffer, MediaStore, MediumBuffer, StorageMedium},
};

/// Plain read/write memory.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct Ram {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Ram {
    pub fn new(base: u32, size: u32) -> Self {
        Ram {
            base,
            data: vec![0; size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn load(&mut self, offset: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            if let Some(slot) = self.data.get_mut(offset as usize + i) {
                *slot = *byte;
            }
        }
    }
}

impl fmt::Display for Ram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RAM base={:#06X} size={:#06X}", self.base, self.size())
    }
}

impl BusDevice for Ram {
    fn name(&self) -> String {
        self.to_string()
    }

    fn preferred_block(&self, _placed: &AddressMapBuilder) -> AddressBlock {
        AddressBlock::new(self.base, self.size())
    }

    fn read(&mut self, offset: u32) -> u8 {
        match self.data.get(offset as usize) {
            Some(value) => *value,
            None => {
                tracing::warn!(
                    "Attempt to read from out of bounds RAM offset {:#06X}, returning 0xFF",
                    offset
                );
                0xFF
            }
        }
    }

    fn write(&mut self, offset: u32, value: u8) {
        if let Some(slot) = self.data.get_mut(offset as usize) {
            *slot = value;
        }
    }
}

/// Firmware memory backed by an EEPROM storage medium.
///
/// Bus writes are dropped while write protection is on; `poke` (firmware
/// burn-in) always goes through.
#[derive(Debug)]
pub struct Eeprom {
    pub base: u32,
    pub write_protected: bool,
    medium: StorageMedium,
    buffer: MediumBuffer,
}

impl Eeprom {
    pub fn new(base: u32, mut medium: StorageMedium, store: &mut MediaStore) -> anyhow::Result<Self> {
        let buffer = medium.data(store)?;
        Ok(Self {
            base,
            write_protected: true,
            medium,
            buffer,
        })
    }

    pub fn medium(&self) -> &StorageMedium {
        &self.medium
    }

    pub fn size(&self) -> u32 {
        self.medium.capacity() as u32
    }

    pub fn contents(&self) -> Vec<u8> {
        read_buffer(&self.buffer).clone()
    }
}

impl BusDevice for Eeprom {
    fn name(&self) -> String {
        format!("EEPROM base={:#06X} size={:#06X}", self.base, self.size())
    }

    fn preferred_block(&self, _placed: &AddressMapBuilder) -> AddressBlock {
        AddressBlock::new(self.base, self.size())
    }

    fn read(&mut self, offset: u32) -> u8 {
        read_buffer(&self.buffer)
            .get(offset as usize)
            .copied()
            .unwrap_or(0xFF)
    }

    fn write(&mut self, offset: u32, value: u8) {
        if self.write_protected {
            tracing::trace!("Attempt to write to EEPROM offset {:#06X}", offset);
            return;
        }
        self.poke(offset, value);
    }

    fn poke(&mut self, offset: u32, value: u8) {
        if let Some(slot) = write_buffer(&self.buffer).get_mut(offset as usize) {
            *slot = value;
        }
    }
}
