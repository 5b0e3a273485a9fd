use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceInfo, SharedDevice};

/// A contiguous, half-open range of bus addresses.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AddressBlock {
    pub start: u32,
    pub length: u32,
}

impl AddressBlock {
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    /// Block that occupies nothing, for devices that don't want to be mapped.
    pub const fn empty() -> Self {
        Self {
            start: 0,
            length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// One past the last address, widened so blocks ending at `u32::MAX` don't wrap.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.end()
    }

    pub fn overlaps(&self, other: &AddressBlock) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "0x{:05X} (empty)", self.start);
        }
        write!(f, "0x{:05X} - 0x{:05X}", self.start, self.end() - 1)
    }
}

#[derive(Clone)]
pub struct MapEntry {
    pub block: AddressBlock,
    pub info: DeviceInfo,
    pub device: SharedDevice,
}

impl fmt::Debug for MapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapEntry")
            .field("block", &self.block)
            .field("info", &self.info)
            .finish()
    }
}

/// Immutable address-to-device table produced by a scan.
///
/// Entries are sorted by start address and never overlap, so lookups are a
/// binary search. A published map is never mutated; a rescan builds a new one.
#[derive(Debug, Default, Clone)]
pub struct AddressMap {
    entries: Vec<MapEntry>,
}

impl AddressMap {
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a global address to the owning entry and the device-local offset.
    pub fn resolve(&self, address: u32) -> Option<(&MapEntry, u32)> {
        let idx = self
            .entries
            .partition_point(|entry| entry.block.start <= address);
        if idx == 0 {
            return None;
        }

        let entry = &self.entries[idx - 1];
        if entry.block.contains(address) {
            Some((entry, address - entry.block.start))
        } else {
            None
        }
    }

    pub fn block_of(&self, id: DeviceId) -> Option<AddressBlock> {
        self.entries
            .iter()
            .find(|entry| entry.info.id == id)
            .map(|entry| entry.block)
    }
}

impl fmt::Display for AddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{} {}", entry.block, entry.info)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub existing: DeviceInfo,
    pub existing_block: AddressBlock,
    pub block: AddressBlock,
}

/// In-progress map used while a scan places devices.
#[derive(Debug, Default)]
pub struct AddressMapBuilder {
    entries: Vec<MapEntry>,
}

impl AddressMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `block` collides with nothing placed so far.
    pub fn is_free(&self, block: AddressBlock) -> bool {
        block.is_empty() || self.entries.iter().all(|e| !e.block.overlaps(&block))
    }

    /// First free block of `length` bytes at or after `from`, for devices that
    /// pick their own placement.
    pub fn first_free(&self, from: u32, length: u32) -> Option<AddressBlock> {
        let mut candidate = AddressBlock::new(from, length);
        loop {
            if candidate.end() > u32::MAX as u64 + 1 {
                return None;
            }
            match self.entries.iter().find(|e| e.block.overlaps(&candidate)) {
                None => return Some(candidate),
                Some(hit) => {
                    let next = hit.block.end();
                    if next > u32::MAX as u64 {
                        return None;
                    }
                    candidate.start = next as u32;
                }
            }
        }
    }

    /// Places `device` at its preferred block. Overlaps are not resolved here:
    /// the caller fails the scan.
    pub fn propose(
        &mut self,
        info: DeviceInfo,
        device: SharedDevice,
        preferred: AddressBlock,
    ) -> Result<AddressBlock, Overlap> {
        if preferred.is_empty() {
            return Ok(preferred);
        }

        if let Some(hit) = self.entries.iter().find(|e| e.block.overlaps(&preferred)) {
            return Err(Overlap {
                existing: hit.info.clone(),
                existing_block: hit.block,
                block: preferred,
            });
        }

        self.entries.push(MapEntry {
            block: preferred,
            info,
            device,
        });
        Ok(preferred)
    }

    pub fn build(mut self) -> AddressMap {
        self.entries.sort_by_key(|entry| entry.block.start);
        AddressMap {
            entries: self.entries,
        }
    }
}
