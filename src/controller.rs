use std::{cell::Cell, rc::Rc};

use thiserror::Error;

use crate::{
    address::{AddressBlock, AddressMap, AddressMapBuilder},
    device::{BusDevice, DeviceInfo},
    topology::{ElementId, Topology},
};

/// Default I/O address of the controller's own status port.
pub const CONTROLLER_PORT_ADDRESS: u32 = 0x10000;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_MULTIPLE_CONTROLLERS: u8 = 0x01;
pub const STATUS_ADDRESSES_OVERLAP: u8 = 0x02;
pub const STATUS_SEGMENT_FAILED: u8 = 0x03;
pub const STATUS_NOT_SCANNED: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("multiple bus controllers detected ({})", .controllers.len())]
    MultipleControllers { controllers: Vec<ElementId> },

    #[error("address ranges overlap: {first} at {first_block} and {second} at {second_block}")]
    AddressesOverlap {
        first: DeviceInfo,
        first_block: AddressBlock,
        second: DeviceInfo,
        second_block: AddressBlock,
    },

    #[error("segment failed: {device}: {reason}")]
    SegmentFailed { device: DeviceInfo, reason: String },
}

impl ScanError {
    /// Localization key for the operator-facing message.
    pub fn key(&self) -> &'static str {
        match self {
            ScanError::MultipleControllers { .. } => "retrobus.scan.multiple_controllers",
            ScanError::AddressesOverlap { .. } => "retrobus.scan.addresses_overlap",
            ScanError::SegmentFailed { .. } => "retrobus.scan.segment_failed",
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            ScanError::MultipleControllers { .. } => STATUS_MULTIPLE_CONTROLLERS,
            ScanError::AddressesOverlap { .. } => STATUS_ADDRESSES_OVERLAP,
            ScanError::SegmentFailed { .. } => STATUS_SEGMENT_FAILED,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("address {0:#07X} is not mapped")]
    Unmapped(u32),
}

/// Owns the address map of one bus segment and rebuilds it on scan.
///
/// The published map is an `Rc` snapshot; a scan builds a new map off to the
/// side and only swaps it in once every device has been placed and
/// initialized. Anyone holding the old `Rc` keeps seeing the old map.
#[derive(Debug)]
pub struct BusController {
    element: ElementId,
    map: Rc<AddressMap>,
    scan_requested: Rc<Cell<bool>>,
    status: Rc<Cell<u8>>,
    last_error: Option<ScanError>,
    scans: u64,
}

impl BusController {
    pub fn new(element: ElementId) -> Self {
        Self {
            element,
            map: Rc::new(AddressMap::default()),
            scan_requested: Rc::new(Cell::new(false)),
            status: Rc::new(Cell::new(STATUS_NOT_SCANNED)),
            last_error: None,
            scans: 0,
        }
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    /// Requests a scan at the next tick. Repeated requests coalesce.
    pub fn schedule_scan(&self) {
        if !self.scan_requested.replace(true) {
            tracing::debug!("[CONTROLLER] Scan scheduled");
        }
    }

    /// Withdraws a scan that has not started yet.
    pub fn cancel_scan(&self) {
        self.scan_requested.set(false);
    }

    pub fn scan_pending(&self) -> bool {
        self.scan_requested.get()
    }

    /// Number of scans that ran, successful or not.
    pub fn scan_count(&self) -> u64 {
        self.scans
    }

    /// Runs the scan if one was requested.
    pub fn run_pending_scan(&mut self, topology: &Topology) -> Option<Result<(), ScanError>> {
        if self.scan_requested.get() {
            Some(self.scan(topology))
        } else {
            None
        }
    }

    pub fn scan(&mut self, topology: &Topology) -> Result<(), ScanError> {
        self.scan_requested.set(false);
        self.scans += 1;

        match self.build_map(topology) {
            Ok(map) => {
                tracing::info!("[CONTROLLER] Scan mapped {} device(s)", map.len());
                for entry in map.entries() {
                    tracing::debug!("[CONTROLLER]   {} {}", entry.block, entry.info);
                }
                self.map = Rc::new(map);
                self.last_error = None;
                self.status.set(STATUS_OK);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("[CONTROLLER] Scan failed ({}): {}", err.key(), err);
                self.status.set(err.status());
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn build_map(&self, topology: &Topology) -> Result<AddressMap, ScanError> {
        let discovery = topology.discover(self.element);
        if discovery.controllers.len() > 1 {
            return Err(ScanError::MultipleControllers {
                controllers: discovery.controllers,
            });
        }

        let mut builder = AddressMapBuilder::new();
        let mut placed = Vec::with_capacity(discovery.devices.len());
        for capability in &discovery.devices {
            let info = capability.info();
            let preferred = capability.device.borrow().preferred_block(&builder);
            let block = builder
                .propose(info.clone(), capability.device.clone(), preferred)
                .map_err(|overlap| ScanError::AddressesOverlap {
                    first: overlap.existing,
                    first_block: overlap.existing_block,
                    second: info.clone(),
                    second_block: overlap.block,
                })?;
            placed.push((capability, info, block));
        }

        for (capability, info, block) in placed {
            capability
                .device
                .borrow_mut()
                .initialize(block)
                .map_err(|err| ScanError::SegmentFailed {
                    device: info,
                    reason: format!("{:#}", err),
                })?;
        }

        Ok(builder.build())
    }

    /// Snapshot of the currently published map.
    pub fn address_map(&self) -> Rc<AddressMap> {
        self.map.clone()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.map.entries().iter().map(|e| e.info.clone()).collect()
    }

    pub fn last_error(&self) -> Option<&ScanError> {
        self.last_error.as_ref()
    }

    pub fn map_and_read(&self, address: u32) -> Result<u8, BusError> {
        let (entry, offset) = self.map.resolve(address).ok_or(BusError::Unmapped(address))?;
        let value = entry.device.borrow_mut().read(offset);
        Ok(value)
    }

    pub fn map_and_write(&self, address: u32, value: u8) -> Result<(), BusError> {
        let (entry, offset) = self.map.resolve(address).ok_or(BusError::Unmapped(address))?;
        entry.device.borrow_mut().write(offset, value);
        Ok(())
    }

    /// Like `map_and_write` but through the device's injection path.
    pub fn map_and_poke(&self, address: u32, value: u8) -> Result<(), BusError> {
        let (entry, offset) = self.map.resolve(address).ok_or(BusError::Unmapped(address))?;
        entry.device.borrow_mut().poke(offset, value);
        Ok(())
    }

    /// The controller's own register block, to be installed as a device.
    pub fn port(&self, address: u32) -> ControllerPort {
        ControllerPort {
            address,
            scan_requested: self.scan_requested.clone(),
            status: self.status.clone(),
        }
    }
}

/// Status port of a bus controller.
///
/// Offset 0 reads the last scan status; any write to it schedules a rescan.
#[derive(Debug)]
pub struct ControllerPort {
    address: u32,
    scan_requested: Rc<Cell<bool>>,
    status: Rc<Cell<u8>>,
}

impl BusDevice for ControllerPort {
    fn name(&self) -> String {
        "Bus controller".to_string()
    }

    fn preferred_block(&self, _placed: &AddressMapBuilder) -> AddressBlock {
        AddressBlock::new(self.address, 1)
    }

    fn read(&mut self, _offset: u32) -> u8 {
        self.status.get()
    }

    fn write(&mut self, _offset: u32, value: u8) {
        tracing::debug!("[CONTROLLER] Rescan requested by software ({:02X})", value);
        self.scan_requested.set(true);
    }
}
