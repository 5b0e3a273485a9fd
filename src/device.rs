use std::{cell::RefCell, fmt, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::address::{AddressBlock, AddressMapBuilder};

/// Opaque device identity, assigned when a device is installed into a topology.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Diagnostic view of a device: identity plus a human readable name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Anything that occupies an address range on the bus.
///
/// Addresses handed to `read`/`write` are local to the device's block.
pub trait BusDevice {
    fn name(&self) -> String;

    /// Block the device wants for the scan in progress. `placed` holds the
    /// devices mapped so far, so adaptive devices can pick a free range.
    fn preferred_block(&self, placed: &AddressMapBuilder) -> AddressBlock;

    /// Called once per successful placement. An error fails the whole scan.
    fn initialize(&mut self, _block: AddressBlock) -> anyhow::Result<()> {
        Ok(())
    }

    fn read(&mut self, offset: u32) -> u8;
    fn write(&mut self, offset: u32, value: u8);

    /// Direct write used for firmware injection; ignores write protection.
    fn poke(&mut self, offset: u32, value: u8) {
        self.write(offset, value);
    }
}

pub type SharedDevice = Rc<RefCell<dyn BusDevice>>;

/// A device together with its identity, as stored in the capability registry.
#[derive(Clone)]
pub struct DeviceCapability {
    pub id: DeviceId,
    pub device: SharedDevice,
}

impl DeviceCapability {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.device.borrow().name(),
        }
    }
}

impl fmt::Debug for DeviceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCapability")
            .field("id", &self.id)
            .finish()
    }
}

/// Marker capability: the element hosts a bus controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControllerCapability;
