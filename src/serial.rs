// Serial port manager: several devices behind one serial address range.
//
// Layout of the manager's block (offsets relative to its base):
//   0  SELECT  write n: select the n-th registered port, read: selected index
//   1  DATA    forwarded to the selected device
//   2+ ports   forwarded to the device registered at that offset

use std::{collections::VecDeque, fmt};

use derivative::Derivative;
use thiserror::Error;

use crate::{
    address::{AddressBlock, AddressMapBuilder},
    device::{BusDevice, SharedDevice},
};

pub const SERIAL_ADDRESS: u32 = 0x10002;

pub const SELECT: u32 = 0;
pub const DATA: u32 = 1;
pub const FIRST_PORT: u32 = 2;

pub const NO_SELECTION: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("ports {first} and {second} both registered at offset {offset}")]
    DuplicateOffset {
        offset: u32,
        first: String,
        second: String,
    },

    #[error("port {name} registered at reserved offset {offset}")]
    ReservedOffset { offset: u32, name: String },
}

pub struct SerialPort {
    pub index: usize,
    pub offset: u32,
    pub name: String,
    pub device: SharedDevice,
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("name", &self.name)
            .finish()
    }
}

pub type SelectionListener = Box<dyn FnMut(Option<&SerialPort>)>;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct SerialPortManager {
    base: u32,
    ports: Vec<SerialPort>,
    selected: Option<usize>,
    #[derivative(Debug = "ignore")]
    listeners: Vec<SelectionListener>,
}

impl SerialPortManager {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            ports: Vec::new(),
            selected: None,
            listeners: Vec::new(),
        }
    }

    /// Registers `device` at `offset`. Conflicts are reported when the manager
    /// is initialized by a scan.
    pub fn register_port(&mut self, offset: u32, device: SharedDevice) -> usize {
        let index = self.ports.len();
        let name = device.borrow().name();
        tracing::debug!("[SERIAL] Port {} '{}' at offset {}", index, name, offset);
        self.ports.push(SerialPort {
            index,
            offset,
            name,
            device,
        });
        index
    }

    pub fn ports(&self) -> &[SerialPort] {
        &self.ports
    }

    pub fn selected_device(&self) -> Option<&SerialPort> {
        self.selected.and_then(|index| self.ports.get(index))
    }

    /// Listeners run synchronously, in registration order, once per change.
    pub fn on_selection_changed(&mut self, listener: impl FnMut(Option<&SerialPort>) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn validate(&self) -> Result<(), SerialError> {
        for (i, port) in self.ports.iter().enumerate() {
            if port.offset < FIRST_PORT {
                return Err(SerialError::ReservedOffset {
                    offset: port.offset,
                    name: port.name.clone(),
                });
            }
            if let Some(other) = self.ports[..i].iter().find(|p| p.offset == port.offset) {
                return Err(SerialError::DuplicateOffset {
                    offset: port.offset,
                    first: other.name.clone(),
                    second: port.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn select(&mut self, value: u8) {
        let selected = (value as usize) < self.ports.len();
        let selected = selected.then_some(value as usize);
        if selected == self.selected {
            return;
        }

        self.selected = selected;
        let port = selected.and_then(|index| self.ports.get(index));
        tracing::debug!(
            "[SERIAL] Selected {}",
            port.map(|p| p.name.as_str()).unwrap_or("nothing")
        );
        for listener in self.listeners.iter_mut() {
            listener(port);
        }
    }

    fn port_at(&self, offset: u32) -> Option<&SerialPort> {
        self.ports.iter().find(|p| p.offset == offset)
    }
}

impl BusDevice for SerialPortManager {
    fn name(&self) -> String {
        format!("Serial ports ({})", self.ports.len())
    }

    fn preferred_block(&self, _placed: &AddressMapBuilder) -> AddressBlock {
        let last = self
            .ports
            .iter()
            .map(|p| p.offset)
            .max()
            .unwrap_or(DATA)
            .max(DATA);
        AddressBlock::new(self.base, last + 1)
    }

    fn initialize(&mut self, block: AddressBlock) -> anyhow::Result<()> {
        self.validate()?;
        tracing::debug!("[SERIAL] Mapped at {}", block);
        Ok(())
    }

    fn read(&mut self, offset: u32) -> u8 {
        match offset {
            SELECT => self.selected.map(|i| i as u8).unwrap_or(NO_SELECTION),
            DATA => self
                .selected_device()
                .map(|port| port.device.borrow_mut().read(0))
                .unwrap_or(0xFF),
            _ => self
                .port_at(offset)
                .map(|port| port.device.borrow_mut().read(0))
                .unwrap_or(0xFF),
        }
    }

    fn write(&mut self, offset: u32, value: u8) {
        match offset {
            SELECT => self.select(value),
            DATA => {
                if let Some(port) = self.selected_device() {
                    port.device.borrow_mut().write(0, value);
                }
            }
            _ => {
                if let Some(port) = self.port_at(offset) {
                    port.device.borrow_mut().write(0, value);
                }
            }
        }
    }
}

/// Byte-oriented console endpoint.
///
/// Offset 0: data (read pops input, write appends output).
/// Offset 1: status, bit 0 set while input is pending.
#[derive(Debug, Default, Clone)]
pub struct SerialConsole {
    name: String,
    address: Option<u32>,
    pub output: Vec<u8>,
    pub input: VecDeque<u8>,
}

impl SerialConsole {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Console mapped directly on the bus rather than behind a port manager.
    pub fn at(name: &str, address: u32) -> Self {
        Self {
            address: Some(address),
            ..Self::new(name)
        }
    }

    pub fn push_input(&mut self, text: &str) {
        self.input.extend(text.bytes());
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl BusDevice for SerialConsole {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn preferred_block(&self, _placed: &AddressMapBuilder) -> AddressBlock {
        match self.address {
            Some(address) => AddressBlock::new(address, 2),
            None => AddressBlock::empty(),
        }
    }

    fn read(&mut self, offset: u32) -> u8 {
        match offset {
            0 => self.input.pop_front().unwrap_or(0),
            1 => !self.input.is_empty() as u8,
            _ => 0xFF,
        }
    }

    fn write(&mut self, offset: u32, value: u8) {
        if offset == 0 {
            self.output.push(value);
        }
    }
}
