use std::{cell::RefCell, fmt, path::Path, rc::Rc};

use crate::{
    bus::{MemoryBus, SharedBus},
    clock::Clock,
    config::MachineConfig,
    controller::{BusController, ScanError},
    cpu::{CpuError, I8080},
    cpu_extensions::{CpuHooks, Interrupt},
    device::{DeviceId, SharedDevice},
    hex::{self, HexError},
    instruction::disassemble,
    memory::{Eeprom, Ram},
    serial::{SerialConsole, SerialPortManager, FIRST_PORT},
    storage::{self, MediaStore, StorageMedium},
    topology::{ElementId, Topology},
    utils::hexdump,
};

/// A complete computer: topology, bus controller, CPU and clock.
///
/// The host drives it with `tick()`. Each tick first runs a scan if one was
/// requested (or the topology changed), then gives the CPU one tick's worth
/// of cycles.
pub struct Machine {
    pub config: MachineConfig,
    topology: Topology,
    cable: ElementId,
    controller: Rc<RefCell<BusController>>,
    cpu: I8080<SharedBus>,
    clock: Clock,
    eeprom: Option<Rc<RefCell<Eeprom>>>,
    serial: Option<Rc<RefCell<SerialPortManager>>>,
    console: Option<Rc<RefCell<SerialConsole>>>,
    store: Option<MediaStore>,
}

impl Machine {
    /// Standard machine for `config`: RAM, EEPROM and a serial console.
    pub fn from_config(config: MachineConfig) -> anyhow::Result<Self> {
        MachineBuilder::new()
            .config(config)
            .ram()
            .eeprom()
            .console("tty0")
            .build()
    }

    fn new(config: MachineConfig) -> Self {
        tracing::info!(
            "[MACHINE] Initializing at {} Hz, {} ticks/s",
            config.instructions_per_second,
            config.ticks_per_second
        );

        let mut topology = Topology::new();
        let root = topology.add_controller();
        let cable = topology.add_cable();
        topology.connect(root, cable);

        let controller = Rc::new(RefCell::new(BusController::new(root)));
        let port = controller.borrow().port(config.layout.controller_port);
        let (element, _) = topology.add_device(Rc::new(RefCell::new(port)));
        topology.connect(cable, element);

        let bus = SharedBus::new(controller.clone(), config.unmapped_value);
        let mut cpu = I8080::new(bus);
        cpu.strict_opcodes = config.strict_opcodes;

        Self {
            clock: Clock::new(config.instructions_per_second, config.ticks_per_second),
            config,
            topology,
            cable,
            controller,
            cpu,
            eeprom: None,
            serial: None,
            console: None,
            store: None,
        }
    }

    /// Plugs `device` into the machine's bus cable. The next tick rescans.
    pub fn add_device(&mut self, device: SharedDevice) -> (ElementId, DeviceId) {
        let (element, id) = self.topology.add_device(device);
        self.topology.connect(self.cable, element);
        (element, id)
    }

    pub fn cable(&self) -> ElementId {
        self.cable
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Direct topology access. Structural changes trigger a scan on the next
    /// tick.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn controller(&self) -> Rc<RefCell<BusController>> {
        self.controller.clone()
    }

    pub fn cpu(&self) -> &I8080<SharedBus> {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut I8080<SharedBus> {
        &mut self.cpu
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn eeprom(&self) -> Option<Rc<RefCell<Eeprom>>> {
        self.eeprom.clone()
    }

    pub fn serial(&self) -> Option<Rc<RefCell<SerialPortManager>>> {
        self.serial.clone()
    }

    pub fn console(&self) -> Option<Rc<RefCell<SerialConsole>>> {
        self.console.clone()
    }

    /// Writes media contents back to the machine's store, or to the
    /// process-wide one when the machine has none of its own.
    pub fn flush_media(&self) -> anyhow::Result<usize> {
        match &self.store {
            Some(store) => store.flush(),
            None => storage::with_global(|store| store.flush()).unwrap_or(Ok(0)),
        }
    }

    pub fn pc(&self) -> u16 {
        self.cpu.pc()
    }

    pub fn halted(&self) -> bool {
        self.cpu.halted()
    }

    pub fn reset(&mut self) {
        tracing::info!("[MACHINE] Reset");
        self.cpu.reset();
    }

    pub fn interrupt(&mut self, interrupt: Interrupt) {
        self.cpu.interrupt(interrupt);
    }

    pub fn set_hooks(&mut self, hooks: impl CpuHooks + 'static) {
        self.cpu.set_hooks(hooks);
    }

    pub fn schedule_scan(&self) {
        self.controller.borrow().schedule_scan();
    }

    /// Runs a requested scan now instead of waiting for the next tick.
    pub fn scan_if_pending(&mut self) -> Option<Result<(), ScanError>> {
        if self.topology.take_changed() {
            self.controller.borrow().schedule_scan();
        }
        self.controller.borrow_mut().run_pending_scan(&self.topology)
    }

    /// One host tick. Returns the cycles the CPU executed.
    ///
    /// A failed scan leaves the previous map in place and doesn't stop the
    /// CPU; it is available from `controller().borrow().last_error()`.
    pub fn tick(&mut self) -> Result<u32, CpuError> {
        self.scan_if_pending();
        let budget = self.clock.next_budget();
        self.cpu.run(budget)
    }

    pub fn run_ticks(&mut self, ticks: usize) -> Result<u64, CpuError> {
        let mut cycles = 0;
        for _ in 0..ticks {
            cycles += self.tick()? as u64;
        }
        Ok(cycles)
    }

    /// Copies `bytes` into memory at `offset`, ignoring write protection.
    pub fn load(&mut self, bytes: &[u8], offset: u16) {
        self.scan_if_pending();
        self.cpu.load(bytes, offset);
    }

    /// Burns an Intel HEX image into memory.
    pub fn load_hex(&mut self, text: &str) -> Result<usize, HexError> {
        self.scan_if_pending();
        let controller = self.controller.borrow();
        hex::load(text, |address, value| {
            if let Err(err) = controller.map_and_poke(address as u32, value) {
                tracing::warn!("[MACHINE] Firmware byte dropped: {}", err);
            }
        })
    }

    pub fn load_hex_file(&mut self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        self.scan_if_pending();
        let controller = self.controller.borrow();
        hex::load_file(path, |address, value| {
            if let Err(err) = controller.map_and_poke(address as u32, value) {
                tracing::warn!("[MACHINE] Firmware byte dropped: {}", err);
            }
        })
    }

    /// Memory as the CPU sees it, unmapped bytes included.
    pub fn memory(&mut self, start: u16, end: u16) -> Vec<u8> {
        (start as u32..=end as u32)
            .map(|address| self.cpu.bus.read(address))
            .collect()
    }

    pub fn memory_dump(&mut self, start: u16, end: u16) -> String {
        let bytes = self.memory(start, end);
        hexdump(&bytes, start as u32)
    }

    /// Disassembly listing of `count` instructions from `start`.
    pub fn program(&mut self, start: u16, count: usize) -> Vec<ProgramEntry> {
        disassemble(&mut self.cpu.bus, start, count)
            .into_iter()
            .map(|instruction| ProgramEntry {
                address: instruction.pc,
                instruction: instruction.name(),
                data: instruction.opcode_with_args(),
            })
            .collect()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("config", &self.config)
            .field("cpu", &self.cpu)
            .field("clock", &self.clock)
            .finish()
    }
}

#[derive(Default)]
pub struct MachineBuilder {
    config: MachineConfig,
    ram: bool,
    eeprom: Option<StorageMedium>,
    store: Option<MediaStore>,
    consoles: Vec<String>,
    serial_ports: Vec<(u32, SharedDevice)>,
    devices: Vec<SharedDevice>,
    hooks: Option<Box<dyn CpuHooks>>,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&mut self, config: MachineConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// RAM at the configured location.
    pub fn ram(&mut self) -> &mut Self {
        self.ram = true;
        self
    }

    /// A fresh EEPROM of the configured size.
    pub fn eeprom(&mut self) -> &mut Self {
        let medium = StorageMedium::eeprom(self.config.eeprom_size);
        self.eeprom_medium(medium)
    }

    /// EEPROM backed by an existing medium, e.g. one restored with its id.
    pub fn eeprom_medium(&mut self, medium: StorageMedium) -> &mut Self {
        self.eeprom = Some(medium);
        self
    }

    /// Store used to materialize media. Without one the process-wide store
    /// is used when installed, otherwise a private in-memory store.
    pub fn media_store(&mut self, store: MediaStore) -> &mut Self {
        self.store = Some(store);
        self
    }

    /// Adds a console to the serial port manager, at the next free port.
    pub fn console(&mut self, name: &str) -> &mut Self {
        self.consoles.push(name.to_string());
        self
    }

    pub fn serial_port(&mut self, offset: u32, device: SharedDevice) -> &mut Self {
        self.serial_ports.push((offset, device));
        self
    }

    pub fn device(&mut self, device: SharedDevice) -> &mut Self {
        self.devices.push(device);
        self
    }

    pub fn hooks(&mut self, hooks: impl CpuHooks + 'static) -> &mut Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    fn build_eeprom(&mut self, medium: StorageMedium) -> anyhow::Result<Eeprom> {
        let base = self.config.layout.eeprom_start;
        if let Some(store) = self.store.as_mut() {
            return Eeprom::new(base, medium, store);
        }
        match storage::with_global(|store| Eeprom::new(base, medium.clone(), store)) {
            Some(eeprom) => eeprom,
            None => Eeprom::new(base, medium, &mut MediaStore::in_memory()),
        }
    }

    pub fn build(&mut self) -> anyhow::Result<Machine> {
        self.config.validate()?;
        let mut machine = Machine::new(self.config.clone());

        if self.ram {
            let layout = &self.config.layout;
            let ram = Ram::new(layout.ram_start, layout.ram_size);
            machine.add_device(Rc::new(RefCell::new(ram)));
        }

        if let Some(medium) = self.eeprom.take() {
            let eeprom = Rc::new(RefCell::new(self.build_eeprom(medium)?));
            machine.add_device(eeprom.clone());
            machine.eeprom = Some(eeprom);
        }

        if !self.consoles.is_empty() || !self.serial_ports.is_empty() {
            let mut manager = SerialPortManager::new(self.config.layout.serial_manager);
            let mut next_port = FIRST_PORT;
            for (offset, device) in self.serial_ports.drain(..) {
                manager.register_port(offset, device);
                next_port = next_port.max(offset + 1);
            }
            for name in self.consoles.drain(..) {
                let console = Rc::new(RefCell::new(SerialConsole::new(&name)));
                manager.register_port(next_port, console.clone());
                next_port += 1;
                machine.console.get_or_insert(console);
            }

            let manager = Rc::new(RefCell::new(manager));
            machine.add_device(manager.clone());
            machine.serial = Some(manager);
        }

        for device in self.devices.drain(..) {
            machine.add_device(device);
        }

        if let Some(hooks) = self.hooks.take() {
            machine.cpu.set_boxed_hooks(hooks);
        }
        machine.store = self.store.take();

        Ok(machine)
    }
}

/// One line of a disassembly listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramEntry {
    pub address: u16,
    pub instruction: String,
    pub data: String,
}

impl fmt::Display for ProgramEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}  {:<12}  {}", self.address, self.data, self.instruction)
    }
}
