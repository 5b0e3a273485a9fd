pub mod address;
pub mod bus;
pub mod capability;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cpu;
pub mod cpu_extensions;
pub mod device;
pub mod hex;
pub mod instruction;
pub mod machine;
pub mod memory;
pub mod registers;
pub mod serial;
pub mod storage;
pub mod topology;
pub mod utils;

pub use address::{AddressBlock, AddressMap};
pub use bus::{MemoryBus, SharedBus};
pub use config::MachineConfig;
pub use controller::{BusController, BusError, ScanError};
pub use cpu::{CpuError, I8080};
pub use cpu_extensions::{CallAction, CpmBdos, CpuHooks, Interrupt};
pub use device::{BusDevice, DeviceId, DeviceInfo, SharedDevice};
pub use machine::{Machine, MachineBuilder, ProgramEntry};
pub use registers::{Flags, Registers};
pub use storage::{MediaStore, StorageMedium};
pub use topology::Topology;
pub use utils::hexdump;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
