use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bus::IO_BASE,
    clock::{DEFAULT_CYCLES_PER_SECOND, DEFAULT_TICKS_PER_SECOND},
    controller::CONTROLLER_PORT_ADDRESS,
    serial::SERIAL_ADDRESS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing machine config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{name} block {start:#07X}+{length:#X} does not fit in memory")]
    OutOfMemory {
        name: &'static str,
        start: u32,
        length: u32,
    },
}

/// Where the standard devices sit on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub ram_start: u32,
    pub ram_size: u32,
    pub eeprom_start: u32,
    pub controller_port: u32,
    pub serial_manager: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            ram_start: 0x0000,
            ram_size: 0x7000,
            eeprom_start: 0xC000,
            controller_port: CONTROLLER_PORT_ADDRESS,
            serial_manager: SERIAL_ADDRESS,
        }
    }
}

/// Machine settings. Every field is optional in the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub instructions_per_second: u32,
    pub ticks_per_second: u32,
    /// Value returned for reads nothing answers.
    pub unmapped_value: u8,
    /// Fault on undocumented opcodes instead of running their aliases.
    pub strict_opcodes: bool,
    pub eeprom_size: u32,
    pub layout: Layout,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            instructions_per_second: DEFAULT_CYCLES_PER_SECOND,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            unmapped_value: 0xFF,
            strict_opcodes: false,
            eeprom_size: 4096,
            layout: Layout::default(),
        }
    }
}

impl MachineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        tracing::info!("[CONFIG] Loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instructions_per_second == 0 {
            return Err(ConfigError::Zero {
                field: "instructions_per_second",
            });
        }
        if self.ticks_per_second == 0 {
            return Err(ConfigError::Zero {
                field: "ticks_per_second",
            });
        }

        let memory_blocks = [
            ("ram", self.layout.ram_start, self.layout.ram_size),
            ("eeprom", self.layout.eeprom_start, self.eeprom_size),
        ];
        for (name, start, length) in memory_blocks {
            if start as u64 + length as u64 > IO_BASE as u64 {
                return Err(ConfigError::OutOfMemory {
                    name,
                    start,
                    length,
                });
            }
        }
        Ok(())
    }

    /// Average per-tick budget. `Clock` spreads the remainder.
    pub fn cycles_per_tick(&self) -> u32 {
        self.instructions_per_second / self.ticks_per_second.max(1)
    }
}
