// CPU hooks: host code observing or replacing calls and interrupt vectors
// without touching the execution loop. The CP/M BDOS shim used by the
// diagnostic harness is built on top of this.

use std::{cell::RefCell, rc::Rc};

use crate::{bus::MemoryBus, registers::Registers};

pub const BDOS_ENTRY: u16 = 0x0005;
pub const BDOS_PRINT_CHAR: u8 = 2;
pub const BDOS_PRINT_STRING: u8 = 9;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallAction {
    /// Perform the call normally.
    Proceed,
    /// The hook handled it; continue after the call instruction.
    Skip,
}

/// Interrupt request as presented on the data bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// RST n instruction, vector n * 8.
    Rst(u8),
    /// Direct vector, for hosts that don't go through RST.
    Vector(u16),
}

impl Interrupt {
    pub fn default_vector(self) -> u16 {
        match self {
            Interrupt::Rst(n) => ((n & 0x07) as u16) * 8,
            Interrupt::Vector(address) => address,
        }
    }
}

pub trait CpuHooks {
    /// Runs before every taken CALL, conditional call or RST, with PC already
    /// pointing at the return address.
    fn before_call(
        &mut self,
        _target: u16,
        _regs: &mut Registers,
        _bus: &mut dyn MemoryBus,
    ) -> CallAction {
        CallAction::Proceed
    }

    /// Picks the address an accepted interrupt jumps to.
    fn resolve_interrupt(&mut self, interrupt: Interrupt, _regs: &Registers) -> u16 {
        interrupt.default_vector()
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct NoHooks;

impl CpuHooks for NoHooks {}

/// Minimal CP/M BDOS: console output functions 2 and 9 on `CALL 5`.
#[derive(Debug, Default, Clone)]
pub struct CpmBdos {
    output: Rc<RefCell<String>>,
}

impl CpmBdos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle on everything printed so far.
    pub fn output(&self) -> Rc<RefCell<String>> {
        self.output.clone()
    }
}

impl CpuHooks for CpmBdos {
    fn before_call(
        &mut self,
        target: u16,
        regs: &mut Registers,
        bus: &mut dyn MemoryBus,
    ) -> CallAction {
        if target != BDOS_ENTRY {
            return CallAction::Proceed;
        }

        let mut output = self.output.borrow_mut();
        match regs.c {
            BDOS_PRINT_CHAR => output.push(regs.e as char),
            BDOS_PRINT_STRING => {
                let mut address = regs.de();
                // A missing terminator would otherwise spin over all of memory.
                for _ in 0..0x10000 {
                    let ch = bus.read(address as u32);
                    if ch == b'$' {
                        break;
                    }
                    output.push(ch as char);
                    address = address.wrapping_add(1);
                }
            }
            function => tracing::warn!("[BDOS] Unsupported function {}", function),
        }
        CallAction::Skip
    }
}
