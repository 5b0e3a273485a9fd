use std::fmt;

use thiserror::Error;
use tracing::Level;

use crate::{
    bus::{MemoryBus, IO_BASE},
    cpu_extensions::{CallAction, CpuHooks, Interrupt, NoHooks},
    instruction::Instruction,
    registers::{Flags, Registers},
};

/// SP after reset. The 8080 leaves it undefined; firmware sets its own.
pub const RESET_SP: u16 = 0x0000;

/// Cycles to accept an interrupt (RST).
pub const INTERRUPT_CYCLES: u32 = 11;

/// Base cost of every opcode in states. Conditional calls and returns add
/// `BRANCH_TAKEN_CYCLES` when taken.
#[rustfmt::skip]
const CYCLES: [u8; 256] = [
//  0   1   2   3   4   5   6   7   8   9   A   B   C   D   E   F
    4, 10,  7,  5,  5,  5,  7,  4,  4, 10,  7,  5,  5,  5,  7,  4, // 0
    4, 10,  7,  5,  5,  5,  7,  4,  4, 10,  7,  5,  5,  5,  7,  4, // 1
    4, 10, 16,  5,  5,  5,  7,  4,  4, 10, 16,  5,  5,  5,  7,  4, // 2
    4, 10, 13,  5, 10, 10, 10,  4,  4, 10, 13,  5,  5,  5,  7,  4, // 3
    5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 4
    5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 5
    5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 6
    7,  7,  7,  7,  7,  7,  7,  7,  5,  5,  5,  5,  5,  5,  7,  5, // 7
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 8
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 9
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // A
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // B
    5, 10, 10, 10, 11, 11,  7, 11,  5, 10, 10, 10, 11, 17,  7, 11, // C
    5, 10, 10, 10, 11, 11,  7, 11,  5, 10, 10, 10, 11, 17,  7, 11, // D
    5, 10, 10, 18, 11, 11,  7, 11,  5,  5, 10,  4, 11, 17,  7, 11, // E
    5, 10, 10,  4, 11, 11,  7, 11,  5,  5, 10,  4, 11, 17,  7, 11, // F
];

const BRANCH_TAKEN_CYCLES: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("unknown opcode {opcode:02X} at {pc:04X}")]
    UnknownOpcode { opcode: u8, pc: u16 },

    #[error("CPU stopped after an earlier fault: {0}")]
    Faulted(Box<CpuError>),
}

/// Opcodes that the 8080 executes as aliases of documented instructions.
pub fn is_undocumented(opcode: u8) -> bool {
    matches!(
        opcode,
        0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0xCB | 0xD9 | 0xDD | 0xED | 0xFD
    )
}

/// Intel 8080 core.
///
/// The core owns its bus handle; every fetch and data access goes through
/// `MemoryBus`, I/O ports through `IO_BASE + port` on the same bus.
pub struct I8080<B: MemoryBus> {
    pub regs: Registers,
    pub bus: B,
    pub halted: bool,
    pub strict_opcodes: bool,
    ei_delay: bool,
    interrupt: Option<Interrupt>,
    cycle_debt: u32,
    total_cycles: u64,
    fault: Option<CpuError>,
    hooks: Box<dyn CpuHooks>,
}

impl<B: MemoryBus> I8080<B> {
    pub fn new(bus: B) -> Self {
        let mut cpu = Self {
            regs: Registers::default(),
            bus,
            halted: false,
            strict_opcodes: false,
            ei_delay: false,
            interrupt: None,
            cycle_debt: 0,
            total_cycles: 0,
            fault: None,
            hooks: Box::new(NoHooks),
        };
        cpu.reset();
        cpu
    }

    pub fn with_hooks(bus: B, hooks: impl CpuHooks + 'static) -> Self {
        let mut cpu = Self::new(bus);
        cpu.set_hooks(hooks);
        cpu
    }

    pub fn set_hooks(&mut self, hooks: impl CpuHooks + 'static) {
        self.hooks = Box::new(hooks);
    }

    pub fn set_boxed_hooks(&mut self, hooks: Box<dyn CpuHooks>) {
        self.hooks = hooks;
    }

    pub fn reset(&mut self) {
        self.regs = Registers {
            sp: RESET_SP,
            ..Registers::default()
        };
        self.halted = false;
        self.ei_delay = false;
        self.interrupt = None;
        self.cycle_debt = 0;
        self.fault = None;
    }

    /// Copies `bytes` into memory at `offset` without going through device
    /// write protection.
    pub fn load(&mut self, bytes: &[u8], offset: u16) {
        self.bus.load(offset as u32, bytes);
    }

    pub fn pc(&self) -> u16 {
        self.regs.pc
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn fault(&self) -> Option<&CpuError> {
        self.fault.as_ref()
    }

    /// Latches an interrupt request. It is accepted at the next instruction
    /// boundary with interrupts enabled, replacing any request still pending.
    pub fn interrupt(&mut self, interrupt: Interrupt) {
        self.interrupt = Some(interrupt);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.is_some()
    }

    fn can_accept_interrupt(&self) -> bool {
        self.interrupt.is_some() && self.regs.inte && !self.ei_delay
    }

    /// Runs instructions until `max_cycles` have been spent.
    ///
    /// The last instruction may overshoot; the excess is taken off the next
    /// call's budget. Returns the cycles actually executed by this call.
    pub fn run(&mut self, max_cycles: u32) -> Result<u32, CpuError> {
        if let Some(fault) = &self.fault {
            return Err(CpuError::Faulted(Box::new(fault.clone())));
        }

        if self.cycle_debt >= max_cycles {
            self.cycle_debt -= max_cycles;
            return Ok(0);
        }

        let mut spent = self.cycle_debt;
        let mut executed = 0;
        while spent < max_cycles {
            if self.halted && !self.can_accept_interrupt() {
                // Idle until the end of the tick.
                executed += max_cycles - spent;
                spent = max_cycles;
                break;
            }

            let cycles = self.step()?;
            spent += cycles;
            executed += cycles;
        }

        self.cycle_debt = spent - max_cycles;
        Ok(executed)
    }

    /// Executes one instruction (or accepts one interrupt) and returns its cost.
    pub fn step(&mut self) -> Result<u32, CpuError> {
        if let Some(fault) = &self.fault {
            return Err(CpuError::Faulted(Box::new(fault.clone())));
        }

        let cycles = if self.can_accept_interrupt() {
            self.accept_interrupt()
        } else if self.halted {
            4
        } else {
            // EI only shields the boundary right after itself.
            self.ei_delay = false;
            let pc = self.regs.pc;

            if tracing::enabled!(Level::TRACE) {
                let instruction = Instruction::parse_at(&mut self.bus, pc);
                tracing::trace!("{:<14} {}", instruction.name(), self.regs);
            }

            let opcode = self.fetch_byte();
            match self.execute(opcode, pc) {
                Ok(cycles) => cycles,
                Err(err) => {
                    tracing::error!("[CPU] {}", err);
                    self.fault = Some(err.clone());
                    return Err(err);
                }
            }
        };

        self.total_cycles += cycles as u64;
        Ok(cycles)
    }

    fn accept_interrupt(&mut self) -> u32 {
        let Some(interrupt) = self.interrupt.take() else {
            return 0;
        };
        self.regs.inte = false;
        self.halted = false;

        let vector = self.hooks.resolve_interrupt(interrupt, &self.regs);
        tracing::debug!("[CPU] Interrupt {:?} -> {:04X}", interrupt, vector);
        self.push(self.regs.pc);
        self.regs.pc = vector;
        INTERRUPT_CYCLES
    }

    fn read(&mut self, address: u16) -> u8 {
        self.bus.read(address as u32)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.bus.write(address as u32, value);
    }

    fn fetch_byte(&mut self) -> u8 {
        let value = self.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self) -> u16 {
        let low = self.fetch_byte() as u16;
        let high = self.fetch_byte() as u16;
        (high << 8) | low
    }

    fn push(&mut self, value: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        self.bus.write_word(self.regs.sp, value);
    }

    fn pop(&mut self) -> u16 {
        let value = self.bus.read_word(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        value
    }

    /// Register by its 3-bit encoding; 6 is memory at HL.
    fn get_reg(&mut self, index: u8) -> u8 {
        match index & 0x07 {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            6 => self.read(self.regs.hl()),
            _ => self.regs.a,
        }
    }

    fn set_reg(&mut self, index: u8, value: u8) {
        match index & 0x07 {
            0 => self.regs.b = value,
            1 => self.regs.c = value,
            2 => self.regs.d = value,
            3 => self.regs.e = value,
            4 => self.regs.h = value,
            5 => self.regs.l = value,
            6 => self.write(self.regs.hl(), value),
            _ => self.regs.a = value,
        }
    }

    /// Register pair by its 2-bit encoding, with 3 meaning SP.
    fn get_pair(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            _ => self.regs.sp,
        }
    }

    fn set_pair(&mut self, index: u8, value: u16) {
        match index & 0x03 {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            _ => self.regs.sp = value,
        }
    }

    fn condition(&self, index: u8) -> bool {
        let flags = self.regs.flags;
        match index & 0x07 {
            0 => !flags.contains(Flags::ZERO),
            1 => flags.contains(Flags::ZERO),
            2 => !flags.contains(Flags::CARRY),
            3 => flags.contains(Flags::CARRY),
            4 => !flags.contains(Flags::PARITY),
            5 => flags.contains(Flags::PARITY),
            6 => !flags.contains(Flags::SIGN),
            _ => flags.contains(Flags::SIGN),
        }
    }

    fn add(&mut self, value: u8, carry: bool) {
        let a = self.regs.a;
        let result = a as u16 + value as u16 + carry as u16;
        let flags = &mut self.regs.flags;
        flags.set(Flags::CARRY, result > 0xFF);
        flags.set(
            Flags::AUX_CARRY,
            (a & 0x0F) + (value & 0x0F) + carry as u8 > 0x0F,
        );
        flags.set_zsp(result as u8);
        self.regs.a = result as u8;
    }

    /// A - value - borrow, computed the way the 8080 does it (adding the
    /// complement) so AC comes out as on real silicon.
    fn sub(&mut self, value: u8, borrow: bool) -> u8 {
        let a = self.regs.a;
        let result = a as u16 + (!value) as u16 + (!borrow) as u16;
        let flags = &mut self.regs.flags;
        flags.set(Flags::CARRY, result <= 0xFF);
        flags.set(
            Flags::AUX_CARRY,
            (a & 0x0F) + (!value & 0x0F) + (!borrow) as u8 > 0x0F,
        );
        flags.set_zsp(result as u8);
        result as u8
    }

    fn and(&mut self, value: u8) {
        let a = self.regs.a;
        let result = a & value;
        self.regs.flags.remove(Flags::CARRY);
        self.regs
            .flags
            .set(Flags::AUX_CARRY, (a | value) & 0x08 != 0);
        self.regs.flags.set_zsp(result);
        self.regs.a = result;
    }

    fn logic(&mut self, result: u8) {
        self.regs.flags.remove(Flags::CARRY | Flags::AUX_CARRY);
        self.regs.flags.set_zsp(result);
        self.regs.a = result;
    }

    fn alu(&mut self, operation: u8, value: u8) {
        let carry = self.regs.flags.contains(Flags::CARRY);
        match operation & 0x07 {
            0 => self.add(value, false),
            1 => self.add(value, carry),
            2 => self.regs.a = self.sub(value, false),
            3 => self.regs.a = self.sub(value, carry),
            4 => self.and(value),
            5 => self.logic(self.regs.a ^ value),
            6 => self.logic(self.regs.a | value),
            _ => {
                self.sub(value, false);
            }
        }
    }

    fn inr(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.regs.flags.set(Flags::AUX_CARRY, result & 0x0F == 0);
        self.regs.flags.set_zsp(result);
        result
    }

    fn dcr(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.regs.flags.set(Flags::AUX_CARRY, result & 0x0F != 0x0F);
        self.regs.flags.set_zsp(result);
        result
    }

    fn daa(&mut self) {
        let a = self.regs.a;
        let mut carry = self.regs.flags.contains(Flags::CARRY);
        let low = a & 0x0F;
        let high = a >> 4;
        let mut correction = 0;

        if self.regs.flags.contains(Flags::AUX_CARRY) || low > 9 {
            correction += 0x06;
        }
        if carry || high > 9 || (high >= 9 && low > 9) {
            correction += 0x60;
            carry = true;
        }

        self.add(correction, false);
        self.regs.flags.set(Flags::CARRY, carry);
    }

    fn dad(&mut self, value: u16) {
        let result = self.regs.hl() as u32 + value as u32;
        self.regs.flags.set(Flags::CARRY, result > 0xFFFF);
        self.regs.set_hl(result as u16);
    }

    fn jump(&mut self, taken: bool) {
        let target = self.fetch_word();
        if taken {
            self.regs.pc = target;
        }
    }

    fn call(&mut self, target: u16) {
        let action = self
            .hooks
            .before_call(target, &mut self.regs, &mut self.bus);
        if action == CallAction::Skip {
            return;
        }
        self.push(self.regs.pc);
        self.regs.pc = target;
    }

    fn ret(&mut self) {
        self.regs.pc = self.pop();
    }

    fn execute(&mut self, opcode: u8, pc: u16) -> Result<u32, CpuError> {
        if self.strict_opcodes && is_undocumented(opcode) {
            return Err(CpuError::UnknownOpcode { opcode, pc });
        }

        let mut cycles = CYCLES[opcode as usize] as u32;
        let dst = (opcode >> 3) & 0x07;
        let src = opcode & 0x07;
        let pair = (opcode >> 4) & 0x03;

        match opcode {
            // NOP and its aliases
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {}

            // LXI rp, d16
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_word();
                self.set_pair(pair, value);
            }
            // STAX B / STAX D
            0x02 | 0x12 => self.write(self.get_pair(pair), self.regs.a),
            // LDAX B / LDAX D
            0x0A | 0x1A => self.regs.a = self.read(self.get_pair(pair)),
            // INX rp
            0x03 | 0x13 | 0x23 | 0x33 => {
                let value = self.get_pair(pair).wrapping_add(1);
                self.set_pair(pair, value);
            }
            // DCX rp
            0x0B | 0x1B | 0x2B | 0x3B => {
                let value = self.get_pair(pair).wrapping_sub(1);
                self.set_pair(pair, value);
            }
            // DAD rp
            0x09 | 0x19 | 0x29 | 0x39 => self.dad(self.get_pair(pair)),

            // INR r / DCR r / MVI r, d8
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let value = self.get_reg(dst);
                let value = self.inr(value);
                self.set_reg(dst, value);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let value = self.get_reg(dst);
                let value = self.dcr(value);
                self.set_reg(dst, value);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let value = self.fetch_byte();
                self.set_reg(dst, value);
            }

            // RLC
            0x07 => {
                let a = self.regs.a;
                self.regs.flags.set(Flags::CARRY, a & 0x80 != 0);
                self.regs.a = a.rotate_left(1);
            }
            // RRC
            0x0F => {
                let a = self.regs.a;
                self.regs.flags.set(Flags::CARRY, a & 0x01 != 0);
                self.regs.a = a.rotate_right(1);
            }
            // RAL
            0x17 => {
                let a = self.regs.a;
                let carry = self.regs.flags.contains(Flags::CARRY) as u8;
                self.regs.flags.set(Flags::CARRY, a & 0x80 != 0);
                self.regs.a = (a << 1) | carry;
            }
            // RAR
            0x1F => {
                let a = self.regs.a;
                let carry = self.regs.flags.contains(Flags::CARRY) as u8;
                self.regs.flags.set(Flags::CARRY, a & 0x01 != 0);
                self.regs.a = (a >> 1) | (carry << 7);
            }

            // SHLD / LHLD
            0x22 => {
                let address = self.fetch_word();
                self.bus.write_word(address, self.regs.hl());
            }
            0x2A => {
                let address = self.fetch_word();
                let value = self.bus.read_word(address);
                self.regs.set_hl(value);
            }
            // DAA / CMA
            0x27 => self.daa(),
            0x2F => self.regs.a = !self.regs.a,
            // STA / LDA
            0x32 => {
                let address = self.fetch_word();
                self.write(address, self.regs.a);
            }
            0x3A => {
                let address = self.fetch_word();
                self.regs.a = self.read(address);
            }
            // STC / CMC
            0x37 => self.regs.flags.insert(Flags::CARRY),
            0x3F => self.regs.flags.toggle(Flags::CARRY),

            // HLT
            0x76 => {
                tracing::debug!("[CPU] HLT at {:04X}", pc);
                self.halted = true;
            }
            // MOV dst, src
            0x40..=0x7F => {
                let value = self.get_reg(src);
                self.set_reg(dst, value);
            }
            // ADD/ADC/SUB/SBB/ANA/XRA/ORA/CMP r
            0x80..=0xBF => {
                let value = self.get_reg(src);
                self.alu(dst, value);
            }
            // ADI/ACI/SUI/SBI/ANI/XRI/ORI/CPI d8
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let value = self.fetch_byte();
                self.alu(dst, value);
            }

            // Rcc
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                if self.condition(dst) {
                    self.ret();
                    cycles += BRANCH_TAKEN_CYCLES;
                }
            }
            // RET (0xD9 alias)
            0xC9 | 0xD9 => self.ret(),
            // POP rp / POP PSW
            0xC1 | 0xD1 | 0xE1 => {
                let value = self.pop();
                self.set_pair(pair, value);
            }
            0xF1 => {
                let value = self.pop();
                self.regs.set_psw(value);
            }
            // PUSH rp / PUSH PSW
            0xC5 | 0xD5 | 0xE5 => self.push(self.get_pair(pair)),
            0xF5 => self.push(self.regs.psw()),

            // Jcc
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let taken = self.condition(dst);
                self.jump(taken);
            }
            // JMP (0xCB alias)
            0xC3 | 0xCB => self.jump(true),
            // Ccc
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let target = self.fetch_word();
                if self.condition(dst) {
                    self.call(target);
                    cycles += BRANCH_TAKEN_CYCLES;
                }
            }
            // CALL (0xDD, 0xED, 0xFD aliases)
            0xCD | 0xDD | 0xED | 0xFD => {
                let target = self.fetch_word();
                self.call(target);
            }
            // RST n
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.call((dst as u16) * 8);
            }

            // OUT / IN
            0xD3 => {
                let port = self.fetch_byte();
                self.bus.write(IO_BASE + port as u32, self.regs.a);
            }
            0xDB => {
                let port = self.fetch_byte();
                self.regs.a = self.bus.read(IO_BASE + port as u32);
            }

            // XTHL
            0xE3 => {
                let value = self.bus.read_word(self.regs.sp);
                self.bus.write_word(self.regs.sp, self.regs.hl());
                self.regs.set_hl(value);
            }
            // PCHL / SPHL / XCHG
            0xE9 => self.regs.pc = self.regs.hl(),
            0xF9 => self.regs.sp = self.regs.hl(),
            0xEB => {
                let de = self.regs.de();
                let hl = self.regs.hl();
                self.regs.set_de(hl);
                self.regs.set_hl(de);
            }

            // DI / EI
            0xF3 => self.regs.inte = false,
            0xFB => {
                self.regs.inte = true;
                self.ei_delay = true;
            }
        }

        Ok(cycles)
    }
}

impl<B: MemoryBus> fmt::Debug for I8080<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I8080")
            .field("regs", &self.regs)
            .field("halted", &self.halted)
            .field("ei_delay", &self.ei_delay)
            .field("interrupt", &self.interrupt)
            .field("cycle_debt", &self.cycle_debt)
            .field("total_cycles", &self.total_cycles)
            .field("fault", &self.fault)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatMemory;

    fn cpu_with(program: &[u8]) -> I8080<FlatMemory> {
        let mut cpu = I8080::new(FlatMemory::new());
        cpu.load(program, 0);
        cpu
    }

    fn run_steps(cpu: &mut I8080<FlatMemory>, steps: usize) {
        for _ in 0..steps {
            cpu.step().unwrap();
        }
    }

    #[test]
    fn test_every_opcode_decodes() {
        for opcode in 0..=255u8 {
            let mut cpu = I8080::new(FlatMemory::new());
            cpu.regs.sp = 0x8000;
            cpu.load(&[opcode, 0x00, 0x10], 0);
            assert!(cpu.step().is_ok(), "opcode {:02X}", opcode);
        }
    }

    #[test]
    fn test_reset_state() {
        let mut cpu = cpu_with(&[0x3E, 0x42, 0xFB, 0x76]);
        run_steps(&mut cpu, 3);
        cpu.reset();
        assert_eq!(cpu.regs, Registers { sp: RESET_SP, ..Registers::default() });
        assert!(!cpu.halted());
    }

    #[test]
    fn test_add_flags() {
        // MVI A,0x8F; ADI 0x71
        let mut cpu = cpu_with(&[0x3E, 0x8F, 0xC6, 0x71]);
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        assert!(cpu.regs.flags.contains(Flags::AUX_CARRY));
        assert!(cpu.regs.flags.contains(Flags::ZERO));
        assert!(cpu.regs.flags.contains(Flags::PARITY));
        assert!(!cpu.regs.flags.contains(Flags::SIGN));
    }

    #[test]
    fn test_sub_borrow_and_aux_carry() {
        // MVI A,0x3E; SUI 0x3E  -> zero, no borrow, AC set (8080 convention)
        let mut cpu = cpu_with(&[0x3E, 0x3E, 0xD6, 0x3E, 0xD6, 0x01]);
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
        assert!(cpu.regs.flags.contains(Flags::AUX_CARRY));
        assert!(cpu.regs.flags.contains(Flags::ZERO));

        // SUI 0x01 -> 0xFF with borrow
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.regs.a, 0xFF);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        assert!(!cpu.regs.flags.contains(Flags::AUX_CARRY));
        assert!(cpu.regs.flags.contains(Flags::SIGN));
    }

    #[test]
    fn test_compare_leaves_accumulator() {
        // MVI A,0x0A; CPI 0x05; CPI 0x0A; CPI 0x0B
        let mut cpu = cpu_with(&[0x3E, 0x0A, 0xFE, 0x05, 0xFE, 0x0A, 0xFE, 0x0B]);
        run_steps(&mut cpu, 2);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
        assert!(!cpu.regs.flags.contains(Flags::ZERO));
        run_steps(&mut cpu, 1);
        assert!(cpu.regs.flags.contains(Flags::ZERO));
        run_steps(&mut cpu, 1);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        assert_eq!(cpu.regs.a, 0x0A);
    }

    #[test]
    fn test_logical_ops_clear_carry() {
        // STC; MVI A,0xF0; ANI 0x18 (AC from bit 3 of operands); STC; ORI 0x01; STC; XRI 0xFF
        let mut cpu = cpu_with(&[
            0x37, 0x3E, 0xF0, 0xE6, 0x18, 0x37, 0xF6, 0x01, 0x37, 0xEE, 0xFF,
        ]);
        run_steps(&mut cpu, 3);
        assert_eq!(cpu.regs.a, 0x10);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
        assert!(cpu.regs.flags.contains(Flags::AUX_CARRY));

        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0x11);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
        assert!(!cpu.regs.flags.contains(Flags::AUX_CARRY));

        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0xEE);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
        assert!(cpu.regs.flags.contains(Flags::SIGN));
    }

    #[test]
    fn test_inr_dcr_keep_carry() {
        // STC; MVI B,0xFF; INR B; DCR B
        let mut cpu = cpu_with(&[0x37, 0x06, 0xFF, 0x04, 0x05]);
        run_steps(&mut cpu, 3);
        assert_eq!(cpu.regs.b, 0x00);
        assert!(cpu.regs.flags.contains(Flags::ZERO | Flags::AUX_CARRY | Flags::CARRY));
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.regs.b, 0xFF);
        assert!(!cpu.regs.flags.contains(Flags::AUX_CARRY));
        assert!(cpu.regs.flags.contains(Flags::CARRY | Flags::SIGN));
    }

    #[test]
    fn test_daa() {
        // MVI A,0x9B; DAA -> 0x01 with carry and AC
        let mut cpu = cpu_with(&[0x3E, 0x9B, 0x27]);
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0x01);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        assert!(cpu.regs.flags.contains(Flags::AUX_CARRY));
    }

    #[test]
    fn test_rotates() {
        // MVI A,0x81; RLC; RRC; STC; CMC; RAL; RAR
        let mut cpu = cpu_with(&[0x3E, 0x81, 0x07, 0x0F, 0x37, 0x3F, 0x17, 0x1F]);
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0x03);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.regs.a, 0x81);
        run_steps(&mut cpu, 3);
        assert_eq!(cpu.regs.a, 0x02);
        assert!(cpu.regs.flags.contains(Flags::CARRY));
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.regs.a, 0x81);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
    }

    #[test]
    fn test_call_and_ret_stack_layout() {
        // LXI SP,0x2000; CALL 0x0010; HLT ... 0x0010: RET
        let mut cpu = cpu_with(&[0x31, 0x00, 0x20, 0xCD, 0x10, 0x00, 0x76]);
        cpu.load(&[0xC9], 0x0010);

        run_steps(&mut cpu, 2);
        assert_eq!(cpu.pc(), 0x0010);
        assert_eq!(cpu.regs.sp, 0x1FFE);
        assert_eq!(cpu.bus.data[0x1FFE], 0x06);
        assert_eq!(cpu.bus.data[0x1FFF], 0x00);

        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.sp, 0x2000);
        assert!(cpu.halted());
    }

    #[test]
    fn test_conditional_branch_cycles() {
        // XRA A (Z set); CNZ 0x0100 (not taken); CZ 0x0100 (taken)
        let mut cpu = cpu_with(&[0xAF, 0xC4, 0x00, 0x01, 0xCC, 0x00, 0x01]);
        cpu.regs.sp = 0x4000;
        cpu.load(&[0xC0, 0xC8], 0x0100);

        assert_eq!(cpu.step().unwrap(), 4);
        assert_eq!(cpu.step().unwrap(), 11);
        assert_eq!(cpu.step().unwrap(), 17);
        assert_eq!(cpu.pc(), 0x0100);
        // RNZ not taken, RZ taken
        assert_eq!(cpu.step().unwrap(), 5);
        assert_eq!(cpu.step().unwrap(), 11);
        assert_eq!(cpu.pc(), 0x0007);
    }

    #[test]
    fn test_push_pop_psw() {
        // LXI SP,0x3000; MVI A,0x55; STC; PUSH PSW; POP B
        let mut cpu = cpu_with(&[0x31, 0x00, 0x30, 0x3E, 0x55, 0x37, 0xF5, 0xC1]);
        run_steps(&mut cpu, 5);
        assert_eq!(cpu.regs.b, 0x55);
        assert_eq!(cpu.regs.c, 0x03);
    }

    #[test]
    fn test_xthl_xchg_dad() {
        // LXI SP,0x3000; LXI H,0x1234; PUSH H; LXI H,0xABCD; XTHL
        let mut cpu = cpu_with(&[
            0x31, 0x00, 0x30, 0x21, 0x34, 0x12, 0xE5, 0x21, 0xCD, 0xAB, 0xE3, 0x11, 0x01, 0x00,
            0xEB, 0x29,
        ]);
        run_steps(&mut cpu, 5);
        assert_eq!(cpu.regs.hl(), 0x1234);
        assert_eq!(cpu.bus.read_word(0x2FFE), 0xABCD);

        // LXI D,0x0001; XCHG; DAD H
        run_steps(&mut cpu, 3);
        assert_eq!(cpu.regs.de(), 0x1234);
        assert_eq!(cpu.regs.hl(), 0x0002);
        assert!(!cpu.regs.flags.contains(Flags::CARRY));
    }

    #[test]
    fn test_memory_operand() {
        // LXI H,0x0200; MVI M,0x7F; INR M; MOV A,M
        let mut cpu = cpu_with(&[0x21, 0x00, 0x02, 0x36, 0x7F, 0x34, 0x7E]);
        run_steps(&mut cpu, 4);
        assert_eq!(cpu.regs.a, 0x80);
        assert_eq!(cpu.bus.data[0x0200], 0x80);
        assert!(cpu.regs.flags.contains(Flags::SIGN | Flags::AUX_CARRY));
    }

    #[test]
    fn test_io_ports() {
        // MVI A,0x42; OUT 0x10; IN 0x11
        let mut cpu = cpu_with(&[0x3E, 0x42, 0xD3, 0x10, 0xDB, 0x11]);
        cpu.bus.ports[0x11] = 0x99;
        run_steps(&mut cpu, 3);
        assert_eq!(cpu.bus.ports[0x10], 0x42);
        assert_eq!(cpu.regs.a, 0x99);
    }

    #[test]
    fn test_pc_wraps() {
        let mut cpu = I8080::new(FlatMemory::new());
        cpu.regs.pc = 0xFFFF;
        cpu.step().unwrap();
        assert_eq!(cpu.pc(), 0x0000);
    }

    #[test]
    fn test_run_respects_budget() {
        // JMP 0x0000, 10 cycles each
        let mut cpu = cpu_with(&[0xC3, 0x00, 0x00]);
        assert_eq!(cpu.run(25).unwrap(), 30);
        // 5 cycles of debt carried over
        assert_eq!(cpu.run(25).unwrap(), 20);
        assert_eq!(cpu.total_cycles(), 50);
        assert_eq!(cpu.run(0).unwrap(), 0);
    }

    #[test]
    fn test_halt_idles_out_budget() {
        let mut cpu = cpu_with(&[0x76]);
        assert_eq!(cpu.run(1000).unwrap(), 1000);
        assert!(cpu.halted());
        assert_eq!(cpu.pc(), 0x0001);
    }

    #[test]
    fn test_interrupt_wakes_halt() {
        // LXI SP,0x1000; EI; HLT ; RST 1 handler at 0x0008: MVI A,0x11; HLT
        let mut cpu = cpu_with(&[0x31, 0x00, 0x10, 0xFB, 0x76]);
        cpu.load(&[0x3E, 0x11, 0x76], 0x0008);
        run_steps(&mut cpu, 3);
        assert!(cpu.halted());
        assert!(cpu.regs.inte);

        cpu.interrupt(Interrupt::Rst(1));
        assert_eq!(cpu.step().unwrap(), INTERRUPT_CYCLES);
        assert!(!cpu.halted());
        assert!(!cpu.regs.inte);
        assert_eq!(cpu.pc(), 0x0008);
        assert_eq!(cpu.bus.read_word(0x0FFE), 0x0005);

        run_steps(&mut cpu, 2);
        assert_eq!(cpu.regs.a, 0x11);
    }

    #[test]
    fn test_interrupts_wait_for_ei() {
        // NOP; EI; NOP; NOP
        let mut cpu = cpu_with(&[0x00, 0xFB, 0x00, 0x00]);
        cpu.regs.sp = 0x1000;
        cpu.interrupt(Interrupt::Rst(7));
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.pc(), 0x0002);
        // The instruction after EI still runs before the interrupt.
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0003);
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0038);
    }

    #[test]
    fn test_di_after_ei_keeps_interrupts_disabled() {
        // LXI SP,1000; EI; DI; NOP; NOP
        let mut cpu = cpu_with(&[0x31, 0x00, 0x10, 0xFB, 0xF3, 0x00, 0x00]);
        run_steps(&mut cpu, 3);
        assert!(!cpu.regs.inte);

        cpu.interrupt(Interrupt::Rst(7));
        run_steps(&mut cpu, 2);
        assert_eq!(cpu.pc(), 0x0007);
        assert!(cpu.interrupt_pending());
    }

    #[test]
    fn test_repeated_ei_defers_to_next_instruction() {
        // LXI SP,1000; EI; EI; NOP; NOP
        let mut cpu = cpu_with(&[0x31, 0x00, 0x10, 0xFB, 0xFB, 0x00, 0x00]);
        cpu.interrupt(Interrupt::Rst(7));
        run_steps(&mut cpu, 3);
        assert!(cpu.regs.inte);
        assert_eq!(cpu.pc(), 0x0005);

        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0006);
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0038);
        assert_eq!(cpu.bus.read_word(0x0FFE), 0x0006);
    }

    #[test]
    fn test_strict_opcodes_fault() {
        let mut cpu = cpu_with(&[0x00, 0xDD]);
        cpu.strict_opcodes = true;
        let err = cpu.run(100).unwrap_err();
        assert_eq!(err, CpuError::UnknownOpcode { opcode: 0xDD, pc: 0x0001 });
        assert!(matches!(cpu.run(100), Err(CpuError::Faulted(_))));

        cpu.reset();
        assert!(cpu.fault().is_none());
    }

    #[test]
    fn test_undocumented_aliases() {
        // 0xCB = JMP 0x0010, 0x0010: 0xFD = CALL 0x0020, 0x0020: 0xD9 = RET
        let mut cpu = cpu_with(&[0xCB, 0x10, 0x00]);
        cpu.regs.sp = 0x1000;
        cpu.load(&[0xFD, 0x20, 0x00], 0x0010);
        cpu.load(&[0xD9], 0x0020);
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0010);
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0020);
        run_steps(&mut cpu, 1);
        assert_eq!(cpu.pc(), 0x0013);
    }
}
