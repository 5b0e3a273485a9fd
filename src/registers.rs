use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// 8080 flag byte. Bit 1 always reads as 1, bits 3 and 5 as 0.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Flags: u8 {
        const CARRY = 0b0000_0001;
        const PARITY = 0b0000_0100;
        const AUX_CARRY = 0b0001_0000;
        const ZERO = 0b0100_0000;
        const SIGN = 0b1000_0000;
    }
}

impl Flags {
    const ALWAYS_SET: u8 = 0b0000_0010;

    /// Byte pushed by PUSH PSW.
    pub fn to_psw(self) -> u8 {
        self.bits() | Self::ALWAYS_SET
    }

    pub fn from_psw(value: u8) -> Self {
        Self::from_bits_truncate(value)
    }

    /// Sets Z, S and P from an ALU result.
    pub fn set_zsp(&mut self, value: u8) {
        self.set(Flags::ZERO, value == 0);
        self.set(Flags::SIGN, value & 0x80 != 0);
        self.set(Flags::PARITY, value.count_ones() % 2 == 0);
    }
}

/// Register file of the 8080.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub flags: Flags,
    pub inte: bool,
}

impl Registers {
    pub fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    pub fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    pub fn psw(&self) -> u16 {
        u16::from_be_bytes([self.a, self.flags.to_psw()])
    }

    pub fn set_bc(&mut self, value: u16) {
        [self.b, self.c] = value.to_be_bytes();
    }

    pub fn set_de(&mut self, value: u16) {
        [self.d, self.e] = value.to_be_bytes();
    }

    pub fn set_hl(&mut self, value: u16) {
        [self.h, self.l] = value.to_be_bytes();
    }

    pub fn set_psw(&mut self, value: u16) {
        let [a, f] = value.to_be_bytes();
        self.a = a;
        self.flags = Flags::from_psw(f);
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: Flags, c: char| if self.flags.contains(set) { c } else { '.' };
        write!(
            f,
            "#{:04X} A: #{:02X} B: #{:02X} C: #{:02X} D: #{:02X} E: #{:02X} H: #{:02X} L: #{:02X} SP: #{:04X} {}{}{}{}{}",
            self.pc,
            self.a,
            self.b,
            self.c,
            self.d,
            self.e,
            self.h,
            self.l,
            self.sp,
            flag(Flags::SIGN, 'S'),
            flag(Flags::ZERO, 'Z'),
            flag(Flags::AUX_CARRY, 'A'),
            flag(Flags::PARITY, 'P'),
            flag(Flags::CARRY, 'C'),
        )
    }
}
