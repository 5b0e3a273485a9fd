use std::fmt;

use crate::bus::MemoryBus;

const REGISTERS: [&str; 8] = ["B", "C", "D", "E", "H", "L", "M", "A"];
const PAIRS: [&str; 4] = ["B", "D", "H", "SP"];
const CONDITIONS: [&str; 8] = ["NZ", "Z", "NC", "C", "PO", "PE", "P", "M"];
const ALU: [&str; 8] = ["ADD", "ADC", "SUB", "SBB", "ANA", "XRA", "ORA", "CMP"];
const ALU_IMMEDIATE: [&str; 8] = ["ADI", "ACI", "SUI", "SBI", "ANI", "XRI", "ORI", "CPI"];

/// One decoded instruction, for tracing and memory listings.
///
/// Operand bytes are captured when the instruction is parsed so the value
/// can outlive the bus borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: u16,
    pub opcode: u8,
    pub args: [u8; 2],
}

impl Instruction {
    pub fn parse_at(bus: &mut dyn MemoryBus, pc: u16) -> Self {
        let opcode = bus.read(pc as u32);
        let args = [
            bus.read(pc.wrapping_add(1) as u32),
            bus.read(pc.wrapping_add(2) as u32),
        ];
        Self { pc, opcode, args }
    }

    fn byte(&self) -> u8 {
        self.args[0]
    }

    fn word(&self) -> u16 {
        u16::from_le_bytes(self.args)
    }

    pub fn length(&self) -> u8 {
        match self.opcode {
            // MVI, immediate ALU ops, IN, OUT
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => 2,
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => 2,
            0xD3 | 0xDB => 2,
            // LXI, SHLD, LHLD, STA, LDA
            0x01 | 0x11 | 0x21 | 0x31 | 0x22 | 0x2A | 0x32 | 0x3A => 3,
            // jumps and calls, including the undocumented aliases
            0xC2 | 0xC3 | 0xC4 | 0xCA | 0xCB | 0xCC | 0xCD => 3,
            0xD2 | 0xD4 | 0xDA | 0xDC | 0xDD => 3,
            0xE2 | 0xE4 | 0xEA | 0xEC | 0xED => 3,
            0xF2 | 0xF4 | 0xFA | 0xFC | 0xFD => 3,
            _ => 1,
        }
    }

    pub fn name(&self) -> String {
        let opcode = self.opcode;
        let dst = ((opcode >> 3) & 0x07) as usize;
        let src = (opcode & 0x07) as usize;
        let pair = ((opcode >> 4) & 0x03) as usize;

        match opcode {
            0x00 => "NOP".to_string(),
            0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => "*NOP".to_string(),
            0x01 | 0x11 | 0x21 | 0x31 => format!("LXI {},#{:04X}", PAIRS[pair], self.word()),
            0x02 | 0x12 => format!("STAX {}", PAIRS[pair]),
            0x0A | 0x1A => format!("LDAX {}", PAIRS[pair]),
            0x03 | 0x13 | 0x23 | 0x33 => format!("INX {}", PAIRS[pair]),
            0x0B | 0x1B | 0x2B | 0x3B => format!("DCX {}", PAIRS[pair]),
            0x09 | 0x19 | 0x29 | 0x39 => format!("DAD {}", PAIRS[pair]),
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                format!("INR {}", REGISTERS[dst])
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                format!("DCR {}", REGISTERS[dst])
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                format!("MVI {},#{:02X}", REGISTERS[dst], self.byte())
            }
            0x07 => "RLC".to_string(),
            0x0F => "RRC".to_string(),
            0x17 => "RAL".to_string(),
            0x1F => "RAR".to_string(),
            0x22 => format!("SHLD #{:04X}", self.word()),
            0x2A => format!("LHLD #{:04X}", self.word()),
            0x27 => "DAA".to_string(),
            0x2F => "CMA".to_string(),
            0x32 => format!("STA #{:04X}", self.word()),
            0x3A => format!("LDA #{:04X}", self.word()),
            0x37 => "STC".to_string(),
            0x3F => "CMC".to_string(),
            0x76 => "HLT".to_string(),
            0x40..=0x7F => format!("MOV {},{}", REGISTERS[dst], REGISTERS[src]),
            0x80..=0xBF => format!("{} {}", ALU[dst], REGISTERS[src]),
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                format!("{} #{:02X}", ALU_IMMEDIATE[dst], self.byte())
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                format!("R{}", CONDITIONS[dst])
            }
            0xC9 => "RET".to_string(),
            0xD9 => "*RET".to_string(),
            0xC1 | 0xD1 | 0xE1 => format!("POP {}", PAIRS[pair]),
            0xF1 => "POP PSW".to_string(),
            0xC5 | 0xD5 | 0xE5 => format!("PUSH {}", PAIRS[pair]),
            0xF5 => "PUSH PSW".to_string(),
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                format!("J{} #{:04X}", CONDITIONS[dst], self.word())
            }
            0xC3 => format!("JMP #{:04X}", self.word()),
            0xCB => format!("*JMP #{:04X}", self.word()),
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                format!("C{} #{:04X}", CONDITIONS[dst], self.word())
            }
            0xCD => format!("CALL #{:04X}", self.word()),
            0xDD | 0xED | 0xFD => format!("*CALL #{:04X}", self.word()),
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => format!("RST {}", dst),
            0xD3 => format!("OUT #{:02X}", self.byte()),
            0xDB => format!("IN #{:02X}", self.byte()),
            0xE3 => "XTHL".to_string(),
            0xE9 => "PCHL".to_string(),
            0xEB => "XCHG".to_string(),
            0xF3 => "DI".to_string(),
            0xF9 => "SPHL".to_string(),
            0xFB => "EI".to_string(),
        }
    }

    pub fn opcode_with_args(&self) -> String {
        let mut out = format!("{:02X}", self.opcode);
        for arg in &self.args[..(self.length() as usize - 1)] {
            out.push_str(&format!(" {:02X}", arg));
        }
        out
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04X} {:<9} {}",
            self.pc,
            self.opcode_with_args(),
            self.name()
        )
    }
}

/// Disassembles `count` instructions starting at `pc`.
pub fn disassemble(bus: &mut dyn MemoryBus, pc: u16, count: usize) -> Vec<Instruction> {
    let mut pc = pc;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let instruction = Instruction::parse_at(bus, pc);
        pc = pc.wrapping_add(instruction.length() as u16);
        out.push(instruction);
    }
    out
}
