//! CP/M style harness for 8080 diagnostic images.
//!
//! Memory layout:
//! - 0x0000: warm boot, a HALT so the run ends when the program exits
//! - 0x0005: BDOS entry, intercepted by `CpmBdos` before the call happens
//! - 0x0038: RST 7 vector
//! - 0x0080: number of the failing check, written by the diagnostic
//! - 0x0100: program load address

use std::collections::HashMap;

use retrobus::{hex, CpmBdos, Interrupt, Machine, MachineBuilder};
use tracing_subscriber::fmt;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let fmt_subscriber = fmt::Subscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
        .expect("Unable to set global tracing subscriber");
}

/// Ten simulated seconds at the default 2 MHz / 20 ticks per second.
const MAX_TICKS: usize = 200;

const FAILED_CHECK: u16 = 0x0080;

const JMP: u8 = 0xC3;
const CALL: u8 = 0xCD;
const JNZ: u8 = 0xC2;
const JZ: u8 = 0xCA;
const JNC: u8 = 0xD2;
const JC: u8 = 0xDA;
const JPO: u8 = 0xE2;
const JPE: u8 = 0xEA;
const JP: u8 = 0xF2;
const JM: u8 = 0xFA;
const CNZ: u8 = 0xC4;
const CZ: u8 = 0xCC;
const CNC: u8 = 0xD4;
const CC: u8 = 0xDC;
const LXI_D: u8 = 0x11;

/// Flag byte as pushed by PUSH PSW: S Z 0 AC 0 P 1 CY.
const F: u8 = 0x02;
const CY: u8 = 0x01;
const P: u8 = 0x04;
const AC: u8 = 0x10;
const Z: u8 = 0x40;
const S: u8 = 0x80;

/// Setup and operation, then the expected accumulator and flag byte.
#[rustfmt::skip]
const ALU_CHECKS: &[(&[u8], u8, u8)] = &[
    // ADI / ADD
    (&[0x3E, 0x00, 0xC6, 0x00], 0x00, F | Z | P),
    (&[0x3E, 0x8F, 0xC6, 0x71], 0x00, F | Z | P | AC | CY),
    (&[0x3E, 0x7F, 0xC6, 0x01], 0x80, F | S | AC),
    (&[0x3E, 0xFF, 0xC6, 0xFF], 0xFE, F | S | AC | CY),
    (&[0x3E, 0x8F, 0x0E, 0x71, 0x81], 0x00, F | Z | P | AC | CY),
    // ACI with carry in
    (&[0x37, 0x3E, 0x0F, 0xCE, 0x00], 0x10, F | AC),
    (&[0x37, 0x3E, 0xFF, 0xCE, 0x00], 0x00, F | Z | P | AC | CY),
    // SUI: AC is the inverted half borrow
    (&[0x3E, 0x00, 0xD6, 0x01], 0xFF, F | S | P | CY),
    (&[0x3E, 0x10, 0xD6, 0x01], 0x0F, F | P),
    (&[0x3E, 0x3E, 0xD6, 0x3E], 0x00, F | Z | P | AC),
    // SBI with and without borrow in
    (&[0x37, 0x3E, 0x00, 0xDE, 0x00], 0xFF, F | S | P | CY),
    (&[0x37, 0x3E, 0x80, 0xDE, 0x7F], 0x00, F | Z | P),
    (&[0xB7, 0x3E, 0x10, 0xDE, 0x01], 0x0F, F | P),
    // SUB M
    (&[0x21, 0x20, 0x08, 0x36, 0x3E, 0x3E, 0x3E, 0x96], 0x00, F | Z | P | AC),
    // ANI: AC from bit 3 of either operand, CY cleared
    (&[0x37, 0x3E, 0xF0, 0xE6, 0x18], 0x10, F | AC),
    (&[0x3E, 0x0F, 0xE6, 0xF0], 0x00, F | Z | P | AC),
    (&[0x3E, 0x33, 0xE6, 0x44], 0x00, F | Z | P),
    // XRI / ORI clear CY and AC
    (&[0x37, 0x3E, 0x5A, 0xEE, 0xFF], 0xA5, F | S | P),
    (&[0x37, 0x3E, 0x00, 0xF6, 0x00], 0x00, F | Z | P),
    (&[0x3E, 0x01, 0xF6, 0x80], 0x81, F | S | P),
    // CPI leaves A alone
    (&[0x3E, 0x05, 0xFE, 0x06], 0x05, F | S | P | CY),
    (&[0x3E, 0x06, 0xFE, 0x05], 0x06, F | AC),
    (&[0x3E, 0x42, 0xFE, 0x42], 0x42, F | Z | P | AC),
    // INR / DCR keep CY
    (&[0x37, 0x3E, 0xFF, 0x3C], 0x00, F | Z | P | AC | CY),
    (&[0xB7, 0x3E, 0x7F, 0x3C], 0x80, F | S | AC),
    (&[0x37, 0x3E, 0x00, 0x3D], 0xFF, F | S | P | CY),
    (&[0xB7, 0x3E, 0x10, 0x3D], 0x0F, F | P),
    (&[0xB7, 0x3E, 0x01, 0x3D], 0x00, F | Z | P | AC),
    // DAA
    (&[0x3E, 0x38, 0xC6, 0x45, 0x27], 0x83, F | S | AC),
    (&[0x3E, 0x99, 0xC6, 0x01, 0x27], 0x00, F | Z | P | AC | CY),
    (&[0x3E, 0x09, 0xC6, 0x08, 0x27], 0x17, F | P),
    (&[0x3E, 0x90, 0xC6, 0x90, 0x27], 0x80, F | S | CY),
    // Rotates only touch CY
    (&[0xAF, 0x3E, 0x81, 0x07], 0x03, F | Z | P | CY),
    (&[0xAF, 0x3E, 0x01, 0x0F], 0x80, F | Z | P | CY),
    (&[0xAF, 0x37, 0x3E, 0x80, 0x17, 0x17], 0x03, F | Z | P),
    (&[0xAF, 0x37, 0x3E, 0x01, 0x1F, 0x1F], 0xC0, F | Z | P),
    // CMA / STC / CMC
    (&[0xAF, 0x3E, 0x5A, 0x2F], 0xA5, F | Z | P),
    (&[0xAF, 0x37, 0x3F], 0x00, F | Z | P),
    (&[0xAF, 0x37, 0x3F, 0x3F], 0x00, F | Z | P | CY),
];

/// Code after `XRA A`, then the expected HL and carry. DE is free to use.
#[rustfmt::skip]
const PAIR_CHECKS: &[(&[u8], u16, bool)] = &[
    // DAD H, DAD D
    (&[0x21, 0x01, 0x80, 0x29], 0x0002, true),
    (&[0x21, 0x34, 0x12, 0x11, 0x11, 0x11, 0x19], 0x2345, false),
    // SHLD / LHLD
    (&[0x21, 0xEF, 0xBE, 0x22, 0x00, 0x08, 0x21, 0x00, 0x00, 0x2A, 0x00, 0x08], 0xBEEF, false),
    // XCHG
    (&[0x21, 0x34, 0x12, 0x11, 0x78, 0x56, 0xEB], 0x5678, false),
    // PUSH H; XTHL; POP H
    (&[0x21, 0x57, 0x13, 0xE5, 0x21, 0x68, 0x24, 0xE3, 0xE1], 0x2468, false),
    // INX / DCX wrap without flags
    (&[0x21, 0xFF, 0xFF, 0x23], 0x0000, false),
    (&[0x21, 0x00, 0x00, 0x2B], 0xFFFF, false),
    // SPHL; DAD SP
    (&[0x21, 0x00, 0x0F, 0xF9, 0x21, 0x00, 0x00, 0x39, 0x31, 0x00, 0x10], 0x0F00, false),
];

/// Two pass assembler: raw bytes plus 16-bit label references patched at the end.
struct Asm {
    origin: u16,
    bytes: Vec<u8>,
    labels: HashMap<&'static str, u16>,
    fixups: Vec<(usize, &'static str)>,
}

impl Asm {
    fn new(origin: u16) -> Self {
        Self {
            origin,
            bytes: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    fn label(&mut self, name: &'static str) -> &mut Self {
        let address = self.origin + self.bytes.len() as u16;
        self.labels.insert(name, address);
        self
    }

    fn emit(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Opcode followed by the address of `label`.
    fn emit_ref(&mut self, opcode: u8, label: &'static str) -> &mut Self {
        self.bytes.push(opcode);
        self.fixups.push((self.bytes.len(), label));
        self.bytes.extend_from_slice(&[0, 0]);
        self
    }

    fn address(&self, label: &str) -> u16 {
        self.labels[label]
    }

    fn assemble(&mut self) -> Vec<u8> {
        for (at, label) in &self.fixups {
            let target = self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("undefined label {}", label));
            self.bytes[*at..*at + 2].copy_from_slice(&target.to_le_bytes());
        }
        self.bytes.clone()
    }
}

/// Builds a self-checking diagnostic. Each check loads its number into B,
/// runs, and compares against the expected state; a mismatch stores B at
/// `FAILED_CHECK` and prints `CPU HAS FAILED`.
///
/// RST 7 is expected to be latched before the run. It must stay masked
/// through `EI; DI` and be taken right after the instruction that follows
/// the final `EI`.
fn diagnostic() -> (Vec<u8>, u16) {
    let mut asm = Asm::new(0x0100);
    asm.emit(&[0x31, 0x00, 0x10]) // LXI SP,1000
        .emit(&[0x06, 0xFE, 0xFB, 0xF3, 0x00, 0x00]); // MVI B,FE; EI; DI; NOP; NOP

    let mut number = 1u8;
    for (code, a, flags) in ALU_CHECKS {
        asm.emit(&[0x06, number])
            .emit(code)
            .emit(&[LXI_D, *flags, *a])
            .emit_ref(CALL, "check_psw");
        number += 1;
    }

    for (code, hl, carry) in PAIR_CHECKS {
        let flags = if *carry { F | Z | P | CY } else { F | Z | P };
        asm.emit(&[0x06, number, 0xAF])
            .emit(code)
            .emit(&[LXI_D, flags, 0x00])
            .emit_ref(CALL, "check_psw")
            .emit(&[LXI_D])
            .emit(&hl.to_le_bytes())
            .emit_ref(CALL, "check_hl");
        number += 1;
    }

    // PUSH/POP PSW normalize the flag byte and drive the condition codes.
    asm.emit(&[0x06, number, 0x21, 0xFF, 0x12, 0xE5, 0xF1]) // LXI H,12FF; PUSH H; POP PSW
        .emit_ref(JNZ, "fail")
        .emit_ref(JNC, "fail")
        .emit_ref(JPO, "fail")
        .emit_ref(JP, "fail")
        .emit(&[LXI_D, S | Z | AC | P | F | CY, 0x12])
        .emit_ref(CALL, "check_psw");
    number += 1;
    asm.emit(&[0x06, number, 0x21, 0x00, 0x34, 0xE5, 0xF1]) // LXI H,3400; PUSH H; POP PSW
        .emit_ref(JZ, "fail")
        .emit_ref(JC, "fail")
        .emit_ref(JPE, "fail")
        .emit_ref(JM, "fail")
        .emit(&[LXI_D, F, 0x34])
        .emit_ref(CALL, "check_psw");
    number += 1;

    // Conditional calls and returns.
    asm.emit(&[0x06, number, 0xAF])
        .emit_ref(CNZ, "fail")
        .emit_ref(CC, "fail")
        .emit_ref(CZ, "return_if_zero")
        .emit(&[0x37])
        .emit_ref(CNC, "fail");
    number += 1;

    // The pending RST 7 lands between the NOP and the JMP.
    asm.emit(&[0x06, number, 0xFB, 0x00])
        .label("interrupt_return")
        .emit_ref(JMP, "fail");

    asm.label("interrupt_handler")
        .emit(&[0xE1]) // POP H
        .emit_ref(LXI_D, "interrupt_return")
        .emit_ref(CALL, "check_hl")
        .emit(&[0x0E, 0x09])
        .emit_ref(LXI_D, "passed")
        .emit_ref(CALL, "bdos")
        .emit(&[JMP, 0x00, 0x00]);

    // DE holds the expected A (D) and flags (E); HL is preserved.
    asm.label("check_psw")
        .emit(&[0xE5, 0xF5, 0xE1, 0x7C, 0xBA]) // PUSH H; PUSH PSW; POP H; MOV A,H; CMP D
        .emit_ref(JNZ, "fail")
        .emit(&[0x7D, 0xBB]) // MOV A,L; CMP E
        .emit_ref(JNZ, "fail")
        .emit(&[0xE1, 0xC9]); // POP H; RET

    asm.label("check_hl")
        .emit(&[0x7C, 0xBA])
        .emit_ref(JNZ, "fail")
        .emit(&[0x7D, 0xBB])
        .emit_ref(JNZ, "fail")
        .emit(&[0xC9]);

    asm.label("return_if_zero")
        .emit(&[0xC8]) // RZ
        .emit_ref(JMP, "fail");

    asm.label("fail")
        .emit(&[0x78, 0x32]) // MOV A,B; STA FAILED_CHECK
        .emit(&FAILED_CHECK.to_le_bytes())
        .emit(&[0x0E, 0x09])
        .emit_ref(LXI_D, "failed")
        .emit_ref(CALL, "bdos")
        .emit(&[JMP, 0x00, 0x00]);

    asm.label("passed").emit(b"CPU IS OPERATIONAL$");
    asm.label("failed").emit(b"CPU HAS FAILED$");
    asm.labels.insert("bdos", 0x0005);

    let program = asm.assemble();
    (program, asm.address("interrupt_handler"))
}

fn cpm_machine() -> (Machine, std::rc::Rc<std::cell::RefCell<String>>) {
    let bdos = CpmBdos::new();
    let output = bdos.output();
    let mut machine = MachineBuilder::new().ram().hooks(bdos).build().unwrap();
    machine.load(&[0x76], 0x0000);
    machine.cpu_mut().regs.pc = 0x0100;
    (machine, output)
}

fn run_until_exit(machine: &mut Machine) {
    for tick in 0..MAX_TICKS {
        machine.tick().unwrap();
        if machine.halted() {
            tracing::info!("Warm boot after {} tick(s)", tick + 1);
            return;
        }
    }
    tracing::warn!("Still running after {} ticks, PC={:04X}", MAX_TICKS, machine.pc());
}

#[test]
fn test_instruction_diagnostic() {
    let (program, handler) = diagnostic();
    let [low, high] = handler.to_le_bytes();

    let (mut machine, output) = cpm_machine();
    machine.load_hex(&hex::encode(0x0038, &[JMP, low, high])).unwrap();
    machine.load_hex(&hex::encode(0x0100, &program)).unwrap();
    machine.interrupt(Interrupt::Rst(7));
    run_until_exit(&mut machine);

    let failed = machine.memory(FAILED_CHECK, FAILED_CHECK)[0];
    assert!(machine.halted());
    assert_eq!(*output.borrow(), "CPU IS OPERATIONAL", "check {} failed", failed);
    assert!(!machine.cpu().interrupt_pending());
}

#[test]
#[ignore]
fn test_cpudiag() {
    let (mut machine, output) = cpm_machine();
    machine
        .load_hex_file("tests/data/cpudiag.hex")
        .expect("tests/data/cpudiag.hex not found");
    run_until_exit(&mut machine);

    let output = output.borrow();
    tracing::info!("Output: {}", output);
    assert!(output.contains("CPU IS OPERATIONAL"), "{}", output);
}
