//! AArch64 instruction sequences.
//!
//! AAPCS64: `x0` holds the pool base, `x1` the status word. `x9` is the
//! index register. Operands live on the native stack in 16-byte cells so
//! `sp` stays aligned.

use super::{CodeBuffer, JitError};
use crate::OperatorKind;

/// `movz`/`movk` index load + `ldr` + push
pub const FETCH_SIZE: usize = 16;
/// Longest operator sequence (division).
pub const EXEC_SIZE: usize = 28;
/// pop into `x0` + `ret`
pub const EPILOGUE_SIZE: usize = 8;
/// Bytes of native stack per pending operand; keeps `sp` 16-byte aligned.
pub const STACK_CELL: usize = 16;

const NOP: u32 = 0xD503201F;
pub const FILLER: &[u8] = &NOP.to_le_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reg {
    X0 = 0,
    X1 = 1,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
}

const POOL: Reg = Reg::X0;
const STATUS: Reg = Reg::X1;
const INDEX: Reg = Reg::X9;
const LHS: Reg = Reg::X10;
const RHS: Reg = Reg::X11;
const SP: u32 = 31;

fn inst(buf: &mut CodeBuffer<'_>, val: u32) -> Result<(), JitError> {
    buf.emit(&val.to_le_bytes())
}

// MOVZ Xd, #imm16
fn movz(rd: Reg, imm: u16) -> u32 {
    0xD2800000 | ((imm as u32) << 5) | rd as u32
}

// MOVK Xd, #imm16, LSL 16
fn movk_16(rd: Reg, imm: u16) -> u32 {
    0xF2A00000 | ((imm as u32) << 5) | rd as u32
}

// LDR Xt, [Xn, Xm, LSL #3]
fn ldr_indexed(rt: Reg, rn: Reg, rm: Reg) -> u32 {
    0xF8607800 | ((rm as u32) << 16) | ((rn as u32) << 5) | rt as u32
}

// STR Xt, [SP, #-16]!
fn push(rt: Reg) -> u32 {
    0xF81F0C00 | (SP << 5) | rt as u32
}

// LDR Xt, [SP], #16
fn pop(rt: Reg) -> u32 {
    0xF8410400 | (SP << 5) | rt as u32
}

// STR Xt, [Xn]
fn str(rt: Reg, rn: Reg) -> u32 {
    0xF9000000 | ((rn as u32) << 5) | rt as u32
}

fn add(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0x8B000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn sub(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0xCB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn eor(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0xCA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn mul(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0x9B007C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn smulh(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0x9B407C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

// SDIV never traps: x/0 = 0 and MIN/-1 = MIN.
fn sdiv(rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0x9AC00C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

// CBNZ Xt, +offset_instrs
fn cbnz(rt: Reg, offset_instrs: i32) -> u32 {
    let imm19 = (offset_instrs & 0x7FFFF) as u32;
    0xB5000000 | (imm19 << 5) | rt as u32
}

fn ret() -> u32 {
    0xD65F03C0
}

pub fn fetch(buf: &mut CodeBuffer<'_>, slot: u32, reload: bool) -> Result<(), JitError> {
    if reload {
        inst(buf, movz(INDEX, slot as u16))?;
        inst(buf, movk_16(INDEX, (slot >> 16) as u16))?;
    } else {
        inst(buf, NOP)?;
        inst(buf, NOP)?;
    }
    inst(buf, ldr_indexed(LHS, POOL, INDEX))?;
    inst(buf, push(LHS))
}

pub fn exec(buf: &mut CodeBuffer<'_>, op: OperatorKind) -> Result<(), JitError> {
    let start = buf.len();
    inst(buf, pop(RHS))?;
    inst(buf, pop(LHS))?;
    match op {
        OperatorKind::Add => inst(buf, add(LHS, LHS, RHS))?,
        OperatorKind::Sub => inst(buf, sub(LHS, LHS, RHS))?,
        OperatorKind::Xor => inst(buf, eor(LHS, LHS, RHS))?,
        OperatorKind::Mul => {
            // Widening multiply like x86-64: the high half goes to the
            // index register.
            inst(buf, smulh(INDEX, LHS, RHS))?;
            inst(buf, mul(LHS, LHS, RHS))?;
        }
        OperatorKind::Div => {
            inst(buf, cbnz(RHS, 3))?;
            inst(buf, movz(Reg::X12, 1))?;
            inst(buf, str(Reg::X12, STATUS))?;
            inst(buf, sdiv(LHS, LHS, RHS))?;
        }
    }
    inst(buf, push(LHS))?;

    if buf.len() > start + EXEC_SIZE {
        return Err(JitError::SizeMismatch { needed: buf.len() - start, capacity: EXEC_SIZE });
    }
    while buf.len() < start + EXEC_SIZE {
        inst(buf, NOP)?;
    }
    Ok(())
}

pub fn epilogue(buf: &mut CodeBuffer<'_>) -> Result<(), JitError> {
    let mut code = [0u8; EPILOGUE_SIZE];
    code[..4].copy_from_slice(&pop(Reg::X0).to_le_bytes());
    code[4..].copy_from_slice(&ret().to_le_bytes());
    buf.emit_epilogue(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut CodeBuffer<'_>)) -> Vec<u32> {
        let mut backing = vec![0u8; 256];
        let mut buf = CodeBuffer::new(&mut backing, 256).unwrap();
        f(&mut buf);
        buf.as_slice()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_stack_encodings() {
        assert_eq!(push(Reg::X0), 0xF81F0FE0);
        assert_eq!(pop(Reg::X0), 0xF84107E0);
    }

    #[test]
    fn test_fetch_encoding() {
        let code = words(|b| fetch(b, 0x0001_0002, true).unwrap());
        assert_eq!(code, [0xD2800049, 0xF2A00029, 0xF869780A, 0xF81F0FEA]);
    }

    #[test]
    fn test_fetch_elided_keeps_length() {
        let code = words(|b| fetch(b, 5, false).unwrap());
        assert_eq!(code.len() * 4, FETCH_SIZE);
        assert_eq!(&code[..2], &[NOP, NOP]);
    }

    #[test]
    fn test_exec_sizes() {
        for op in OperatorKind::ALL {
            let code = words(|b| exec(b, op).unwrap());
            assert_eq!(code.len() * 4, EXEC_SIZE, "{op:?}");
        }
    }

    #[test]
    fn test_mul_writes_index_register() {
        let code = words(|b| exec(b, OperatorKind::Mul).unwrap());
        assert_eq!(code[2] & 0x1F, INDEX as u32);
    }
}
