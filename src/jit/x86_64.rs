//! x86-64 instruction sequences.
//!
//! SysV calling convention: `rdi` holds the pool base, `rsi` the status
//! word. `rdx` is the index register. Operands live on the native stack.
//! Every sequence has a fixed length; shorter operators are padded with
//! multi-byte NOPs up to [`EXEC_SIZE`].

use super::{CodeBuffer, JitError};
use crate::OperatorKind;

/// `mov edx, imm32` + `push qword [rdi + rdx*8]`
pub const FETCH_SIZE: usize = 8;
/// Longest operator sequence (division).
pub const EXEC_SIZE: usize = 39;
/// `pop rax` + `ret`
pub const EPILOGUE_SIZE: usize = 2;
/// Bytes of native stack per pending operand.
pub const STACK_CELL: usize = 8;

pub const FILLER: &[u8] = &[0x90];

const MOV_EDX_IMM32: u8 = 0xBA;
const PUSH_POOL_SLOT: [u8; 3] = [0xFF, 0x34, 0xD7];
const POP_RCX: u8 = 0x59;
const POP_RAX: u8 = 0x58;
const PUSH_RAX: u8 = 0x50;
const RET: u8 = 0xC3;

const ADD_RAX_RCX: [u8; 3] = [0x48, 0x01, 0xC8];
const SUB_RAX_RCX: [u8; 3] = [0x48, 0x29, 0xC8];
const XOR_RAX_RCX: [u8; 3] = [0x48, 0x31, 0xC8];
// One-operand form: rdx:rax = rax * rcx, so the high half lands in rdx.
const IMUL_RCX: [u8; 3] = [0x48, 0xF7, 0xE9];

// Divisor in rcx, dividend in rax, quotient left in rax.
// Offsets are relative to the start of the sequence (after the two pops).
#[rustfmt::skip]
const DIV_RAX_RCX: [u8; 36] = [
    0x48, 0x85, 0xC9,                         //  2: test rcx, rcx
    0x75, 9,                                  //  5: jnz .nonzero
    0x48, 0xC7, 0x06, 0x01, 0x00, 0x00, 0x00, //  7: mov qword [rsi], 1
    0xEB, 22,                                 // 14: jmp .push
    0x48, 0x83, 0xF9, 0xFF,                   // 16: .nonzero: cmp rcx, -1
    0x75, 5,                                  // 20: jne .divide
    0x48, 0xF7, 0xD8,                         // 22: neg rax
    0xEB, 11,                                 // 25: jmp .push
    0x49, 0x89, 0xD0,                         // 27: .divide: mov r8, rdx
    0x48, 0x99,                               // 30: cqo
    0x48, 0xF7, 0xF9,                         // 32: idiv rcx
    0x4C, 0x89, 0xC2,                         // 35: mov rdx, r8
];                                            // 38: .push

#[rustfmt::skip]
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

fn pad_to(buf: &mut CodeBuffer<'_>, end: usize) -> Result<(), JitError> {
    if buf.len() > end {
        return Err(JitError::SizeMismatch { needed: buf.len(), capacity: end });
    }
    while buf.len() < end {
        let n = (end - buf.len()).min(NOPS.len());
        buf.emit(NOPS[n - 1])?;
    }
    Ok(())
}

pub fn fetch(buf: &mut CodeBuffer<'_>, slot: u32, reload: bool) -> Result<(), JitError> {
    if reload {
        let mut mov = [MOV_EDX_IMM32; 5];
        mov[1..].copy_from_slice(&slot.to_le_bytes());
        buf.emit(&mov)?;
    } else {
        // same length as the mov, keeps the layout predictable
        buf.emit(NOPS[4])?;
    }
    buf.emit(&PUSH_POOL_SLOT)
}

pub fn exec(buf: &mut CodeBuffer<'_>, op: OperatorKind) -> Result<(), JitError> {
    let start = buf.len();
    buf.emit(&[POP_RCX, POP_RAX])?;
    match op {
        OperatorKind::Add => buf.emit(&ADD_RAX_RCX)?,
        OperatorKind::Sub => buf.emit(&SUB_RAX_RCX)?,
        OperatorKind::Xor => buf.emit(&XOR_RAX_RCX)?,
        OperatorKind::Mul => buf.emit(&IMUL_RCX)?,
        OperatorKind::Div => buf.emit(&DIV_RAX_RCX)?,
    }
    buf.emit(&[PUSH_RAX])?;
    pad_to(buf, start + EXEC_SIZE)
}

pub fn epilogue(buf: &mut CodeBuffer<'_>) -> Result<(), JitError> {
    buf.emit_epilogue(&[POP_RAX, RET])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut CodeBuffer<'_>)) -> Vec<u8> {
        let mut backing = vec![0u8; 256];
        let mut buf = CodeBuffer::new(&mut backing, 256).unwrap();
        f(&mut buf);
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_fetch_encoding() {
        let code = emitted(|b| fetch(b, 0x0102_0304, true).unwrap());
        assert_eq!(code, [0xBA, 0x04, 0x03, 0x02, 0x01, 0xFF, 0x34, 0xD7]);
    }

    #[test]
    fn test_fetch_elided_keeps_length() {
        let code = emitted(|b| fetch(b, 7, false).unwrap());
        assert_eq!(code.len(), FETCH_SIZE);
        assert_eq!(&code[..5], NOPS[4]);
        assert_eq!(&code[5..], &PUSH_POOL_SLOT);
    }

    #[test]
    fn test_div_is_longest_sequence() {
        assert_eq!(2 + DIV_RAX_RCX.len() + 1, EXEC_SIZE);
    }

    #[test]
    fn test_exec_add_padding() {
        let code = emitted(|b| exec(b, OperatorKind::Add).unwrap());
        assert_eq!(code.len(), EXEC_SIZE);
        assert_eq!(&code[..6], &[0x59, 0x58, 0x48, 0x01, 0xC8, 0x50]);
    }

    #[test]
    fn test_nop_table_lengths() {
        for (i, nop) in NOPS.iter().enumerate() {
            assert_eq!(nop.len(), i + 1);
        }
    }

    #[test]
    fn test_epilogue_encoding() {
        let mut backing = vec![0u8; 16];
        let mut buf = CodeBuffer::new(&mut backing, EPILOGUE_SIZE).unwrap();
        epilogue(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), &[0x58, 0xC3]);
    }
}
