//! Single-pass emitter and the bounds-checked buffer it writes into.

use super::{arch, JitError};
use crate::pool::{ConstantPool, SealedPool};
use crate::{Ast, Node, NumT, OperatorKind};

/// Whether the index register can be trusted to hold a slot already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedIndexState {
    Unknown,
    Known(u32),
}

/// Fixed-capacity, append-only view over the code region.
///
/// The last [`arch::EPILOGUE_SIZE`] bytes of the capacity are reserved: body
/// appends may never reach them, only [`CodeBuffer::emit_epilogue`] can.
pub struct CodeBuffer<'a> {
    bytes: &'a mut [u8],
    len: usize,
    capacity: usize,
}

impl<'a> CodeBuffer<'a> {
    pub fn new(bytes: &'a mut [u8], capacity: usize) -> Result<Self, JitError> {
        if capacity > bytes.len() || capacity < arch::EPILOGUE_SIZE {
            return Err(JitError::SizeMismatch {
                needed: capacity,
                capacity: bytes.len(),
            });
        }
        Ok(CodeBuffer { bytes, len: 0, capacity })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn emit(&mut self, code: &[u8]) -> Result<(), JitError> {
        self.append(code, self.capacity - arch::EPILOGUE_SIZE)
    }

    pub fn emit_epilogue(&mut self, code: &[u8]) -> Result<(), JitError> {
        self.append(code, self.capacity)
    }

    fn append(&mut self, code: &[u8], limit: usize) -> Result<(), JitError> {
        let end = self.len + code.len();
        if end > limit {
            return Err(JitError::SizeMismatch { needed: end, capacity: limit });
        }
        self.bytes[self.len..end].copy_from_slice(code);
        self.len = end;
        Ok(())
    }
}

/// One step of the emission pass, recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    Fetch { slot: u32, elided: bool },
    Operator { op: OperatorKind, index_after: TrustedIndexState },
}

/// Result of a completed pass.
#[derive(Debug)]
pub struct Emission {
    pub code_len: usize,
    pub pool: SealedPool,
    pub trace: Vec<Emitted>,
}

pub struct Emitter<'a> {
    buf: CodeBuffer<'a>,
    pool: ConstantPool,
    index: TrustedIndexState,
    trace: Vec<Emitted>,
}

impl<'a> Emitter<'a> {
    pub fn new(buf: CodeBuffer<'a>, leaf_count: usize) -> Self {
        Emitter {
            buf,
            pool: ConstantPool::with_capacity(leaf_count),
            index: TrustedIndexState::Unknown,
            trace: Vec::with_capacity(leaf_count * 2),
        }
    }

    pub fn index_state(&self) -> TrustedIndexState {
        self.index
    }

    /// Push the value of a literal, reusing the index register when it
    /// already holds the right slot.
    pub fn fetch(&mut self, value: NumT) -> Result<(), JitError> {
        let slot = self.pool.intern(value);
        let elided = self.index == TrustedIndexState::Known(slot);
        arch::fetch(&mut self.buf, slot, !elided)?;
        self.index = TrustedIndexState::Known(slot);
        self.trace.push(Emitted::Fetch { slot, elided });
        Ok(())
    }

    /// Pop two operands, push the result.
    pub fn operator(&mut self, op: OperatorKind) -> Result<(), JitError> {
        arch::exec(&mut self.buf, op)?;
        if op.clobbers_index() {
            self.index = TrustedIndexState::Unknown;
        }
        self.trace.push(Emitted::Operator { op, index_after: self.index });
        Ok(())
    }

    pub fn emit_tree(&mut self, ast: &Ast) -> Result<(), JitError> {
        for node in ast.post_order() {
            match node {
                Node::Leaf(v) => self.fetch(*v)?,
                Node::Binary { op, .. } => self.operator(*op)?,
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<Emission, JitError> {
        arch::epilogue(&mut self.buf)?;
        Ok(Emission {
            code_len: self.buf.len(),
            pool: self.pool.seal(),
            trace: self.trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::{EPILOGUE_SIZE, EXEC_SIZE, FETCH_SIZE};

    #[test]
    fn test_buffer_rejects_reserved_tail() {
        let mut backing = vec![0u8; 64];
        let mut buf = CodeBuffer::new(&mut backing, EPILOGUE_SIZE + 4).unwrap();
        buf.emit(&[1, 2, 3, 4]).unwrap();
        assert!(matches!(buf.emit(&[5]), Err(JitError::SizeMismatch { .. })));
        assert_eq!(buf.len(), 4);
        buf.emit_epilogue(&vec![0xEE; EPILOGUE_SIZE]).unwrap();
        assert!(matches!(buf.emit_epilogue(&[0]), Err(JitError::SizeMismatch { .. })));
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn test_buffer_capacity_must_fit_backing() {
        let mut backing = vec![0u8; 8];
        assert!(CodeBuffer::new(&mut backing, 9).is_err());
        assert!(CodeBuffer::new(&mut backing, 8).is_ok());
    }

    #[test]
    fn test_fetch_and_exec_sizes_are_fixed() {
        let mut backing = vec![0u8; 4096];
        let mut e = Emitter::new(CodeBuffer::new(&mut backing, 4096).unwrap(), 4);

        e.fetch(1).unwrap();
        assert_eq!(e.buf.len(), FETCH_SIZE);
        e.fetch(1).unwrap(); // elided
        assert_eq!(e.buf.len(), 2 * FETCH_SIZE);
        for (i, op) in OperatorKind::ALL.into_iter().enumerate() {
            e.operator(op).unwrap();
            assert_eq!(e.buf.len(), 2 * FETCH_SIZE + (i + 1) * EXEC_SIZE, "{op:?}");
        }
        let emission = e.finish().unwrap();
        assert_eq!(emission.code_len, 2 * FETCH_SIZE + 5 * EXEC_SIZE + EPILOGUE_SIZE);
    }

    #[test]
    fn test_index_state_transitions() {
        let mut backing = vec![0u8; 4096];
        let mut e = Emitter::new(CodeBuffer::new(&mut backing, 4096).unwrap(), 4);
        assert_eq!(e.index_state(), TrustedIndexState::Unknown);

        e.fetch(10).unwrap();
        assert_eq!(e.index_state(), TrustedIndexState::Known(0));
        e.fetch(20).unwrap();
        assert_eq!(e.index_state(), TrustedIndexState::Known(1));
        e.operator(OperatorKind::Add).unwrap();
        assert_eq!(e.index_state(), TrustedIndexState::Known(1));
        e.fetch(20).unwrap();
        e.operator(OperatorKind::Mul).unwrap();
        assert_eq!(e.index_state(), TrustedIndexState::Unknown);
        e.fetch(20).unwrap();

        assert_eq!(
            e.trace,
            [
                Emitted::Fetch { slot: 0, elided: false },
                Emitted::Fetch { slot: 1, elided: false },
                Emitted::Operator { op: OperatorKind::Add, index_after: TrustedIndexState::Known(1) },
                Emitted::Fetch { slot: 1, elided: true },
                Emitted::Operator { op: OperatorKind::Mul, index_after: TrustedIndexState::Unknown },
                Emitted::Fetch { slot: 1, elided: false },
            ]
        );
    }

    #[test]
    fn test_div_keeps_index_trusted() {
        let mut backing = vec![0u8; 4096];
        let mut e = Emitter::new(CodeBuffer::new(&mut backing, 4096).unwrap(), 2);
        e.fetch(8).unwrap();
        e.fetch(8).unwrap();
        e.operator(OperatorKind::Div).unwrap();
        assert_eq!(e.index_state(), TrustedIndexState::Known(0));
    }

    #[test]
    fn test_undersized_buffer_is_size_mismatch() {
        let ast = crate::parse("1+2+3").unwrap();
        // Room for everything except the last operator.
        let cap = 3 * FETCH_SIZE + EXEC_SIZE + EPILOGUE_SIZE;
        let mut backing = vec![0u8; 4096];
        let mut e = Emitter::new(CodeBuffer::new(&mut backing, cap).unwrap(), 3);
        assert!(matches!(e.emit_tree(&ast), Err(JitError::SizeMismatch { .. })));
    }
}
