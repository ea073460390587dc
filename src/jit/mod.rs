//! Native code generation for parsed expressions.
//!
//! Pipeline for one expression: size the tree, map a code region and a pool
//! region, emit a stack-machine program in one post-order pass, seal both
//! regions (W^X), then invoke. Each [`CompiledProgram`] owns its regions and
//! unmaps them when dropped, on success and on every error path alike.

use std::io;

use tracing::debug;

use crate::pool::SealedPool;
use crate::{analyze, Ast, EvaluationError, NumT, TreeShape};

mod emit;
mod memory;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as arch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("the JIT backend only targets x86_64 and aarch64");

pub use arch::{EPILOGUE_SIZE, EXEC_SIZE, FETCH_SIZE, STACK_CELL};
pub use emit::{CodeBuffer, Emission, Emitted, Emitter, TrustedIndexState};
pub use memory::{align_to_page, allocate, page_size, ExecutableProgram, MemoryRegions};

/// Deepest operand stack the generated code may build on the caller's
/// native stack. Deeper trees are rejected at sizing time; the interpreter
/// still evaluates them.
pub const MAX_OPERAND_DEPTH: usize = 16_384;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("failed to allocate {size} bytes of jit memory: {source}")]
    AllocationFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to change jit memory protection: {source}")]
    PermissionChangeFailed {
        #[source]
        source: io::Error,
    },
    #[error("code size mismatch: {needed} bytes needed, {capacity} available")]
    SizeMismatch { needed: usize, capacity: usize },
}

/// Buffer sizes predicted from a tree's shape, before anything is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSize {
    /// Exact number of code bytes the emitter will produce, epilogue included.
    pub code_len: usize,
    pub code_region: usize,
    pub pool_region: usize,
}

impl CodeSize {
    pub fn for_shape(shape: TreeShape) -> Result<CodeSize, JitError> {
        let too_large = |what: &str| JitError::AllocationFailed {
            size: usize::MAX,
            source: io::Error::new(io::ErrorKind::OutOfMemory, format!("{what} size overflows")),
        };

        // Slots are encoded as 32-bit immediates.
        if shape.leaf_count > u32::MAX as usize {
            return Err(too_large("constant pool"));
        }
        if shape.max_stack_depth > MAX_OPERAND_DEPTH {
            return Err(JitError::AllocationFailed {
                size: shape.max_stack_depth.saturating_mul(STACK_CELL),
                source: io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!(
                        "operand stack depth {} exceeds {MAX_OPERAND_DEPTH}",
                        shape.max_stack_depth
                    ),
                ),
            });
        }

        let code_len = shape
            .leaf_count
            .checked_mul(FETCH_SIZE)
            .and_then(|n| n.checked_add(shape.operator_count.checked_mul(EXEC_SIZE)?))
            .and_then(|n| n.checked_add(EPILOGUE_SIZE))
            .ok_or_else(|| too_large("code"))?;
        let pool_len = shape
            .leaf_count
            .checked_mul(std::mem::size_of::<NumT>())
            .ok_or_else(|| too_large("constant pool"))?;

        Ok(CodeSize {
            code_len,
            code_region: align_to_page(code_len).ok_or_else(|| too_large("code"))?,
            pool_region: align_to_page(pool_len).ok_or_else(|| too_large("constant pool"))?,
        })
    }
}

/// A sealed, callable program plus what was learned while emitting it.
pub struct CompiledProgram {
    program: ExecutableProgram,
    pool: SealedPool,
    trace: Vec<Emitted>,
    size: CodeSize,
}

impl CompiledProgram {
    /// Runs the generated code. Can be called any number of times.
    pub fn run(&self) -> Result<NumT, EvaluationError> {
        self.program.invoke()
    }

    pub fn pool(&self) -> &SealedPool {
        &self.pool
    }

    /// Fetches and operators in emission order.
    pub fn trace(&self) -> &[Emitted] {
        &self.trace
    }

    pub fn size(&self) -> CodeSize {
        self.size
    }

    pub fn elided_reloads(&self) -> usize {
        self.trace
            .iter()
            .filter(|e| matches!(e, Emitted::Fetch { elided: true, .. }))
            .count()
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("size", &self.size)
            .field("pool_len", &self.pool.len())
            .field("elided_reloads", &self.elided_reloads())
            .finish()
    }
}

pub fn compile(ast: &Ast) -> Result<CompiledProgram, JitError> {
    let shape = analyze(ast);
    let size = CodeSize::for_shape(shape)?;
    let mut regions = allocate(size.code_region, size.pool_region)?;

    let emission = {
        let buf = CodeBuffer::new(regions.code_mut(), size.code_len)?;
        let mut emitter = Emitter::new(buf, shape.leaf_count);
        emitter.emit_tree(ast)?;
        emitter.finish()?
    };
    if emission.code_len != size.code_len {
        return Err(JitError::SizeMismatch {
            needed: emission.code_len,
            capacity: size.code_len,
        });
    }

    regions.write_pool(emission.pool.values())?;
    let program = regions.seal()?;

    let compiled = CompiledProgram {
        program,
        pool: emission.pool,
        trace: emission.trace,
        size,
    };
    debug!(
        leaves = shape.leaf_count,
        operators = shape.operator_count,
        stack_depth = shape.max_stack_depth,
        code_len = size.code_len,
        pool_slots = compiled.pool.len(),
        elided = compiled.elided_reloads(),
        "compiled expression"
    );
    Ok(compiled)
}
