//! Executable memory for compiled programs.
//!
//! Regions start out writable and never executable. [`MemoryRegions::seal`]
//! consumes them and flips the code region to read+exec and the pool region
//! to read-only, producing an [`ExecutableProgram`]; there is no way back.
//! Every region unmaps itself on drop, so a failed seal still releases both.

use std::io;
use std::mem;
use std::ptr;

use libc::{MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use tracing::trace;

use super::{arch, JitError};
use crate::{EvaluationError, NumT};

#[cfg(target_os = "macos")]
const MAP_JIT: libc::c_int = libc::MAP_JIT;
#[cfg(not(target_os = "macos"))]
const MAP_JIT: libc::c_int = 0;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
extern "C" {
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: usize);
}

#[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

type JitFunc = unsafe extern "C" fn(pool: *const NumT, status: *mut NumT) -> NumT;

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Rounds `n` up to a whole number of pages, at least one page.
pub fn align_to_page(n: usize) -> Option<usize> {
    let page = page_size();
    n.max(1).checked_add(page - 1).map(|n| n & !(page - 1))
}

struct Region {
    ptr: *mut u8,
    len: usize,
}

impl Region {
    fn map(len: usize, flags: libc::c_int) -> Result<Region, JitError> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | flags,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(JitError::AllocationFailed {
                size: len,
                source: io::Error::last_os_error(),
            });
        }
        trace!(addr = ?ptr, len, "mapped region");
        Ok(Region { ptr: ptr as *mut u8, len })
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), JitError> {
        let rc = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.len, prot) };
        if rc != 0 {
            return Err(JitError::PermissionChangeFailed {
                source: io::Error::last_os_error(),
            });
        }
        trace!(addr = ?self.ptr, prot, "changed region protection");
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        trace!(addr = ?self.ptr, len = self.len, "released region");
    }
}

/// Code and pool regions while they are still being filled.
pub struct MemoryRegions {
    code: Region,
    pool: Region,
}

/// Maps both regions writable. The code region is pre-filled with the
/// target's no-op so any byte the emitter never reaches is inert.
pub fn allocate(code_size: usize, pool_size: usize) -> Result<MemoryRegions, JitError> {
    let code = Region::map(code_size, MAP_JIT)?;
    let pool = Region::map(pool_size, 0)?;

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        pthread_jit_write_protect_np(0);
    }

    let mut regions = MemoryRegions { code, pool };
    for chunk in regions.code_mut().chunks_exact_mut(arch::FILLER.len()) {
        chunk.copy_from_slice(arch::FILLER);
    }
    Ok(regions)
}

impl MemoryRegions {
    pub fn code_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.code.ptr, self.code.len) }
    }

    pub fn write_pool(&mut self, values: &[NumT]) -> Result<(), JitError> {
        let bytes = mem::size_of_val(values);
        if bytes > self.pool.len {
            return Err(JitError::SizeMismatch {
                needed: bytes,
                capacity: self.pool.len,
            });
        }
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.pool.ptr as *mut NumT, values.len());
        }
        Ok(())
    }

    /// Makes the pool read-only and the code executable (and no longer
    /// writable). On error both regions are dropped, which unmaps them.
    pub fn seal(self) -> Result<ExecutableProgram, JitError> {
        self.pool.protect(PROT_READ)?;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        unsafe {
            pthread_jit_write_protect_np(1);
        }

        self.code.protect(PROT_READ | PROT_EXEC)?;
        flush_icache(&self.code);

        Ok(ExecutableProgram {
            code: self.code,
            pool: self.pool,
        })
    }

    /// Unmaps both regions. Dropping has the same effect.
    pub fn release(self) {}
}

#[allow(unused_variables)]
fn flush_icache(code: &Region) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        sys_icache_invalidate(code.ptr as *mut libc::c_void, code.len);
    }
    #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
    unsafe {
        __clear_cache(code.ptr as *mut libc::c_char, code.ptr.add(code.len) as *mut libc::c_char);
    }
}

/// Sealed program: executable code plus its read-only constant pool.
pub struct ExecutableProgram {
    code: Region,
    pool: Region,
}

impl ExecutableProgram {
    pub fn pool_base(&self) -> *const NumT {
        self.pool.ptr as *const NumT
    }

    /// Calls the generated code. It is a leaf function: it only reads the
    /// pool and writes the status word.
    pub fn invoke(&self) -> Result<NumT, EvaluationError> {
        let func: JitFunc = unsafe { mem::transmute(self.code.ptr) };
        let mut status: NumT = 0;
        let value = unsafe { func(self.pool_base(), &mut status) };
        if status != 0 {
            return Err(EvaluationError::DivisionByZero);
        }
        Ok(value)
    }

    /// Unmaps both regions. Dropping has the same effect.
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_page() {
        let page = page_size();
        assert_eq!(align_to_page(0), Some(page));
        assert_eq!(align_to_page(1), Some(page));
        assert_eq!(align_to_page(page), Some(page));
        assert_eq!(align_to_page(page + 1), Some(2 * page));
        assert_eq!(align_to_page(usize::MAX), None);
    }

    #[test]
    fn test_allocate_fills_code_with_filler() {
        let page = page_size();
        let mut regions = allocate(page, page).unwrap();
        let code = regions.code_mut();
        assert_eq!(code.len(), page);
        assert!(code.chunks_exact(arch::FILLER.len()).all(|c| c == arch::FILLER));
        regions.release();
    }

    #[test]
    fn test_write_pool_bounds() {
        let page = page_size();
        let mut regions = allocate(page, page).unwrap();
        let too_many = vec![0; page / mem::size_of::<NumT>() + 1];
        assert!(matches!(
            regions.write_pool(&too_many),
            Err(JitError::SizeMismatch { .. })
        ));
        regions.write_pool(&[1, 2, 3]).unwrap();
    }

    #[test]
    fn test_sealed_pool_is_readable() {
        let page = page_size();
        let mut regions = allocate(page, page).unwrap();
        regions.write_pool(&[11, 22]).unwrap();
        let program = regions.seal().unwrap();
        let pool = unsafe { std::slice::from_raw_parts(program.pool_base(), 2) };
        assert_eq!(pool, &[11, 22]);
        program.release();
    }
}
