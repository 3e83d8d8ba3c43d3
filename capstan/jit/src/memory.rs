//! Read-write memory near the host image.
//!
//! Emitted code addresses statics and host symbols with signed 32-bit
//! RIP-relative displacements, so the JIT mappings must land within ±2 GiB of
//! the process's own code. We take the address of a function in this crate as
//! the anchor and probe outward in 64 KiB steps for a fixed-address mapping
//! that succeeds.

use anyhow::{bail, Result};

const GRANULE: usize = 1 << 16;
const MAX_DISTANCE: usize = 1 << 31;

/// An owned read-write (later read-execute) mapping near the process image.
pub struct NearMemory {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for NearMemory {}

impl NearMemory {
    /// Map at least `len` bytes of zeroed read-write memory within signed-32
    /// range of this crate's code.
    pub fn allocate(len: usize) -> Result<Self> {
        let len = (len.max(1) + GRANULE - 1) & !(GRANULE - 1);
        let anchor = (Self::allocate as usize) & !(GRANULE - 1);

        let mut forward = anchor;
        let mut backward = anchor;
        while forward - backward < MAX_DISTANCE {
            forward += GRANULE;
            backward -= GRANULE;
            for candidate in [forward, backward] {
                if let Some(ptr) = sys::map_fixed(candidate, len) {
                    log::debug!("mapped {len:#x} bytes at {ptr:p} (anchor {anchor:#x})");
                    return Ok(Self { ptr, len });
                }
            }
        }
        bail!("no mappable region within ±2 GiB of the process image");
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole mapping as a writable slice. Only valid before
    /// `make_executable`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Flip the mapping to read-execute.
    pub fn make_executable(&mut self) -> Result<()> {
        sys::protect_rx(self.ptr, self.len)
    }
}

impl Drop for NearMemory {
    fn drop(&mut self) {
        sys::unmap(self.ptr, self.len);
    }
}

#[cfg(unix)]
mod sys {
    use anyhow::{anyhow, Result};

    pub fn map_fixed(addr: usize, len: usize) -> Option<*mut u8> {
        #[cfg(target_os = "linux")]
        let fixed = libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let fixed = 0;

        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | fixed,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        // Without MAP_FIXED_NOREPLACE the address is only a hint; reject
        // placements the relocations could not reach.
        if ptr as usize != addr && (ptr as usize).abs_diff(addr) > (1 << 30) {
            unsafe { libc::munmap(ptr, len) };
            return None;
        }
        Some(ptr as *mut u8)
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<()> {
        let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(anyhow!("mprotect failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }
}

#[cfg(windows)]
mod sys {
    use anyhow::{anyhow, Result};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub fn map_fixed(addr: usize, len: usize) -> Option<*mut u8> {
        let ptr = unsafe {
            VirtualAlloc(
                addr as *const core::ffi::c_void,
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<()> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtect(ptr as *const core::ffi::c_void, len, PAGE_EXECUTE_READ, &mut old)
        };
        if ok == 0 {
            return Err(anyhow!("VirtualProtect failed"));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, _len: usize) {
        unsafe {
            VirtualFree(ptr as *mut core::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_reach() {
        let mem = NearMemory::allocate(100).unwrap();
        assert!(mem.len() >= 100);
        let anchor = NearMemory::allocate as usize;
        let distance = (mem.as_ptr() as usize).abs_diff(anchor);
        assert!(distance < MAX_DISTANCE);
    }
}
