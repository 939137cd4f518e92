//! A real anonymous page for the thunk on unix hosts.

use tracing::warn;

use crate::cpu::{CpuError, CpuResult};
use crate::host::{MemoryProtection, PageProtection};
use crate::thunk::{THUNK_PAGE_SIZE, ThunkBuffer};

// Keeps the page below 4G so guest code can reach it.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LOW_MAPPING: libc::c_int = libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const LOW_MAPPING: libc::c_int = 0;

#[derive(Debug)]
pub struct MappedPage {
    ptr: *mut u8,
    len: usize,
    protection: PageProtection,
}

impl MappedPage {
    pub fn new() -> CpuResult<Self> {
        let len = THUNK_PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE | LOW_MAPPING,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CpuError::Protection(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            protection: PageProtection::ReadWrite,
        })
    }

    pub fn protection(&self) -> PageProtection {
        self.protection
    }
}

fn prot_flags(protection: PageProtection) -> libc::c_int {
    match protection {
        PageProtection::NoAccess => libc::PROT_NONE,
        PageProtection::ReadOnly => libc::PROT_READ,
        PageProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        PageProtection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
        PageProtection::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    }
}

impl ThunkBuffer for MappedPage {
    fn address(&self) -> u64 {
        self.ptr as u64
    }

    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self) -> &[u8] {
        if self.protection == PageProtection::NoAccess {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> CpuResult<()> {
        if !self.protection.is_writable() {
            return Err(CpuError::Protection(format!(
                "page at {:#x} is {}",
                self.address(),
                self.protection
            )));
        }
        if offset.checked_add(bytes.len()).is_none_or(|end| end > self.len) {
            return Err(CpuError::Protection(format!(
                "write of {} bytes at offset {offset:#x} overruns page",
                bytes.len()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }
}

impl MemoryProtection for MappedPage {
    fn protect(
        &mut self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> CpuResult<PageProtection> {
        let base = self.ptr as u64;
        if address < base || address.saturating_add(size as u64) > base + self.len as u64 {
            return Err(CpuError::Protection(format!(
                "range {address:#x}+{size:#x} is outside page at {base:#x}"
            )));
        }
        // mprotect works on whole pages; the mapping is exactly one.
        let rc = unsafe { libc::mprotect(self.ptr as *mut _, self.len, prot_flags(protection)) };
        if rc != 0 {
            return Err(CpuError::Protection(format!(
                "mprotect({}) failed: {}",
                protection,
                std::io::Error::last_os_error()
            )));
        }
        Ok(std::mem::replace(&mut self.protection, protection))
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr as *mut _, self.len) };
        if rc != 0 {
            warn!("munmap of thunk page failed: {}", std::io::Error::last_os_error());
        }
    }
}
