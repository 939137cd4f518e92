//! The real host: a 64-bit Windows process running 32-bit guest threads.

use std::arch::asm;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::sync::OnceLock;

use tracing::{error, trace};
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, VirtualProtect,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentThread};

use crate::arch;
use crate::context::{CpuReserved, GuestContext, NativeContext};
use crate::cpu::{CpuError, CpuResult, NtStatus};
use crate::host::{
    ContextCapture, Host, MemoryProtection, PageProtection, ReservedSlots, SystemService,
    TLS_SLOT_CPU_RESERVED, TLS_SLOT_NATIVE_STACK, ThreadContextService, ThreadHandle,
    tls_slot_offset,
};
use crate::thunk::{THUNK_PAGE_SIZE, ThunkBuffer};

const THREAD_WOW64_CONTEXT: u32 = 29;

#[link(name = "ntdll")]
unsafe extern "system" {
    fn NtQueryInformationThread(
        thread: HANDLE,
        class: u32,
        info: *mut c_void,
        length: u32,
        returned: *mut u32,
    ) -> i32;
    fn NtSetInformationThread(thread: HANDLE, class: u32, info: *const c_void, length: u32)
    -> i32;
    fn RtlCaptureContext(context: *mut NativeContext);
}

fn teb() -> *mut u8 {
    let teb: *mut u8;
    unsafe {
        asm!("mov {}, gs:[0x30]", out(reg) teb, options(nostack, readonly, preserves_flags));
    }
    teb
}

fn tls_slot(index: usize) -> *mut u64 {
    unsafe { teb().add(tls_slot_offset(index)) as *mut u64 }
}

fn check(status: i32) -> CpuResult<()> {
    let status = NtStatus(status as u32);
    if status.is_success() {
        Ok(())
    } else {
        Err(CpuError::Host(status))
    }
}

fn to_flags(protection: PageProtection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        PageProtection::NoAccess => PAGE_NOACCESS,
        PageProtection::ReadOnly => PAGE_READONLY,
        PageProtection::ReadWrite => PAGE_READWRITE,
        PageProtection::ExecuteRead => PAGE_EXECUTE_READ,
        PageProtection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
    }
}

fn from_flags(flags: PAGE_PROTECTION_FLAGS) -> PageProtection {
    match flags & 0xff {
        PAGE_NOACCESS => PageProtection::NoAccess,
        PAGE_READONLY => PageProtection::ReadOnly,
        PAGE_EXECUTE_READ => PageProtection::ExecuteRead,
        PAGE_EXECUTE_READWRITE => PageProtection::ExecuteReadWrite,
        _ => PageProtection::ReadWrite,
    }
}

#[repr(C, align(4096))]
struct CodePage(UnsafeCell<[u8; THUNK_PAGE_SIZE]>);

// Written once by the initializing thread before the page is sealed.
unsafe impl Sync for CodePage {}

static CODE_PAGE: CodePage = CodePage(UnsafeCell::new([0; THUNK_PAGE_SIZE]));

/// The image's own page that holds the thunk.
#[derive(Debug)]
pub struct StaticCodePage {
    protection: PageProtection,
}

impl StaticCodePage {
    fn ptr(&self) -> *mut u8 {
        CODE_PAGE.0.get() as *mut u8
    }
}

impl ThunkBuffer for StaticCodePage {
    fn address(&self) -> u64 {
        self.ptr() as u64
    }

    fn len(&self) -> usize {
        THUNK_PAGE_SIZE
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr(), THUNK_PAGE_SIZE) }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> CpuResult<()> {
        if !self.protection.is_writable() {
            return Err(CpuError::Protection(format!(
                "code page at {:#x} is {}",
                self.address(),
                self.protection
            )));
        }
        if offset
            .checked_add(bytes.len())
            .is_none_or(|end| end > THUNK_PAGE_SIZE)
        {
            return Err(CpuError::Protection(format!(
                "write of {} bytes at offset {offset:#x} overruns code page",
                bytes.len()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr().add(offset), bytes.len());
        }
        Ok(())
    }
}

impl MemoryProtection for StaticCodePage {
    fn protect(
        &mut self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> CpuResult<PageProtection> {
        let mut old = 0;
        let ok = unsafe {
            VirtualProtect(address as *const c_void, size, to_flags(protection), &mut old)
        };
        if ok == 0 {
            return Err(CpuError::Protection(format!(
                "VirtualProtect({protection}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if protection.is_executable() {
            let ok = unsafe {
                FlushInstructionCache(GetCurrentProcess(), address as *const c_void, size)
            };
            if ok == 0 {
                return Err(CpuError::Protection(format!(
                    "FlushInstructionCache failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        self.protection = protection;
        Ok(from_flags(old))
    }
}

#[derive(Debug)]
pub struct NtHost {
    page: StaticCodePage,
}

impl NtHost {
    /// There is one code page per image, so a process holds at most one `NtHost`.
    pub fn new() -> Self {
        Self {
            page: StaticCodePage {
                protection: PageProtection::ReadWrite,
            },
        }
    }
}

impl ThreadContextService for NtHost {
    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle(unsafe { GetCurrentThread() } as isize)
    }

    fn get_context(&self, thread: ThreadHandle, context: &mut GuestContext) -> CpuResult<()> {
        check(unsafe {
            NtQueryInformationThread(
                thread.0 as HANDLE,
                THREAD_WOW64_CONTEXT,
                context as *mut GuestContext as *mut c_void,
                size_of::<GuestContext>() as u32,
                std::ptr::null_mut(),
            )
        })
    }

    fn set_context(&mut self, thread: ThreadHandle, context: &GuestContext) -> CpuResult<()> {
        check(unsafe {
            NtSetInformationThread(
                thread.0 as HANDLE,
                THREAD_WOW64_CONTEXT,
                context as *const GuestContext as *const c_void,
                size_of::<GuestContext>() as u32,
            )
        })
    }
}

impl ContextCapture for NtHost {
    fn capture(&self, context: &mut NativeContext) {
        unsafe { RtlCaptureContext(context) }
    }
}

impl ReservedSlots for NtHost {
    fn native_stack(&self) -> u64 {
        unsafe { tls_slot(TLS_SLOT_NATIVE_STACK).read() }
    }

    fn set_native_stack(&mut self, value: u64) {
        unsafe { tls_slot(TLS_SLOT_NATIVE_STACK).write(value) }
    }

    fn cpu_reserved(&mut self) -> &mut CpuReserved {
        // The loader allocates the area before any cpu entry point runs on the thread.
        unsafe { &mut *(tls_slot(TLS_SLOT_CPU_RESERVED).read() as *mut CpuReserved) }
    }
}

impl Host for NtHost {
    type Page = StaticCodePage;

    fn thunk_page(&mut self) -> &mut StaticCodePage {
        &mut self.page
    }

    fn resume_routine(&self) -> u64 {
        arch::syscall_entry()
    }
}

type ServiceFn = unsafe extern "system" fn(number: u32, args: *mut u32) -> i32;

fn resolve_service() -> Option<ServiceFn> {
    static SERVICE: OnceLock<Option<ServiceFn>> = OnceLock::new();
    *SERVICE.get_or_init(|| {
        let module = unsafe { GetModuleHandleA(b"wow64.dll\0".as_ptr()) };
        if module.is_null() {
            error!("wow64.dll is not loaded, system calls will fail");
            return None;
        }
        let proc = unsafe { GetProcAddress(module, b"Wow64SystemServiceEx\0".as_ptr()) };
        match proc {
            Some(proc) => Some(unsafe { std::mem::transmute::<_, ServiceFn>(proc) }),
            None => {
                error!("Wow64SystemServiceEx not exported by wow64.dll");
                None
            }
        }
    })
}

/// Forwards guest system calls to the loader's dispatcher.
#[derive(Clone, Copy, Debug, Default)]
pub struct NtSystemService;

impl SystemService for NtSystemService {
    fn dispatch(&mut self, number: u32, params: u32, _reserved: &mut CpuReserved) -> u32 {
        trace!("guest syscall {number:#x} params={params:#x}");
        match resolve_service() {
            Some(service) => unsafe { service(number, params as usize as *mut u32) as u32 },
            None => NtStatus::ENTRYPOINT_NOT_FOUND.0,
        }
    }
}
