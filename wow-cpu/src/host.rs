//! Services consumed from the surrounding host: thread context storage,
//! page protection, context capture, the per-thread reserved slots and the
//! system-call dispatcher.

use crate::context::{CpuReserved, GuestContext, NativeContext};
use crate::cpu::CpuResult;
use crate::thunk::ThunkBuffer;

pub mod sim;
#[cfg(unix)]
pub mod unix;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

/// Indices into the thread's TLS slot array.
pub const TLS_SLOT_CPU_RESERVED: usize = 1;
pub const TLS_SLOT_NATIVE_STACK: usize = 2;
pub const TLS_SLOT_SAVED_R13: usize = 4;
pub const TLS_SLOT_SAVED_R14: usize = 6;
/// Offset of the TLS slot array in the native TEB.
pub const TEB_TLS_SLOTS_OFFSET: usize = 0x1480;

pub const fn tls_slot_offset(index: usize) -> usize {
    TEB_TLS_SLOTS_OFFSET + index * 8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub isize);

impl ThreadHandle {
    /// Pseudo-handle for the calling thread.
    pub const CURRENT: Self = Self(-2);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageProtection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ExecuteRead,
    ExecuteReadWrite,
}

impl PageProtection {
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            PageProtection::ReadWrite | PageProtection::ExecuteReadWrite
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            PageProtection::ExecuteRead | PageProtection::ExecuteReadWrite
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PageProtection::NoAccess => "no-access",
            PageProtection::ReadOnly => "read-only",
            PageProtection::ReadWrite => "read-write",
            PageProtection::ExecuteRead => "execute-read",
            PageProtection::ExecuteReadWrite => "execute-read-write",
        }
    }
}

impl std::fmt::Display for PageProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait ThreadContextService {
    fn current_thread(&self) -> ThreadHandle;
    fn get_context(&self, thread: ThreadHandle, context: &mut GuestContext) -> CpuResult<()>;
    fn set_context(&mut self, thread: ThreadHandle, context: &GuestContext) -> CpuResult<()>;
}

pub trait MemoryProtection {
    /// Changes the protection of `size` bytes at `address`, returning the previous one.
    fn protect(
        &mut self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> CpuResult<PageProtection>;
}

pub trait ContextCapture {
    fn capture(&self, context: &mut NativeContext);
}

/// The owning thread's reserved slots. Only that thread reads or writes them.
pub trait ReservedSlots {
    fn native_stack(&self) -> u64;
    fn set_native_stack(&mut self, value: u64);
    fn cpu_reserved(&mut self) -> &mut CpuReserved;
}

/// The native system-call dispatcher invoked at the mode boundary.
pub trait SystemService {
    /// `params` is the guest address of the packed argument block. The service
    /// may rewrite the thread's guest context and request a reset, as a
    /// context-setting call on the current thread does.
    fn dispatch(&mut self, number: u32, params: u32, reserved: &mut CpuReserved) -> u32;
}

pub trait GuestMemory {
    fn read_u32(&self, address: u32) -> u32;
}

pub trait Host: ThreadContextService + ContextCapture + ReservedSlots {
    type Page: ThunkBuffer + MemoryProtection;

    fn thunk_page(&mut self) -> &mut Self::Page;
    /// Address of the native routine the thunk jumps to.
    fn resume_routine(&self) -> u64;
}
