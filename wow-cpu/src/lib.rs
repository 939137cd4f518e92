pub mod arch;
pub mod config;
pub mod context;
pub mod convert;
pub mod cpu;
pub mod fpu;
pub mod handshake;
pub mod host;
#[cfg(feature = "cli")]
pub mod logging;
pub mod thunk;

pub use config::CpuConfig;
pub use context::{
    CapturedSelectors, ContextFlags, CpuReserved, ExtendedFpuState, GuestContext, LegacyFpuState,
    M128A, NativeContext,
};
pub use convert::copy_context_64to32;
pub use cpu::{CpuError, CpuResult, NtStatus, Wow64Cpu, status_of};
pub use fpu::{FpuTag, fpux_to_fpu};
pub use handshake::{ExecutionMode, GuestRegisters, Handshake, ModeTransition, ReturnFrame};
pub use host::{
    ContextCapture, GuestMemory, Host, MemoryProtection, PageProtection, ReservedSlots,
    SystemService, ThreadContextService, ThreadHandle,
};
pub use thunk::{ThunkBuffer, ThunkTargets, TransitionThunk, decode_thunk};
