use tracing::{error, info, warn};

use crate::config::CpuConfig;
use crate::context::{CapturedSelectors, ContextFlags, GuestContext, NativeContext};
use crate::convert::copy_context_64to32;
use crate::handshake::{ExecutionMode, GuestRegisters, Handshake, ReturnFrame};
use crate::host::{GuestMemory, Host, SystemService, ThreadHandle};
use crate::thunk::{ThunkBuffer, TransitionThunk, decode_thunk, thunk_is_self_consistent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const INTERNAL_ERROR: Self = Self(0xC000_00E5);
    pub const ENTRYPOINT_NOT_FOUND: Self = Self(0xC000_0139);
    pub const INVALID_ADDRESS: Self = Self(0xC000_0141);
    pub const INVALID_DEVICE_STATE: Self = Self(0xC000_0184);

    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    AddressRange { address: u64 },
    NotSupported,
    Host(NtStatus),
    Protection(String),
    AlreadyInitialized,
    NotInitialized,
    InvalidTransition {
        from: ExecutionMode,
        to: ExecutionMode,
    },
    Config(String),
    CorruptThunk,
}

impl std::fmt::Display for CpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuError::AddressRange { address } => {
                write!(f, "address {address:#x} is not reachable from 32-bit code")
            }
            CpuError::NotSupported => write!(f, "operation not supported"),
            CpuError::Host(status) => write!(f, "host call failed with status {status}"),
            CpuError::Protection(message) => write!(f, "page protection error: {message}"),
            CpuError::AlreadyInitialized => write!(f, "cpu backend already initialized"),
            CpuError::NotInitialized => write!(f, "cpu backend not initialized"),
            CpuError::InvalidTransition { from, to } => {
                write!(f, "invalid mode transition {from} -> {to}")
            }
            CpuError::Config(message) => write!(f, "config error: {message}"),
            CpuError::CorruptThunk => write!(f, "transition thunk does not match its build"),
        }
    }
}

impl std::error::Error for CpuError {}

impl CpuError {
    /// Status reported across the exported surface.
    pub fn status(&self) -> NtStatus {
        match self {
            CpuError::AddressRange { .. } => NtStatus::INVALID_ADDRESS,
            CpuError::NotSupported => NtStatus::NOT_SUPPORTED,
            CpuError::Host(status) => *status,
            CpuError::Protection(_) => NtStatus::ACCESS_DENIED,
            CpuError::AlreadyInitialized
            | CpuError::NotInitialized
            | CpuError::InvalidTransition { .. } => NtStatus::INVALID_DEVICE_STATE,
            CpuError::Config(_) => NtStatus::INVALID_PARAMETER,
            CpuError::CorruptThunk => NtStatus::INTERNAL_ERROR,
        }
    }
}

pub type CpuResult<T> = Result<T, CpuError>;

pub fn status_of(result: &CpuResult<()>) -> NtStatus {
    match result {
        Ok(()) => NtStatus::SUCCESS,
        Err(err) => err.status(),
    }
}

/// Process-wide state of the 32-bit CPU backend.
pub struct Wow64Cpu<H: Host> {
    host: H,
    config: CpuConfig,
    selectors: Option<CapturedSelectors>,
    thunk: Option<TransitionThunk>,
}

impl<H: Host> Wow64Cpu<H> {
    pub fn new(host: H) -> Self {
        Self::with_config(host, CpuConfig::default())
    }

    pub fn with_config(host: H, config: CpuConfig) -> Self {
        Self {
            host,
            config,
            selectors: None,
            thunk: None,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn selectors(&self) -> Option<CapturedSelectors> {
        self.selectors
    }

    pub fn thunk(&self) -> Option<&TransitionThunk> {
        self.thunk.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.thunk.is_some()
    }

    /// Captures the native selectors and publishes the transition thunk.
    pub fn initialize(&mut self) -> CpuResult<()> {
        if self.thunk.is_some() {
            return Err(CpuError::AlreadyInitialized);
        }
        let resume = self.host.resume_routine();
        if resume >> 32 != 0 {
            error!("cpu backend loaded above 4G (syscall routine at {resume:#x}), disabling");
            return Err(CpuError::AddressRange { address: resume });
        }

        let mut native = NativeContext::default();
        self.host.capture(&mut native);
        let selectors = CapturedSelectors::from_native(&native);
        let thunk = TransitionThunk::build(self.host.thunk_page(), selectors.cs64, resume)?;
        info!(
            "cpu backend ready: bop code at {:#x}, cs64={:#x} ds64={:#x} fs32={:#x}",
            thunk.entry(),
            selectors.cs64,
            selectors.ds64,
            selectors.fs32
        );

        self.selectors = Some(selectors);
        self.thunk = Some(thunk);
        Ok(())
    }

    pub fn process_init(&mut self) -> CpuResult<()> {
        self.initialize()
    }

    /// Entry point guest code calls to reach native mode.
    pub fn bop_code(&self) -> Option<u64> {
        self.thunk.map(|thunk| u64::from(thunk.entry()))
    }

    pub fn get_context(&self, thread: ThreadHandle, context: &mut GuestContext) -> CpuResult<()> {
        self.host.get_context(thread, context)
    }

    pub fn set_context(&mut self, thread: ThreadHandle, context: &GuestContext) -> CpuResult<()> {
        self.host.set_context(thread, context)
    }

    /// Rewrites a native frame interrupted in guest mode so that it re-enters
    /// the syscall routine and reloads the whole guest context from there.
    pub fn reset_to_consistent_state(&mut self, context: &mut NativeContext) -> CpuResult<()> {
        let selectors = self.selectors.ok_or(CpuError::NotInitialized)?;

        let mut guest = GuestContext::default();
        copy_context_64to32(&mut guest, ContextFlags::ALL, context, &selectors);
        guest.eflags &= !self.config.reset_eflags_clear;

        let thread = self.host.current_thread();
        if let Err(err) = self.host.set_context(thread, &guest) {
            warn!("reset: storing guest context for eip={:#x} failed: {err}", guest.eip);
        }
        self.host.cpu_reserved().request_reset();

        context.rip = self.host.resume_routine();
        context.seg_cs = selectors.cs64;
        context.rsp = self.host.native_stack();
        Ok(())
    }

    pub fn turbo_thunk_control(&self, enable: bool) -> CpuResult<()> {
        if enable {
            return Err(CpuError::NotSupported);
        }
        Ok(())
    }

    /// Drops into guest mode from the native side, as the thread start does.
    ///
    /// Takes the interrupt-return path when a reset is pending and the far
    /// return otherwise; no system call is made.
    pub fn simulate<V>(&mut self, service: &mut V) -> CpuResult<ReturnFrame>
    where
        V: SystemService + ?Sized,
    {
        if self.thunk.is_none() {
            return Err(CpuError::NotInitialized);
        }
        let mut handshake =
            Handshake::at_return_label(self.host.native_stack(), self.config.log_transitions);
        handshake.service(&mut self.host, service)?;
        handshake.finish(&mut self.host)
    }

    /// Follows a guest `call` into the bop code through to the return frame.
    ///
    /// `regs.esp` points at the return address pushed by that call.
    pub fn enter_from_guest<M, V>(
        &mut self,
        regs: &GuestRegisters,
        memory: &M,
        service: &mut V,
    ) -> CpuResult<ReturnFrame>
    where
        M: GuestMemory + ?Sized,
        V: SystemService + ?Sized,
    {
        let thunk = self.thunk.ok_or(CpuError::NotInitialized)?;
        let resume = self.host.resume_routine();
        let targets = decode_thunk(self.host.thunk_page().bytes())
            .filter(|targets| thunk_is_self_consistent(targets, thunk.entry()))
            .ok_or(CpuError::CorruptThunk)?;
        if targets.native_cs != thunk.native_cs() || targets.resume != resume {
            return Err(CpuError::CorruptThunk);
        }

        let mut handshake = Handshake::new(self.config.log_transitions);
        handshake.run(&mut self.host, regs, memory, service)
    }
}
