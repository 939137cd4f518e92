//! In-memory host used by the simulator binary and the test suites.

use std::collections::HashMap;

use crate::context::{CapturedSelectors, CpuReserved, GuestContext, NativeContext};
use crate::cpu::{CpuError, CpuResult, NtStatus};
use crate::host::{
    ContextCapture, GuestMemory, Host, MemoryProtection, PageProtection, ReservedSlots,
    SystemService, ThreadContextService, ThreadHandle,
};
use crate::thunk::{THUNK_PAGE_SIZE, ThunkBuffer};

pub const DEFAULT_PAGE_ADDRESS: u64 = 0x6bc0_0000;
pub const DEFAULT_RESUME_ROUTINE: u64 = 0x6bc1_2340;
pub const DEFAULT_NATIVE_STACK: u64 = 0x0000_00a0_0014_fd80;
pub const DEFAULT_SELECTORS: CapturedSelectors = CapturedSelectors {
    cs64: 0x33,
    ds64: 0x2b,
    fs32: 0x53,
};
/// Guest code selector used for freshly created simulated threads.
pub const GUEST_CS: u16 = 0x23;

/// One page of memory with tracked protection.
#[derive(Debug, Clone)]
pub struct SimPage {
    address: u64,
    bytes: Vec<u8>,
    protection: PageProtection,
    protect_calls: Vec<(u64, usize, PageProtection)>,
    writes: usize,
}

impl SimPage {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            bytes: vec![0; THUNK_PAGE_SIZE],
            protection: PageProtection::ReadWrite,
            protect_calls: Vec::new(),
            writes: 0,
        }
    }

    pub fn protection(&self) -> PageProtection {
        self.protection
    }

    pub fn protect_calls(&self) -> &[(u64, usize, PageProtection)] {
        &self.protect_calls
    }

    /// Neither written nor re-protected since creation.
    pub fn is_untouched(&self) -> bool {
        self.writes == 0 && self.protect_calls.is_empty()
    }
}

impl ThunkBuffer for SimPage {
    fn address(&self) -> u64 {
        self.address
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> CpuResult<()> {
        if !self.protection.is_writable() {
            return Err(CpuError::Protection(format!(
                "page at {:#x} is {}",
                self.address, self.protection
            )));
        }
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                CpuError::Protection(format!(
                    "write of {} bytes at offset {offset:#x} overruns page at {:#x}",
                    bytes.len(),
                    self.address
                ))
            })?;
        self.bytes[offset..end].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

impl MemoryProtection for SimPage {
    fn protect(
        &mut self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> CpuResult<PageProtection> {
        let page_end = self.address + self.bytes.len() as u64;
        let in_range = address >= self.address
            && address
                .checked_add(size as u64)
                .is_some_and(|end| end <= page_end);
        if !in_range {
            return Err(CpuError::Protection(format!(
                "range {address:#x}+{size:#x} is outside page at {:#x}",
                self.address
            )));
        }
        self.protect_calls.push((address, size, protection));
        Ok(std::mem::replace(&mut self.protection, protection))
    }
}

/// Simulated process with one current thread and any number of others.
#[derive(Debug)]
pub struct SimHost {
    page: SimPage,
    resume_routine: u64,
    selectors: CapturedSelectors,
    native_stack: u64,
    reserved: CpuReserved,
    threads: HashMap<ThreadHandle, GuestContext>,
    next_thread: isize,
    failure: Option<NtStatus>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    pub fn new() -> Self {
        let mut context = GuestContext::default();
        context.seg_cs = u32::from(GUEST_CS);
        context.seg_ss = u32::from(DEFAULT_SELECTORS.ds64);
        context.seg_ds = u32::from(DEFAULT_SELECTORS.ds64);
        context.seg_es = u32::from(DEFAULT_SELECTORS.ds64);
        context.seg_gs = u32::from(DEFAULT_SELECTORS.ds64);
        context.seg_fs = u32::from(DEFAULT_SELECTORS.fs32);
        context.eflags = 0x202;
        Self {
            page: SimPage::new(DEFAULT_PAGE_ADDRESS),
            resume_routine: DEFAULT_RESUME_ROUTINE,
            selectors: DEFAULT_SELECTORS,
            native_stack: DEFAULT_NATIVE_STACK,
            reserved: CpuReserved::new(context),
            threads: HashMap::new(),
            next_thread: 0x100,
            failure: None,
        }
    }

    pub fn with_resume_routine(mut self, address: u64) -> Self {
        self.resume_routine = address;
        self
    }

    pub fn with_selectors(mut self, selectors: CapturedSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_page_address(mut self, address: u64) -> Self {
        self.page = SimPage::new(address);
        self
    }

    pub fn with_native_stack(mut self, value: u64) -> Self {
        self.native_stack = value;
        self
    }

    /// Adds a non-current thread and returns its handle.
    pub fn spawn_thread(&mut self, context: GuestContext) -> ThreadHandle {
        let handle = ThreadHandle(self.next_thread);
        self.next_thread += 4;
        self.threads.insert(handle, context);
        handle
    }

    /// Makes every following context get/set fail with `status`.
    pub fn fail_context_calls(&mut self, status: NtStatus) {
        self.failure = Some(status);
    }

    pub fn clear_failures(&mut self) {
        self.failure = None;
    }

    pub fn page(&self) -> &SimPage {
        &self.page
    }

    pub fn reserved(&self) -> &CpuReserved {
        &self.reserved
    }

    /// Guest context of the current thread.
    pub fn guest_context(&self) -> &GuestContext {
        &self.reserved.context
    }

    pub fn guest_context_mut(&mut self) -> &mut GuestContext {
        &mut self.reserved.context
    }

    fn check_failure(&self) -> CpuResult<()> {
        match self.failure {
            Some(status) => Err(CpuError::Host(status)),
            None => Ok(()),
        }
    }
}

impl ThreadContextService for SimHost {
    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle::CURRENT
    }

    fn get_context(&self, thread: ThreadHandle, context: &mut GuestContext) -> CpuResult<()> {
        self.check_failure()?;
        if thread == ThreadHandle::CURRENT {
            *context = self.reserved.context;
            return Ok(());
        }
        let stored = self
            .threads
            .get(&thread)
            .ok_or(CpuError::Host(NtStatus::INVALID_HANDLE))?;
        *context = *stored;
        Ok(())
    }

    fn set_context(&mut self, thread: ThreadHandle, context: &GuestContext) -> CpuResult<()> {
        self.check_failure()?;
        if thread == ThreadHandle::CURRENT {
            // The running thread must pick the new state up on its next return.
            self.reserved.context = *context;
            self.reserved.request_reset();
            return Ok(());
        }
        let stored = self
            .threads
            .get_mut(&thread)
            .ok_or(CpuError::Host(NtStatus::INVALID_HANDLE))?;
        *stored = *context;
        Ok(())
    }
}

impl ContextCapture for SimHost {
    fn capture(&self, context: &mut NativeContext) {
        context.seg_cs = self.selectors.cs64;
        context.seg_ds = self.selectors.ds64;
        context.seg_es = self.selectors.ds64;
        context.seg_ss = self.selectors.ds64;
        context.seg_gs = self.selectors.ds64;
        context.seg_fs = self.selectors.fs32;
        context.rsp = self.native_stack;
        context.rip = self.resume_routine;
    }
}

impl ReservedSlots for SimHost {
    fn native_stack(&self) -> u64 {
        self.native_stack
    }

    fn set_native_stack(&mut self, value: u64) {
        self.native_stack = value;
    }

    fn cpu_reserved(&mut self) -> &mut CpuReserved {
        &mut self.reserved
    }
}

impl Host for SimHost {
    type Page = SimPage;

    fn thunk_page(&mut self) -> &mut SimPage {
        &mut self.page
    }

    fn resume_routine(&self) -> u64 {
        self.resume_routine
    }
}

/// Sparse guest address space holding dwords.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    words: HashMap<u32, u32>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        self.words.insert(address, value);
    }
}

impl GuestMemory for SparseMemory {
    fn read_u32(&self, address: u32) -> u32 {
        self.words.get(&address).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceCall {
    pub number: u32,
    pub params: u32,
}

/// System-call dispatcher that records every call.
#[derive(Debug, Default)]
pub struct RecordingService {
    calls: Vec<ServiceCall>,
    results: HashMap<u32, u32>,
    default_result: u32,
    resets: HashMap<u32, GuestContext>,
}

impl RecordingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(mut self, result: u32) -> Self {
        self.default_result = result;
        self
    }

    pub fn with_result(mut self, number: u32, result: u32) -> Self {
        self.results.insert(number, result);
        self
    }

    /// Service `number` replaces the caller's context with `context`, the way a
    /// context-setting call on the current thread does.
    pub fn resetting_on(mut self, number: u32, context: GuestContext) -> Self {
        self.resets.insert(number, context);
        self
    }

    pub fn calls(&self) -> &[ServiceCall] {
        &self.calls
    }
}

impl SystemService for RecordingService {
    fn dispatch(&mut self, number: u32, params: u32, reserved: &mut CpuReserved) -> u32 {
        self.calls.push(ServiceCall { number, params });
        if let Some(context) = self.resets.get(&number) {
            reserved.context = *context;
            reserved.request_reset();
        }
        self.results
            .get(&number)
            .copied()
            .unwrap_or(self.default_result)
    }
}
