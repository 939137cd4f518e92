//! Software model of the mode-transition handshake.
//!
//! Every guest system call moves the thread through
//! `GuestRunning -> Transitioning -> NativeServicing -> {Resuming | Resetting} -> GuestRunning`.
//! The register-level work of each step lives in the architecture boundary
//! (`arch`); this module owns the ordering, the reserved-slot bookkeeping and
//! the shape of the frame used to drop back into guest mode.

use tracing::{debug, trace};

use crate::context::{GuestContext, NativeContext};
use crate::cpu::{CpuError, CpuResult};
use crate::host::{GuestMemory, ReservedSlots, SystemService};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    GuestRunning,
    Transitioning,
    NativeServicing,
    Resuming,
    Resetting,
}

impl ExecutionMode {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionMode::GuestRunning => "guest-running",
            ExecutionMode::Transitioning => "transitioning",
            ExecutionMode::NativeServicing => "native-servicing",
            ExecutionMode::Resuming => "resuming",
            ExecutionMode::Resetting => "resetting",
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use ExecutionMode::*;
        matches!(
            (self, next),
            (GuestRunning, Transitioning)
                | (Transitioning, NativeServicing)
                | (NativeServicing, Resuming)
                | (NativeServicing, Resetting)
                | (Resuming, GuestRunning)
                | (Resetting, GuestRunning)
        )
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeTransition {
    mode: ExecutionMode,
    verbose: bool,
}

impl ModeTransition {
    pub fn new(mode: ExecutionMode, verbose: bool) -> Self {
        Self { mode, verbose }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn advance(&mut self, next: ExecutionMode) -> CpuResult<()> {
        if !self.mode.can_advance_to(next) {
            return Err(CpuError::InvalidTransition {
                from: self.mode,
                to: next,
            });
        }
        if self.verbose {
            debug!("mode {} -> {}", self.mode, next);
        } else {
            trace!("mode {} -> {}", self.mode, next);
        }
        self.mode = next;
        Ok(())
    }
}

/// Guest register file as seen at the mode boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl GuestRegisters {
    pub fn from_context(ctx: &GuestContext) -> Self {
        Self {
            eax: ctx.eax,
            ebx: ctx.ebx,
            ecx: ctx.ecx,
            edx: ctx.edx,
            esi: ctx.esi,
            edi: ctx.edi,
            ebp: ctx.ebp,
            esp: ctx.esp,
            eip: ctx.eip,
            eflags: ctx.eflags,
            cs: ctx.seg_cs as u16,
            ss: ctx.seg_ss as u16,
            ds: ctx.seg_ds as u16,
            es: ctx.seg_es as u16,
            fs: ctx.seg_fs as u16,
            gs: ctx.seg_gs as u16,
        }
    }

    /// Low halves of a native frame that was interrupted while in guest mode.
    pub fn from_native(ctx: &NativeContext) -> Self {
        Self {
            eax: ctx.rax as u32,
            ebx: ctx.rbx as u32,
            ecx: ctx.rcx as u32,
            edx: ctx.rdx as u32,
            esi: ctx.rsi as u32,
            edi: ctx.rdi as u32,
            ebp: ctx.rbp as u32,
            esp: ctx.rsp as u32,
            eip: ctx.rip as u32,
            eflags: ctx.eflags,
            cs: ctx.seg_cs,
            ss: ctx.seg_ss,
            ds: ctx.seg_ds,
            es: ctx.seg_es,
            fs: ctx.seg_fs,
            gs: ctx.seg_gs,
        }
    }
}

/// How control drops back into guest mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnFrame {
    /// Far return: eip/cs pushed on the guest stack, only the callee-saved
    /// registers and the result are reloaded.
    Far {
        eip: u32,
        cs: u16,
        esp: u32,
        eax: u32,
        ebx: u32,
        esi: u32,
        edi: u32,
        ebp: u32,
    },
    /// Interrupt return: full privileged frame, every register class reloaded.
    Interrupt {
        eip: u32,
        cs: u16,
        eflags: u32,
        esp: u32,
        ss: u16,
        ds: u16,
        es: u16,
        fs: u16,
        eax: u32,
        ebx: u32,
        ecx: u32,
        edx: u32,
        esi: u32,
        edi: u32,
        ebp: u32,
    },
}

impl ReturnFrame {
    fn far(ctx: &GuestContext) -> Self {
        ReturnFrame::Far {
            eip: ctx.eip,
            cs: ctx.seg_cs as u16,
            esp: ctx.esp,
            eax: ctx.eax,
            ebx: ctx.ebx,
            esi: ctx.esi,
            edi: ctx.edi,
            ebp: ctx.ebp,
        }
    }

    fn interrupt(ctx: &GuestContext) -> Self {
        let ss = ctx.seg_ss as u16;
        ReturnFrame::Interrupt {
            eip: ctx.eip,
            cs: ctx.seg_cs as u16,
            eflags: ctx.eflags,
            esp: ctx.esp,
            ss,
            ds: ss,
            es: ss,
            fs: ctx.seg_fs as u16,
            eax: ctx.eax,
            ebx: ctx.ebx,
            ecx: ctx.ecx,
            edx: ctx.edx,
            esi: ctx.esi,
            edi: ctx.edi,
            ebp: ctx.ebp,
        }
    }

    pub fn eip(&self) -> u32 {
        match *self {
            ReturnFrame::Far { eip, .. } | ReturnFrame::Interrupt { eip, .. } => eip,
        }
    }

    pub fn esp(&self) -> u32 {
        match *self {
            ReturnFrame::Far { esp, .. } | ReturnFrame::Interrupt { esp, .. } => esp,
        }
    }

    pub fn cs(&self) -> u16 {
        match *self {
            ReturnFrame::Far { cs, .. } | ReturnFrame::Interrupt { cs, .. } => cs,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, ReturnFrame::Interrupt { .. })
    }

    /// Loads the frame into `regs` the way the matching return instruction would.
    pub fn apply(&self, regs: &mut GuestRegisters) {
        match *self {
            ReturnFrame::Far {
                eip,
                cs,
                esp,
                eax,
                ebx,
                esi,
                edi,
                ebp,
            } => {
                regs.eip = eip;
                regs.cs = cs;
                regs.esp = esp;
                regs.eax = eax;
                regs.ebx = ebx;
                regs.esi = esi;
                regs.edi = edi;
                regs.ebp = ebp;
            }
            ReturnFrame::Interrupt {
                eip,
                cs,
                eflags,
                esp,
                ss,
                ds,
                es,
                fs,
                eax,
                ebx,
                ecx,
                edx,
                esi,
                edi,
                ebp,
            } => {
                *regs = GuestRegisters {
                    eax,
                    ebx,
                    ecx,
                    edx,
                    esi,
                    edi,
                    ebp,
                    esp,
                    eip,
                    eflags,
                    cs,
                    ss,
                    ds,
                    es,
                    fs,
                    gs: regs.gs,
                };
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingCall {
    number: u32,
    params: u32,
}

#[derive(Debug)]
pub struct Handshake {
    mode: ModeTransition,
    native_stack: u64,
    pending: Option<PendingCall>,
}

impl Handshake {
    pub fn new(verbose: bool) -> Self {
        Self {
            mode: ModeTransition::new(ExecutionMode::GuestRunning, verbose),
            native_stack: 0,
            pending: None,
        }
    }

    /// Starts at the return half of the routine, already running on `native_stack`.
    pub fn at_return_label(native_stack: u64, verbose: bool) -> Self {
        Self {
            mode: ModeTransition::new(ExecutionMode::NativeServicing, verbose),
            native_stack,
            pending: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode.mode()
    }

    pub fn native_stack(&self) -> u64 {
        self.native_stack
    }

    /// Arrival from the thunk: swap onto the native stack and capture guest state.
    pub fn enter<S, M>(&mut self, slots: &mut S, regs: &GuestRegisters, memory: &M) -> CpuResult<()>
    where
        S: ReservedSlots + ?Sized,
        M: GuestMemory + ?Sized,
    {
        self.mode.advance(ExecutionMode::Transitioning)?;
        // The guest stack pointer stays in regs; the saved native one becomes active.
        self.native_stack = slots.native_stack();
        self.mode.advance(ExecutionMode::NativeServicing)?;

        let reserved = slots.cpu_reserved();
        if reserved.reset_pending() {
            // A replacement context is already committed; the live registers are stale.
            self.pending = None;
            return Ok(());
        }

        let ctx = &mut reserved.context;
        ctx.edi = regs.edi;
        ctx.esi = regs.esi;
        ctx.ebx = regs.ebx;
        ctx.ebp = regs.ebp;
        ctx.eip = memory.read_u32(regs.esp);
        ctx.eflags = regs.eflags;
        ctx.esp = regs.esp.wrapping_add(4);
        self.pending = Some(PendingCall {
            number: regs.eax,
            params: regs.esp.wrapping_add(8),
        });
        Ok(())
    }

    /// Runs the pending system call and picks the way back to guest mode.
    pub fn service<S, V>(&mut self, slots: &mut S, service: &mut V) -> CpuResult<ExecutionMode>
    where
        S: ReservedSlots + ?Sized,
        V: SystemService + ?Sized,
    {
        let mode = self.mode.mode();
        if mode != ExecutionMode::NativeServicing {
            return Err(CpuError::InvalidTransition {
                from: mode,
                to: ExecutionMode::NativeServicing,
            });
        }

        let reserved = slots.cpu_reserved();
        let result = self
            .pending
            .take()
            .map(|call| service.dispatch(call.number, call.params, reserved));
        if reserved.take_reset_request() {
            self.mode.advance(ExecutionMode::Resetting)?;
        } else {
            if let Some(result) = result {
                reserved.context.eax = result;
            }
            self.mode.advance(ExecutionMode::Resuming)?;
        }
        Ok(self.mode.mode())
    }

    /// Builds the return frame and hands the native stack back to the slots.
    pub fn finish<S>(&mut self, slots: &mut S) -> CpuResult<ReturnFrame>
    where
        S: ReservedSlots + ?Sized,
    {
        let ctx = slots.cpu_reserved().context;
        let frame = match self.mode.mode() {
            ExecutionMode::Resuming => ReturnFrame::far(&ctx),
            ExecutionMode::Resetting => ReturnFrame::interrupt(&ctx),
            other => {
                return Err(CpuError::InvalidTransition {
                    from: other,
                    to: ExecutionMode::GuestRunning,
                });
            }
        };
        slots.set_native_stack(self.native_stack);
        self.mode.advance(ExecutionMode::GuestRunning)?;
        Ok(frame)
    }

    pub fn run<S, M, V>(
        &mut self,
        slots: &mut S,
        regs: &GuestRegisters,
        memory: &M,
        service: &mut V,
    ) -> CpuResult<ReturnFrame>
    where
        S: ReservedSlots + ?Sized,
        M: GuestMemory + ?Sized,
        V: SystemService + ?Sized,
    {
        self.enter(slots, regs, memory)?;
        self.service(slots, service)?;
        self.finish(slots)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::context::CpuReserved;

    struct Slots {
        native_stack: u64,
        reserved: CpuReserved,
    }

    impl ReservedSlots for Slots {
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

    struct Memory(HashMap<u32, u32>);

    impl GuestMemory for Memory {
        fn read_u32(&self, address: u32) -> u32 {
            self.0.get(&address).copied().unwrap_or(0)
        }
    }

    struct Fixed {
        result: u32,
        calls: Vec<(u32, u32)>,
        reset_to: Option<u32>,
    }

    impl SystemService for Fixed {
        fn dispatch(&mut self, number: u32, params: u32, reserved: &mut CpuReserved) -> u32 {
            self.calls.push((number, params));
            if let Some(eip) = self.reset_to {
                reserved.context.eip = eip;
                reserved.request_reset();
            }
            self.result
        }
    }

    fn slots() -> Slots {
        let mut reserved = CpuReserved::new(GuestContext::default());
        reserved.context.seg_cs = 0x23;
        reserved.context.seg_ss = 0x2b;
        reserved.context.seg_fs = 0x53;
        Slots {
            native_stack: 0x0000_7ff0_0000_1000,
            reserved,
        }
    }

    fn regs() -> GuestRegisters {
        GuestRegisters {
            eax: 0x19,
            ebx: 1,
            esi: 2,
            edi: 3,
            ebp: 0x0012_ff80,
            esp: 0x0012_ff00,
            eflags: 0x202,
            ..GuestRegisters::default()
        }
    }

    fn memory() -> Memory {
        Memory(HashMap::from([(0x0012_ff00, 0x7700_1234)]))
    }

    #[test]
    fn transition_table_matches_mode_cycle() {
        use ExecutionMode::*;
        assert!(GuestRunning.can_advance_to(Transitioning));
        assert!(NativeServicing.can_advance_to(Resetting));
        assert!(Resetting.can_advance_to(GuestRunning));
        assert!(!GuestRunning.can_advance_to(NativeServicing));
        assert!(!Resuming.can_advance_to(Resetting));
        assert!(!Transitioning.can_advance_to(GuestRunning));

        let mut mode = ModeTransition::new(GuestRunning, false);
        let err = mode.advance(Resuming).expect_err("skip should be rejected");
        assert!(matches!(
            err,
            CpuError::InvalidTransition {
                from: GuestRunning,
                to: Resuming
            }
        ));
        assert_eq!(mode.mode(), GuestRunning);
    }

    #[test]
    fn syscall_captures_state_and_resumes_after_call() {
        let mut slots = slots();
        let mut service = Fixed {
            result: 0x103,
            calls: Vec::new(),
            reset_to: None,
        };
        let mut handshake = Handshake::new(false);

        let frame = handshake
            .run(&mut slots, &regs(), &memory(), &mut service)
            .expect("handshake should complete");

        assert_eq!(service.calls, vec![(0x19, 0x0012_ff08)]);
        assert_eq!(
            frame,
            ReturnFrame::Far {
                eip: 0x7700_1234,
                cs: 0x23,
                esp: 0x0012_ff04,
                eax: 0x103,
                ebx: 1,
                esi: 2,
                edi: 3,
                ebp: 0x0012_ff80,
            }
        );
        assert_eq!(slots.reserved.context.eflags, 0x202);
        assert_eq!(slots.reserved.context.eax, 0x103);
        assert_eq!(slots.native_stack, 0x0000_7ff0_0000_1000);
        assert_eq!(handshake.mode(), ExecutionMode::GuestRunning);
    }

    #[test]
    fn reset_requested_by_service_takes_interrupt_path() {
        let mut slots = slots();
        slots.reserved.context.eax = 0xaaaa;
        slots.reserved.context.ecx = 0xcccc;
        let mut service = Fixed {
            result: 0,
            calls: Vec::new(),
            reset_to: Some(0x0040_0000),
        };
        let mut handshake = Handshake::new(true);

        let frame = handshake
            .run(&mut slots, &regs(), &memory(), &mut service)
            .expect("handshake should complete");

        assert!(frame.is_reset());
        assert_eq!(frame.eip(), 0x0040_0000);
        match frame {
            ReturnFrame::Interrupt {
                ss, ds, es, fs, eax, ecx, ..
            } => {
                assert_eq!((ss, ds, es, fs), (0x2b, 0x2b, 0x2b, 0x53));
                assert_eq!(eax, 0xaaaa, "reset must not clobber eax with the result");
                assert_eq!(ecx, 0xcccc);
            }
            other => panic!("expected interrupt frame, got {other:?}"),
        }
        assert!(!slots.reserved.reset_pending());
    }

    #[test]
    fn pending_reset_skips_capture_and_service() {
        let mut slots = slots();
        slots.reserved.context.eip = 0x0040_1000;
        slots.reserved.context.edi = 0x55;
        slots.reserved.request_reset();
        let mut service = Fixed {
            result: 7,
            calls: Vec::new(),
            reset_to: None,
        };
        let mut handshake = Handshake::new(false);

        let frame = handshake
            .run(&mut slots, &regs(), &memory(), &mut service)
            .expect("handshake should complete");

        assert!(service.calls.is_empty());
        assert!(frame.is_reset());
        assert_eq!(frame.eip(), 0x0040_1000);
        assert_eq!(slots.reserved.context.edi, 0x55);
    }

    #[test]
    fn return_label_entry_resumes_saved_context() {
        let mut slots = slots();
        slots.reserved.context.eip = 0x0040_2000;
        slots.reserved.context.esp = 0x0013_0000;
        let mut service = Fixed {
            result: 0,
            calls: Vec::new(),
            reset_to: None,
        };
        let mut handshake = Handshake::at_return_label(0x5000, false);

        handshake
            .service(&mut slots, &mut service)
            .expect("service step should run");
        let frame = handshake.finish(&mut slots).expect("finish should run");

        assert!(!frame.is_reset());
        assert_eq!((frame.eip(), frame.esp()), (0x0040_2000, 0x0013_0000));
        assert_eq!(slots.native_stack, 0x5000);
        assert!(service.calls.is_empty());
    }

    #[test]
    fn finish_before_service_is_rejected() {
        let mut slots = slots();
        let mut handshake = Handshake::new(false);
        handshake
            .enter(&mut slots, &regs(), &memory())
            .expect("enter should run");
        let err = handshake.finish(&mut slots).expect_err("finish needs a decision");
        assert!(matches!(err, CpuError::InvalidTransition { .. }));
    }

    #[test]
    fn apply_far_frame_keeps_volatile_registers() {
        let mut regs = regs();
        regs.ecx = 0x99;
        let frame = ReturnFrame::Far {
            eip: 1,
            cs: 0x23,
            esp: 2,
            eax: 3,
            ebx: 4,
            esi: 5,
            edi: 6,
            ebp: 7,
        };
        frame.apply(&mut regs);
        assert_eq!((regs.eip, regs.esp, regs.eax), (1, 2, 3));
        assert_eq!(regs.ecx, 0x99);
    }
}
