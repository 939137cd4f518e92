#![allow(dead_code, unused_imports)]

pub use cpu::host::sim::{RecordingService, SimHost, SparseMemory};
pub use cpu::{
    CapturedSelectors, ContextFlags, CpuError, GuestContext, GuestRegisters, Host, M128A,
    NativeContext, ReservedSlots, ReturnFrame, ThreadHandle, ThunkBuffer, Wow64Cpu,
    copy_context_64to32,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub const SELECTORS: CapturedSelectors = CapturedSelectors {
    cs64: 0x33,
    ds64: 0x2b,
    fs32: 0x53,
};

pub fn initialized_cpu() -> Wow64Cpu<SimHost> {
    let mut cpu = Wow64Cpu::new(SimHost::new());
    cpu.initialize().expect("simulated host should initialize");
    cpu
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Native frame as it looks when an exception hits guest code.
pub fn random_native_frame(rng: &mut StdRng) -> NativeContext {
    let mut ctx = NativeContext {
        rax: rng.next_u64(),
        rbx: rng.next_u64(),
        rcx: rng.next_u64(),
        rdx: rng.next_u64(),
        rsi: rng.next_u64(),
        rdi: rng.next_u64(),
        rbp: rng.next_u64(),
        rsp: rng.next_u64(),
        rip: u64::from(rng.next_u32()),
        eflags: rng.next_u32(),
        seg_cs: 0x23,
        dr0: rng.next_u64(),
        dr7: rng.next_u64(),
        ..NativeContext::default()
    };
    ctx.flt_save.control_word = rng.next_u32() as u16;
    ctx.flt_save.status_word = rng.next_u32() as u16;
    ctx.flt_save.tag_word = rng.next_u32() as u8;
    for reg in ctx.flt_save.float_registers.iter_mut() {
        *reg = M128A::x87(rng.next_u64(), rng.next_u32() as u16);
    }
    for reg in ctx.flt_save.xmm_registers.iter_mut() {
        *reg = M128A::new(rng.next_u64(), rng.next_u64() as i64);
    }
    ctx
}

/// Guest state right after `call [bop]`: the return address is on the stack.
pub fn guest_call(
    regs: &mut GuestRegisters,
    memory: &mut SparseMemory,
    number: u32,
    return_to: u32,
) {
    regs.esp = regs.esp.wrapping_sub(4);
    memory.write_u32(regs.esp, return_to);
    regs.eax = number;
}

/// Enters guest mode at `eip`/`esp` through the reset path.
pub fn start_guest(
    cpu: &mut Wow64Cpu<SimHost>,
    service: &mut RecordingService,
    eip: u32,
    esp: u32,
) -> GuestRegisters {
    let mut guest = GuestContext::default();
    cpu.get_context(ThreadHandle::CURRENT, &mut guest)
        .expect("current thread context should be readable");
    guest.eip = eip;
    guest.esp = esp;
    cpu.set_context(ThreadHandle::CURRENT, &guest)
        .expect("current thread context should be writable");
    let frame = cpu.simulate(service).expect("simulate should enter guest");
    assert!(frame.is_reset());
    let mut regs = GuestRegisters::from_context(&guest);
    frame.apply(&mut regs);
    regs
}
