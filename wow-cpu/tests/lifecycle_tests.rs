mod common;

use common::*;
use cpu::context::{EFLAGS_AC, EFLAGS_TRAP};
use cpu::host::MemoryProtection;
use cpu::host::sim::{DEFAULT_NATIVE_STACK, DEFAULT_PAGE_ADDRESS, DEFAULT_RESUME_ROUTINE};
use cpu::{CpuConfig, NtStatus, PageProtection, decode_thunk};

#[test]
fn initialize_refuses_resume_routine_above_4g() {
    let host = SimHost::new().with_resume_routine(0x1_0000_2000);
    let mut cpu = Wow64Cpu::new(host);

    let err = cpu.initialize().expect_err("init above 4G should fail");
    assert_eq!(
        err,
        CpuError::AddressRange {
            address: 0x1_0000_2000
        }
    );
    assert_eq!(err.status(), NtStatus(0xC000_0141));
    assert!(cpu.host().page().is_untouched());
    assert!(cpu.bop_code().is_none());
}

#[test]
fn initialize_refuses_page_above_4g() {
    let host = SimHost::new().with_page_address(0x7ff0_1234_0000);
    let mut cpu = Wow64Cpu::new(host);
    let err = cpu.initialize().expect_err("page above 4G should fail");
    assert!(matches!(err, CpuError::AddressRange { .. }));
    assert!(cpu.host().page().is_untouched());
}

#[test]
fn initialize_publishes_sealed_thunk() {
    let mut cpu = initialized_cpu();
    assert_eq!(cpu.bop_code(), Some(DEFAULT_PAGE_ADDRESS));
    assert_eq!(cpu.selectors(), Some(SELECTORS));

    let thunk = *cpu.thunk().expect("thunk should exist after init");
    assert_eq!(thunk.previous_protection(), PageProtection::ReadWrite);
    assert_eq!(cpu.host().page().protection(), PageProtection::ExecuteRead);

    let targets = decode_thunk(cpu.host().page().bytes()).expect("page should hold the thunk");
    assert_eq!(targets.native_cs, SELECTORS.cs64);
    assert_eq!(targets.resume, DEFAULT_RESUME_ROUTINE);

    let err = cpu
        .host_mut()
        .thunk_page()
        .write(0, &[0xcc])
        .expect_err("thunk page must stay read-only");
    assert!(matches!(err, CpuError::Protection(_)));
}

#[test]
fn initialize_twice_is_rejected() {
    let mut cpu = initialized_cpu();
    assert_eq!(cpu.initialize(), Err(CpuError::AlreadyInitialized));
    assert_eq!(cpu.process_init(), Err(CpuError::AlreadyInitialized));
    assert_eq!(cpu.host().page().protect_calls().len(), 1);
}

#[test]
fn turbo_thunks_cannot_be_enabled() {
    let cpu = initialized_cpu();
    let err = cpu
        .turbo_thunk_control(true)
        .expect_err("enabling turbo thunks should fail");
    assert_eq!(err.status(), NtStatus(0xC000_00BB));
    cpu.turbo_thunk_control(false)
        .expect("disabling turbo thunks should succeed");
}

#[test]
fn context_calls_pass_host_status_through() {
    let mut cpu = initialized_cpu();
    let other = cpu.host_mut().spawn_thread(GuestContext {
        eip: 0x0040_5000,
        ..GuestContext::default()
    });

    let mut ctx = GuestContext::default();
    cpu.get_context(other, &mut ctx)
        .expect("known thread should be readable");
    assert_eq!(ctx.eip, 0x0040_5000);

    cpu.host_mut().fail_context_calls(NtStatus::ACCESS_DENIED);
    assert_eq!(
        cpu.get_context(other, &mut ctx),
        Err(CpuError::Host(NtStatus::ACCESS_DENIED))
    );
    assert_eq!(
        cpu.set_context(other, &ctx),
        Err(CpuError::Host(NtStatus::ACCESS_DENIED))
    );

    cpu.host_mut().clear_failures();
    assert_eq!(
        cpu.get_context(ThreadHandle(0x4242), &mut ctx),
        Err(CpuError::Host(NtStatus::INVALID_HANDLE))
    );
}

#[test]
fn reset_requires_initialization() {
    let mut cpu = Wow64Cpu::new(SimHost::new());
    let mut frame = NativeContext::default();
    assert_eq!(
        cpu.reset_to_consistent_state(&mut frame),
        Err(CpuError::NotInitialized)
    );
    assert_eq!(frame, NativeContext::default());
}

#[test]
fn reset_is_deterministic_for_random_frames() {
    let mut rng = rng(0x5eed);
    for _ in 0..32 {
        let original = random_native_frame(&mut rng);

        let mut first = initialized_cpu();
        let mut second = initialized_cpu();
        let mut frame_a = original;
        let mut frame_b = original;
        first
            .reset_to_consistent_state(&mut frame_a)
            .expect("reset should succeed");
        second
            .reset_to_consistent_state(&mut frame_b)
            .expect("reset should succeed");

        assert_eq!(frame_a, frame_b);
        assert_eq!(
            first.host().guest_context().as_bytes(),
            second.host().guest_context().as_bytes()
        );

        assert_eq!(frame_a.rip, DEFAULT_RESUME_ROUTINE);
        assert_eq!(frame_a.seg_cs, SELECTORS.cs64);
        assert_eq!(frame_a.rsp, DEFAULT_NATIVE_STACK);
        assert_eq!(frame_a.rax, original.rax);

        let guest = first.host().guest_context();
        assert_eq!(guest.eip, original.rip as u32);
        assert_eq!(guest.eflags & (EFLAGS_TRAP | EFLAGS_AC), 0);
        assert_eq!(guest.eflags, original.eflags & !(EFLAGS_TRAP | EFLAGS_AC));
        assert_eq!(guest.flags(), ContextFlags::ALL);
        assert!(first.host().reserved().reset_pending());

        let mut service = RecordingService::new();
        let ret = first
            .simulate(&mut service)
            .expect("simulate should take the reset path");
        assert!(ret.is_reset());
        assert_eq!(ret.eip(), original.rip as u32);
        assert_eq!(ret.esp(), original.rsp as u32);
        assert!(service.calls().is_empty());
        assert!(!first.host().reserved().reset_pending());
    }
}

#[test]
fn reset_uses_configured_eflags_mask() {
    let config = CpuConfig {
        reset_eflags_clear: EFLAGS_TRAP,
        ..CpuConfig::default()
    };
    let mut cpu = Wow64Cpu::with_config(SimHost::new(), config);
    cpu.initialize().expect("init should succeed");

    let mut frame = NativeContext {
        eflags: 0x0004_0302,
        seg_cs: 0x23,
        ..NativeContext::default()
    };
    cpu.reset_to_consistent_state(&mut frame)
        .expect("reset should succeed");
    assert_eq!(cpu.host().guest_context().eflags, 0x0004_0202);
}

#[test]
fn reset_survives_failing_context_commit() {
    let mut cpu = initialized_cpu();
    cpu.host_mut().fail_context_calls(NtStatus::INVALID_HANDLE);
    let mut frame = random_native_frame(&mut rng(9));

    cpu.reset_to_consistent_state(&mut frame)
        .expect("host failure must not fail the reset");
    assert_eq!(frame.rip, DEFAULT_RESUME_ROUTINE);
    assert_eq!(frame.seg_cs, SELECTORS.cs64);
    assert!(cpu.host().reserved().reset_pending());
}

#[test]
fn syscall_and_reset_cycle() {
    let mut cpu = initialized_cpu();
    let mut replacement = GuestContext::default();
    replacement.eip = 0x0040_9000;
    replacement.esp = 0x0020_0000;
    replacement.eax = 0xfeed;
    replacement.seg_cs = 0x23;
    replacement.seg_ss = 0x2b;
    replacement.seg_fs = 0x53;
    let mut service = RecordingService::new()
        .returning(0)
        .with_result(0x19, 0xc000_0022)
        .resetting_on(0x2a, replacement);
    let mut memory = SparseMemory::new();

    let mut regs = start_guest(&mut cpu, &mut service, 0x0040_1000, 0x0012_ff00);
    assert_eq!((regs.eip, regs.esp), (0x0040_1000, 0x0012_ff00));
    assert_eq!(regs.ds, 0x2b);

    // Plain syscall: far return right after the call, result in eax.
    regs.ebx = 0x1111;
    regs.edi = 0x2222;
    guest_call(&mut regs, &mut memory, 0x19, 0x0040_1006);
    let frame = cpu
        .enter_from_guest(&regs, &memory, &mut service)
        .expect("syscall should complete");
    assert!(!frame.is_reset());
    frame.apply(&mut regs);
    assert_eq!(regs.eax, 0xc000_0022);
    assert_eq!(regs.eip, 0x0040_1006);
    assert_eq!(regs.esp, 0x0012_ff00);
    assert_eq!((regs.ebx, regs.edi), (0x1111, 0x2222));
    assert_eq!(service.calls()[0].number, 0x19);
    assert_eq!(service.calls()[0].params, 0x0012_ff04);
    assert_eq!(cpu.host().native_stack(), DEFAULT_NATIVE_STACK);

    // Context-replacing syscall: interrupt return into the new context.
    guest_call(&mut regs, &mut memory, 0x2a, 0x0040_100c);
    let frame = cpu
        .enter_from_guest(&regs, &memory, &mut service)
        .expect("syscall should complete");
    assert!(frame.is_reset());
    frame.apply(&mut regs);
    assert_eq!((regs.eip, regs.esp, regs.eax), (0x0040_9000, 0x0020_0000, 0xfeed));
    assert_eq!((regs.ss, regs.ds, regs.es, regs.fs), (0x2b, 0x2b, 0x2b, 0x53));
    assert!(!cpu.host().reserved().reset_pending());

    // And the next call is an ordinary one again.
    guest_call(&mut regs, &mut memory, 0x07, 0x0040_9006);
    let frame = cpu
        .enter_from_guest(&regs, &memory, &mut service)
        .expect("syscall should complete");
    assert!(!frame.is_reset());
    assert_eq!(frame.eip(), 0x0040_9006);
    assert_eq!(service.calls().len(), 3);
}

#[test]
fn entry_checks_thunk_integrity() {
    let mut cpu = Wow64Cpu::new(SimHost::new());
    let mut service = RecordingService::new();
    let memory = SparseMemory::new();
    let regs = GuestRegisters::default();
    assert_eq!(
        cpu.enter_from_guest(&regs, &memory, &mut service),
        Err(CpuError::NotInitialized)
    );
    assert_eq!(cpu.simulate(&mut service), Err(CpuError::NotInitialized));

    cpu.initialize().expect("init should succeed");
    let page = cpu.host_mut().thunk_page();
    page.protect(DEFAULT_PAGE_ADDRESS, 25, PageProtection::ReadWrite)
        .expect("reprotect should succeed");
    page.write(0x0a, &[0x23, 0x00]).expect("write should succeed");

    assert_eq!(
        cpu.enter_from_guest(&regs, &memory, &mut service),
        Err(CpuError::CorruptThunk)
    );
    assert!(service.calls().is_empty());
}
