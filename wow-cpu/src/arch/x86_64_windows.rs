use std::arch::global_asm;
use std::mem::offset_of;

use crate::context::{CpuReserved, GuestContext};
use crate::host::windows::NtSystemService;
use crate::host::{
    SystemService, TLS_SLOT_CPU_RESERVED, TLS_SLOT_NATIVE_STACK, TLS_SLOT_SAVED_R13,
    TLS_SLOT_SAVED_R14, tls_slot_offset,
};

// r13 holds the guest context for the whole routine, the reserved flags sit
// just below it. r14 carries the stack that is not currently in rsp.
global_asm!(
    r#"
.global wowcpu_syscall_32to64
wowcpu_syscall_32to64:
    push r12
    mov r12, gs:[0x30]
    mov [r12 + {slot_r13}], r13
    mov [r12 + {slot_r14}], r14
    mov r13, [r12 + {slot_reserved}]
    lea r13, [r13 + {ctx}]
    mov r14, [r12 + {slot_stack}]
    pop r12
    xchg r14, rsp
    bt dword ptr [r13 - {ctx}], 0
    jc .Lwowcpu_return
    mov [r13 + {edi}], edi
    mov [r13 + {esi}], esi
    mov [r13 + {ebx}], ebx
    mov [r13 + {ebp}], ebp
    mov edx, [r14]
    mov [r13 + {eip}], edx
    pushfq
    pop rdx
    mov [r13 + {eflags}], edx
    lea rdx, [r14 + 4]
    mov [r13 + {esp}], edx
    mov ecx, eax
    lea rdx, [r14 + 8]
    lea r8, [r13 - {ctx}]
    call {guest_syscall}

.Lwowcpu_return:
    mov edi, [r13 + {edi}]
    mov esi, [r13 + {esi}]
    mov ebx, [r13 + {ebx}]
    mov ebp, [r13 + {ebp}]
    btr dword ptr [r13 - {ctx}], 0
    jc .Lwowcpu_reset
    mov edx, [r13 + {eip}]
    mov [rsp], edx
    mov edx, [r13 + {seg_cs}]
    mov [rsp + 4], edx
    mov r14d, [r13 + {esp}]
    xchg r14, rsp
    push qword ptr [r14]
    mov eax, [r13 + {eax}]
    push r12
    mov r12, gs:[0x30]
    mov r13, [r12 + {slot_r13}]
    mov [r12 + {slot_stack}], r14
    mov r14, [r12 + {slot_r14}]
    pop r12
    retf

.Lwowcpu_reset:
    mov r14, rsp
    mov edx, [r13 + {edx}]
    mov ecx, [r13 + {ecx}]
    mov eax, [r13 + {seg_ss}]
    mov [rsp + 0x20], rax
    mov ds, ax
    mov es, ax
    mov fs, word ptr [r13 + {seg_fs}]
    mov eax, [r13 + {esp}]
    mov [rsp + 0x18], rax
    mov eax, [r13 + {eflags}]
    mov [rsp + 0x10], rax
    mov eax, [r13 + {seg_cs}]
    mov [rsp + 0x8], rax
    mov eax, [r13 + {eip}]
    mov [rsp], rax
    mov eax, [r13 + {eax}]
    push r12
    mov r12, gs:[0x30]
    mov r13, [r12 + {slot_r13}]
    mov [r12 + {slot_stack}], r14
    mov r14, [r12 + {slot_r14}]
    pop r12
    iretq

.global wowcpu_simulate
wowcpu_simulate:
    sub rsp, 0x28
    mov r12, gs:[0x30]
    mov rcx, [r12 + {slot_reserved}]
    lea r13, [rcx + {ctx}]
    jmp .Lwowcpu_return
"#,
    slot_r13 = const tls_slot_offset(TLS_SLOT_SAVED_R13),
    slot_r14 = const tls_slot_offset(TLS_SLOT_SAVED_R14),
    slot_reserved = const tls_slot_offset(TLS_SLOT_CPU_RESERVED),
    slot_stack = const tls_slot_offset(TLS_SLOT_NATIVE_STACK),
    ctx = const offset_of!(CpuReserved, context),
    edi = const offset_of!(GuestContext, edi),
    esi = const offset_of!(GuestContext, esi),
    ebx = const offset_of!(GuestContext, ebx),
    edx = const offset_of!(GuestContext, edx),
    ecx = const offset_of!(GuestContext, ecx),
    eax = const offset_of!(GuestContext, eax),
    ebp = const offset_of!(GuestContext, ebp),
    eip = const offset_of!(GuestContext, eip),
    seg_cs = const offset_of!(GuestContext, seg_cs),
    eflags = const offset_of!(GuestContext, eflags),
    esp = const offset_of!(GuestContext, esp),
    seg_ss = const offset_of!(GuestContext, seg_ss),
    seg_fs = const offset_of!(GuestContext, seg_fs),
    guest_syscall = sym guest_syscall,
);

unsafe extern "system" {
    fn wowcpu_syscall_32to64();
    fn wowcpu_simulate() -> !;
}

/// Runs on the native stack between the capture and the return label.
/// The result only lands in eax when no context replacement is pending.
unsafe extern "system" fn guest_syscall(number: u32, params: u64, reserved: *mut CpuReserved) {
    let reserved = unsafe { &mut *reserved };
    let result = NtSystemService.dispatch(number, params as u32, reserved);
    if !reserved.reset_pending() {
        reserved.context.eax = result;
    }
}

/// Address the transition thunk jumps to.
pub fn syscall_entry() -> u64 {
    wowcpu_syscall_32to64 as usize as u64
}

/// Leaves native code for the current thread's guest context. Never returns.
///
/// # Safety
/// The thread's reserved area must hold a valid guest context.
pub unsafe fn simulate() -> ! {
    unsafe { wowcpu_simulate() }
}
