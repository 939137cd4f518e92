use tracing::debug;

use crate::context::{CapturedSelectors, ContextFlags, GuestContext, NativeContext};
use crate::fpu::fpux_to_fpu;

/// Copy a native context describing an exception raised in guest mode into the
/// corresponding guest context.
///
/// Only the subsets named in `flags` are written; `context_flags` is always
/// set to `flags` as given. Selectors that have no native counterpart are
/// synthesized from the captured ones.
pub fn copy_context_64to32(
    ctx32: &mut GuestContext,
    flags: ContextFlags,
    ctx64: &NativeContext,
    selectors: &CapturedSelectors,
) {
    ctx32.context_flags = flags.bits();
    let flags = flags.without(ContextFlags::I386);

    if flags.includes(ContextFlags::INTEGER) {
        ctx32.eax = ctx64.rax as u32;
        ctx32.ebx = ctx64.rbx as u32;
        ctx32.ecx = ctx64.rcx as u32;
        ctx32.edx = ctx64.rdx as u32;
        ctx32.esi = ctx64.rsi as u32;
        ctx32.edi = ctx64.rdi as u32;
    }
    if flags.includes(ContextFlags::CONTROL) {
        ctx32.esp = ctx64.rsp as u32;
        ctx32.ebp = ctx64.rbp as u32;
        ctx32.eip = ctx64.rip as u32;
        ctx32.eflags = ctx64.eflags;
        ctx32.seg_cs = ctx64.seg_cs as u32;
        ctx32.seg_ss = selectors.ds64 as u32;
    }
    if flags.includes(ContextFlags::SEGMENTS) {
        ctx32.seg_ds = selectors.ds64 as u32;
        ctx32.seg_es = selectors.ds64 as u32;
        ctx32.seg_fs = selectors.fs32 as u32;
        ctx32.seg_gs = selectors.ds64 as u32;
    }
    if flags.includes(ContextFlags::DEBUG_REGISTERS) {
        ctx32.dr0 = ctx64.dr0 as u32;
        ctx32.dr1 = ctx64.dr1 as u32;
        ctx32.dr2 = ctx64.dr2 as u32;
        ctx32.dr3 = ctx64.dr3 as u32;
        ctx32.dr6 = ctx64.dr6 as u32;
        ctx32.dr7 = ctx64.dr7 as u32;
    }
    if flags.includes(ContextFlags::FLOATING_POINT) {
        ctx32.float_save = fpux_to_fpu(&ctx64.flt_save);
    }
    if flags.includes(ContextFlags::EXTENDED_REGISTERS) {
        ctx32.extended_registers = *ctx64.flt_save.as_bytes();
    }
    if flags.includes(ContextFlags::XSTATE) {
        // Only the legacy 512-byte area is carried over; AVX and later state is dropped.
        debug!("xstate requested (flags={:#x}), not converted", flags.bits());
    }
}
