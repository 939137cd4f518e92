//! Machine context records for both sides of the mode boundary.
//!
//! The layouts are the ones the transition assembly and the host's
//! thread-context service address by offset, so every record is `repr(C)`
//! and pinned by the size/offset assertions at the bottom of this file.

use std::mem::{offset_of, size_of};
use std::ops::BitOr;

pub const EFLAGS_TRAP: u32 = 0x0000_0100;
pub const EFLAGS_VM: u32 = 0x0002_0000;
pub const EFLAGS_AC: u32 = 0x0004_0000;

pub const EXTENDED_REGISTERS_SIZE: usize = 512;
pub const X87_REGISTER_SIZE: usize = 10;
pub const X87_REGISTER_AREA_SIZE: usize = 8 * X87_REGISTER_SIZE;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;

/// Bit 0 of [`CpuReserved::flags`]: the next return to guest mode must reload
/// the whole guest context instead of resuming after the last syscall.
pub const CPURESERVED_FLAG_RESET_STATE: u16 = 0x0001;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextFlags(u32);

impl ContextFlags {
    pub const I386: Self = Self(0x0001_0000);
    pub const CONTROL: Self = Self(0x0001_0001);
    pub const INTEGER: Self = Self(0x0001_0002);
    pub const SEGMENTS: Self = Self(0x0001_0004);
    pub const FLOATING_POINT: Self = Self(0x0001_0008);
    pub const DEBUG_REGISTERS: Self = Self(0x0001_0010);
    pub const EXTENDED_REGISTERS: Self = Self(0x0001_0020);
    pub const XSTATE: Self = Self(0x0001_0040);
    pub const FULL: Self = Self(Self::CONTROL.0 | Self::INTEGER.0 | Self::SEGMENTS.0);
    pub const ALL: Self = Self(
        Self::FULL.0
            | Self::FLOATING_POINT.0
            | Self::DEBUG_REGISTERS.0
            | Self::EXTENDED_REGISTERS.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one subset bit of `subset` is set, ignoring the architecture tag.
    pub const fn includes(self, subset: Self) -> bool {
        self.0 & subset.0 & !Self::I386.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ContextFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

impl M128A {
    pub const fn new(low: u64, high: i64) -> Self {
        Self { low, high }
    }

    /// Builds an x87 register slot from a 64-bit significand and the 16-bit
    /// sign/exponent word.
    pub const fn x87(significand: u64, sign_exponent: u16) -> Self {
        Self {
            low: significand,
            high: sign_exponent as i64,
        }
    }

    pub const fn exponent(&self) -> u16 {
        (self.high & 0x7fff) as u16
    }

    /// The 80-bit value as it is stored in a legacy register area.
    pub fn x87_bytes(&self) -> [u8; X87_REGISTER_SIZE] {
        let mut out = [0u8; X87_REGISTER_SIZE];
        out[..8].copy_from_slice(&self.low.to_le_bytes());
        out[8..].copy_from_slice(&(self.high as u16).to_le_bytes());
        out
    }
}

/// Native SSE save area (`fxsave` format).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtendedFpuState {
    pub control_word: u16,
    pub status_word: u16,
    /// Abridged tag: bit `i` set means physical register `i` is in use.
    pub tag_word: u8,
    pub reserved1: u8,
    pub error_opcode: u16,
    pub error_offset: u32,
    pub error_selector: u16,
    pub reserved2: u16,
    pub data_offset: u32,
    pub data_selector: u16,
    pub reserved3: u16,
    pub mx_csr: u32,
    pub mx_csr_mask: u32,
    pub float_registers: [M128A; 8],
    pub xmm_registers: [M128A; 16],
    pub reserved4: [u8; 96],
}

impl Default for ExtendedFpuState {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            reserved1: 0,
            error_opcode: 0,
            error_offset: 0,
            error_selector: 0,
            reserved2: 0,
            data_offset: 0,
            data_selector: 0,
            reserved3: 0,
            mx_csr: 0,
            mx_csr_mask: 0,
            float_registers: [M128A::default(); 8],
            xmm_registers: [M128A::default(); 16],
            reserved4: [0; 96],
        }
    }
}

impl ExtendedFpuState {
    pub fn as_bytes(&self) -> &[u8; EXTENDED_REGISTERS_SIZE] {
        // fxsave layout has no implicit padding, see the size assertion below.
        unsafe { &*(self as *const Self as *const [u8; EXTENDED_REGISTERS_SIZE]) }
    }
}

/// Legacy i386 floating-point save area (`fnsave` format, widened to dwords).
///
/// * `tag_word` bits `2i..=2i+1`: tag of physical register `i`
///   (0 valid, 1 zero, 2 special, 3 empty); bits 16..31 are always set.
/// * `error_selector` bits 0..15: FPU instruction selector; bits 16..26: last opcode.
/// * `cr0_npx_state`: status word with the high half forced to ones.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LegacyFpuState {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; X87_REGISTER_AREA_SIZE],
    pub cr0_npx_state: u32,
}

impl Default for LegacyFpuState {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            error_offset: 0,
            error_selector: 0,
            data_offset: 0,
            data_selector: 0,
            register_area: [0; X87_REGISTER_AREA_SIZE],
            cr0_npx_state: 0,
        }
    }
}

impl LegacyFpuState {
    pub fn register(&self, index: usize) -> [u8; X87_REGISTER_SIZE] {
        let mut out = [0u8; X87_REGISTER_SIZE];
        let start = index * X87_REGISTER_SIZE;
        out.copy_from_slice(&self.register_area[start..start + X87_REGISTER_SIZE]);
        out
    }
}

/// Guest-width (i386) machine context.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestContext {
    pub context_flags: u32,

    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,

    pub float_save: LegacyFpuState,

    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,

    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,

    pub extended_registers: [u8; EXTENDED_REGISTERS_SIZE],
}

impl Default for GuestContext {
    fn default() -> Self {
        Self {
            context_flags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            float_save: LegacyFpuState::default(),
            seg_gs: 0,
            seg_fs: 0,
            seg_es: 0,
            seg_ds: 0,
            edi: 0,
            esi: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ebp: 0,
            eip: 0,
            seg_cs: 0,
            eflags: 0,
            esp: 0,
            seg_ss: 0,
            extended_registers: [0; EXTENDED_REGISTERS_SIZE],
        }
    }
}

impl GuestContext {
    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits(self.context_flags)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // All fields are u32 or byte arrays at 4-byte aligned offsets: no padding.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
    }
}

/// Native-width (amd64) machine context.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeContext {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,

    pub context_flags: u32,
    pub mx_csr: u32,

    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,

    pub flt_save: ExtendedFpuState,

    pub vector_register: [M128A; 26],
    pub vector_control: u64,

    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

/// Per-thread reserved CPU area; the guest context lives at offset 4.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuReserved {
    pub flags: u16,
    pub machine: u16,
    pub context: GuestContext,
}

impl CpuReserved {
    pub fn new(context: GuestContext) -> Self {
        Self {
            flags: 0,
            machine: IMAGE_FILE_MACHINE_I386,
            context,
        }
    }

    pub fn request_reset(&mut self) {
        self.flags |= CPURESERVED_FLAG_RESET_STATE;
    }

    pub fn reset_pending(&self) -> bool {
        self.flags & CPURESERVED_FLAG_RESET_STATE != 0
    }

    /// Test-and-clear of the reset bit.
    pub fn take_reset_request(&mut self) -> bool {
        let pending = self.reset_pending();
        self.flags &= !CPURESERVED_FLAG_RESET_STATE;
        pending
    }
}

/// Selector values captured once from the running native context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapturedSelectors {
    pub cs64: u16,
    pub ds64: u16,
    pub fs32: u16,
}

impl CapturedSelectors {
    pub fn from_native(context: &NativeContext) -> Self {
        Self {
            cs64: context.seg_cs,
            ds64: context.seg_ds,
            fs32: context.seg_fs,
        }
    }
}

pub const GUEST_CONTEXT_SIZE: usize = 0x2cc;
pub const NATIVE_CONTEXT_SIZE: usize = 0x4d0;
pub const CPU_RESERVED_CONTEXT_OFFSET: usize = offset_of!(CpuReserved, context);

const _: () = assert!(size_of::<ExtendedFpuState>() == EXTENDED_REGISTERS_SIZE);
const _: () = assert!(size_of::<LegacyFpuState>() == 112);
const _: () = assert!(size_of::<GuestContext>() == GUEST_CONTEXT_SIZE);
const _: () = assert!(size_of::<NativeContext>() == NATIVE_CONTEXT_SIZE);
const _: () = assert!(CPU_RESERVED_CONTEXT_OFFSET == 4);

const _: () = assert!(offset_of!(ExtendedFpuState, float_registers) == 0x20);
const _: () = assert!(offset_of!(GuestContext, float_save) == 0x1c);
const _: () = assert!(offset_of!(GuestContext, seg_fs) == 0x90);
const _: () = assert!(offset_of!(GuestContext, edi) == 0x9c);
const _: () = assert!(offset_of!(GuestContext, esi) == 0xa0);
const _: () = assert!(offset_of!(GuestContext, ebx) == 0xa4);
const _: () = assert!(offset_of!(GuestContext, edx) == 0xa8);
const _: () = assert!(offset_of!(GuestContext, ecx) == 0xac);
const _: () = assert!(offset_of!(GuestContext, eax) == 0xb0);
const _: () = assert!(offset_of!(GuestContext, ebp) == 0xb4);
const _: () = assert!(offset_of!(GuestContext, eip) == 0xb8);
const _: () = assert!(offset_of!(GuestContext, seg_cs) == 0xbc);
const _: () = assert!(offset_of!(GuestContext, eflags) == 0xc0);
const _: () = assert!(offset_of!(GuestContext, esp) == 0xc4);
const _: () = assert!(offset_of!(GuestContext, seg_ss) == 0xc8);
const _: () = assert!(offset_of!(GuestContext, extended_registers) == 0xcc);
const _: () = assert!(offset_of!(NativeContext, context_flags) == 0x30);
const _: () = assert!(offset_of!(NativeContext, seg_cs) == 0x38);
const _: () = assert!(offset_of!(NativeContext, eflags) == 0x44);
const _: () = assert!(offset_of!(NativeContext, rax) == 0x78);
const _: () = assert!(offset_of!(NativeContext, rsp) == 0x98);
const _: () = assert!(offset_of!(NativeContext, rip) == 0xf8);
const _: () = assert!(offset_of!(NativeContext, flt_save) == 0x100);
const _: () = assert!(offset_of!(NativeContext, vector_register) == 0x300);
