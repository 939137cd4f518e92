use crate::context::{ExtendedFpuState, LegacyFpuState, M128A, X87_REGISTER_SIZE};

pub const TAG_WORD_RESERVED: u32 = 0xffff_0000;
pub const CR0_NPX_RESERVED: u32 = 0xffff_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FpuTag {
    Valid = 0,
    Zero = 1,
    Special = 2,
    Empty = 3,
}

impl FpuTag {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => FpuTag::Valid,
            1 => FpuTag::Zero,
            2 => FpuTag::Special,
            _ => FpuTag::Empty,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Top-of-stack field (bits 11..13) of an x87 status word.
pub fn stack_top(status_word: u32) -> usize {
    ((status_word >> 11) & 7) as usize
}

/// Slot in the save area holding physical register `physical`.
pub fn stack_slot(physical: usize, top: usize) -> usize {
    physical.wrapping_sub(top) & 7
}

pub fn classify_register(reg: &M128A) -> FpuTag {
    match reg.exponent() {
        0x7fff => FpuTag::Special,
        0 if reg.low != 0 => FpuTag::Special,
        0 => FpuTag::Zero,
        _ if reg.low >> 63 != 0 => FpuTag::Valid,
        _ => FpuTag::Special,
    }
}

/// Same rule as [`classify_register`], applied to a legacy register-area slot.
pub fn classify_x87_bytes(bytes: &[u8; X87_REGISTER_SIZE]) -> FpuTag {
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    let sign_exponent = u16::from_le_bytes([bytes[8], bytes[9]]);
    classify_register(&M128A::x87(u64::from_le_bytes(low), sign_exponent))
}

impl LegacyFpuState {
    pub fn tag(&self, physical: usize) -> FpuTag {
        FpuTag::from_bits(self.tag_word >> (2 * physical))
    }
}

/// Build a legacy i386 FPU save area from an extended (fxsave) one.
pub fn fpux_to_fpu(fpux: &ExtendedFpuState) -> LegacyFpuState {
    let mut fpu = LegacyFpuState {
        control_word: fpux.control_word as u32,
        status_word: fpux.status_word as u32,
        tag_word: TAG_WORD_RESERVED,
        error_offset: fpux.error_offset,
        error_selector: fpux.error_selector as u32 | ((fpux.error_opcode as u32) << 16),
        data_offset: fpux.data_offset,
        data_selector: fpux.data_selector as u32,
        cr0_npx_state: fpux.status_word as u32 | CR0_NPX_RESERVED,
        ..LegacyFpuState::default()
    };

    let top = stack_top(fpux.status_word as u32);
    for i in 0..8 {
        let start = i * X87_REGISTER_SIZE;
        fpu.register_area[start..start + X87_REGISTER_SIZE]
            .copy_from_slice(&fpux.float_registers[i].x87_bytes());

        let tag = if fpux.tag_word & (1 << i) == 0 {
            FpuTag::Empty
        } else {
            classify_register(&fpux.float_registers[stack_slot(i, top)])
        };
        fpu.tag_word |= tag.bits() << (2 * i);
    }
    fpu
}
