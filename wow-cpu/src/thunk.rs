use tracing::debug;

use crate::cpu::{CpuError, CpuResult};
use crate::host::{MemoryProtection, PageProtection};

pub const THUNK_PAGE_SIZE: usize = 0x1000;
pub const THUNK_SIZE: usize = 25;
/// `jmp [rip+0]` reads eight bytes; the four after the thunk must stay zero.
const JMP_TARGET_TAIL: usize = 4;

const OFFSET_LCALL_ADDR: usize = 0x06;
const OFFSET_CS: usize = 0x0a;
const OFFSET_ADD: usize = 0x0c;
const OFFSET_JMP: usize = 0x0f;
const OFFSET_JMP_ADDR: usize = 0x15;

const LCALL: [u8; 2] = [0xff, 0x1d]; // call far m16:32, disp32
const ADD_ESP_8: [u8; 3] = [0x83, 0xc4, 0x08];
const JMP_RIP: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00]; // jmp [rip+0]

/// Writable storage backing the transition thunk.
pub trait ThunkBuffer {
    fn address(&self) -> u64;
    fn len(&self) -> usize;
    fn bytes(&self) -> &[u8];
    /// Must fail once the buffer has been made non-writable.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> CpuResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionThunk {
    entry: u32,
    resume: u32,
    native_cs: u16,
    previous_protection: PageProtection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThunkTargets {
    /// Operand of the far call: address of the far pointer.
    pub far_pointer: u32,
    /// Offset half of the far pointer, where execution continues in native mode.
    pub continue_at: u32,
    pub native_cs: u16,
    /// Target of the final indirect jump.
    pub resume: u64,
}

impl TransitionThunk {
    pub fn encode(base: u32, native_cs: u16, resume: u32) -> [u8; THUNK_SIZE] {
        let mut code = [0u8; THUNK_SIZE];
        code[..2].copy_from_slice(&LCALL);
        code[2..OFFSET_LCALL_ADDR]
            .copy_from_slice(&base.wrapping_add(OFFSET_LCALL_ADDR as u32).to_le_bytes());
        code[OFFSET_LCALL_ADDR..OFFSET_CS]
            .copy_from_slice(&base.wrapping_add(OFFSET_ADD as u32).to_le_bytes());
        code[OFFSET_CS..OFFSET_ADD].copy_from_slice(&native_cs.to_le_bytes());
        code[OFFSET_ADD..OFFSET_JMP].copy_from_slice(&ADD_ESP_8);
        code[OFFSET_JMP..OFFSET_JMP_ADDR].copy_from_slice(&JMP_RIP);
        code[OFFSET_JMP_ADDR..].copy_from_slice(&resume.to_le_bytes());
        code
    }

    /// Writes the thunk at the start of `page` and makes the page execute-read.
    ///
    /// Nothing is written when either the page or `resume` lies outside the
    /// 32-bit range reachable from guest code.
    pub fn build<P>(page: &mut P, native_cs: u16, resume: u64) -> CpuResult<Self>
    where
        P: ThunkBuffer + MemoryProtection + ?Sized,
    {
        let resume32 =
            u32::try_from(resume).map_err(|_| CpuError::AddressRange { address: resume })?;
        let base = page.address();
        let base32 = u32::try_from(base).map_err(|_| CpuError::AddressRange { address: base })?;
        if page.len() < THUNK_SIZE + JMP_TARGET_TAIL {
            return Err(CpuError::Protection(format!(
                "thunk page at {base:#x} holds {} bytes, need {}",
                page.len(),
                THUNK_SIZE + JMP_TARGET_TAIL
            )));
        }

        let code = Self::encode(base32, native_cs, resume32);
        page.write(0, &code)?;
        page.write(THUNK_SIZE, &[0; JMP_TARGET_TAIL])?;
        let previous_protection = page.protect(base, THUNK_SIZE, PageProtection::ExecuteRead)?;
        debug!(
            "transition thunk built at {base32:#x} resume={resume32:#x} cs={native_cs:#x} (was {previous_protection})"
        );

        Ok(Self {
            entry: base32,
            resume: resume32,
            native_cs,
            previous_protection,
        })
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn resume(&self) -> u32 {
        self.resume
    }

    pub fn native_cs(&self) -> u16 {
        self.native_cs
    }

    /// Protection the page had before it was made executable.
    pub fn previous_protection(&self) -> PageProtection {
        self.previous_protection
    }
}

pub fn decode_thunk(bytes: &[u8]) -> Option<ThunkTargets> {
    if bytes.len() < THUNK_SIZE + JMP_TARGET_TAIL
        || bytes[..2] != LCALL
        || bytes[OFFSET_ADD..OFFSET_JMP] != ADD_ESP_8
        || bytes[OFFSET_JMP..OFFSET_JMP_ADDR] != JMP_RIP
    {
        return None;
    }
    let u32_at = |offset: usize| {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };
    let mut target = [0u8; 8];
    target.copy_from_slice(&bytes[OFFSET_JMP_ADDR..OFFSET_JMP_ADDR + 8]);
    Some(ThunkTargets {
        far_pointer: u32_at(2),
        continue_at: u32_at(OFFSET_LCALL_ADDR),
        native_cs: u16::from_le_bytes([bytes[OFFSET_CS], bytes[OFFSET_CS + 1]]),
        resume: u64::from_le_bytes(target),
    })
}

/// Checks that a decoded thunk based at `base` is self-consistent: the far
/// pointer points into the thunk and continues at the stack fixup.
pub fn thunk_is_self_consistent(targets: &ThunkTargets, base: u32) -> bool {
    targets.far_pointer == base.wrapping_add(OFFSET_LCALL_ADDR as u32)
        && targets.continue_at == base.wrapping_add(OFFSET_ADD as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimPage;

    #[test]
    fn encode_matches_reference_bytes() {
        let code = TransitionThunk::encode(0x0010_0000, 0x33, 0x0060_1230);
        assert_eq!(
            code,
            [
                0xff, 0x1d, 0x06, 0x00, 0x10, 0x00, // call far [0x100006]
                0x0c, 0x00, 0x10, 0x00, 0x33, 0x00, // 0033:0010000c
                0x83, 0xc4, 0x08, // add esp, 8
                0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp [rip+0]
                0x30, 0x12, 0x60, 0x00, // resume
            ]
        );
    }

    #[test]
    fn build_writes_thunk_and_seals_page() {
        let mut page = SimPage::new(0x0010_0000);
        let thunk =
            TransitionThunk::build(&mut page, 0x33, 0x0060_1230).expect("thunk should build");
        assert_eq!(thunk.entry(), 0x0010_0000);
        assert_eq!(thunk.previous_protection(), PageProtection::ReadWrite);
        assert_eq!(page.protection(), PageProtection::ExecuteRead);

        let targets = decode_thunk(page.bytes()).expect("page should hold a thunk");
        assert!(thunk_is_self_consistent(&targets, thunk.entry()));
        assert_eq!(targets.native_cs, 0x33);
        assert_eq!(targets.resume, 0x0060_1230);

        let err = page.write(0, &[0x90]).expect_err("sealed page must refuse writes");
        assert!(matches!(err, CpuError::Protection(_)));
    }

    #[test]
    fn build_rejects_resume_above_4g_without_writing() {
        let mut page = SimPage::new(0x0010_0000);
        let err = TransitionThunk::build(&mut page, 0x33, 0x1_0000_0000)
            .expect_err("resume above 4G should fail");
        assert!(matches!(
            err,
            CpuError::AddressRange {
                address: 0x1_0000_0000
            }
        ));
        assert!(page.is_untouched());
    }

    #[test]
    fn build_rejects_page_above_4g() {
        let mut page = SimPage::new(0x7fff_0000_0000);
        let err = TransitionThunk::build(&mut page, 0x33, 0x0060_1230)
            .expect_err("page above 4G should fail");
        assert!(matches!(err, CpuError::AddressRange { .. }));
        assert!(page.is_untouched());
    }

    #[test]
    fn decode_rejects_foreign_bytes() {
        assert!(decode_thunk(&[0u8; THUNK_PAGE_SIZE]).is_none());
        assert!(decode_thunk(&[0xff, 0x1d]).is_none());
    }
}
