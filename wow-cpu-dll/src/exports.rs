use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard, OnceLock};

use cpu::host::windows::NtHost;
use cpu::{CpuConfig, GuestContext, NativeContext, NtStatus, ThreadHandle, Wow64Cpu, status_of};
use tracing::warn;
use windows_sys::Win32::Foundation::{BOOL, HANDLE, HINSTANCE, TRUE};
use windows_sys::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

type NtStatusCode = u32;

/// Layout of `EXCEPTION_POINTERS` with the context typed for this crate.
#[repr(C)]
pub struct ExceptionPointers {
    pub record: *mut c_void,
    pub context: *mut NativeContext,
}

static CPU: OnceLock<Mutex<Wow64Cpu<NtHost>>> = OnceLock::new();

fn backend() -> MutexGuard<'static, Wow64Cpu<NtHost>> {
    CPU.get_or_init(|| {
        let config = CpuConfig::from_env().unwrap_or_else(|err| {
            warn!("ignoring cpu backend environment: {err}");
            CpuConfig::default()
        });
        Mutex::new(Wow64Cpu::with_config(NtHost::new(), config))
    })
    .lock()
    .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[unsafe(no_mangle)]
pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    if reason == DLL_PROCESS_ATTACH {
        unsafe {
            DisableThreadLibraryCalls(module);
        }
    }
    TRUE
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuProcessInit() -> NtStatusCode {
    status_of(&backend().initialize()).0
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuGetBopCode() -> *mut c_void {
    backend().bop_code().unwrap_or(0) as usize as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuSimulate() {
    unsafe { cpu::arch::simulate() }
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuGetContext(
    thread: HANDLE,
    _process: HANDLE,
    _unknown: *mut c_void,
    context: *mut GuestContext,
) -> NtStatusCode {
    let Some(context) = (unsafe { context.as_mut() }) else {
        return NtStatus::INVALID_PARAMETER.0;
    };
    status_of(&backend().get_context(ThreadHandle(thread as isize), context)).0
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuSetContext(
    thread: HANDLE,
    _process: HANDLE,
    _unknown: *mut c_void,
    context: *const GuestContext,
) -> NtStatusCode {
    let Some(context) = (unsafe { context.as_ref() }) else {
        return NtStatus::INVALID_PARAMETER.0;
    };
    status_of(&backend().set_context(ThreadHandle(thread as isize), context)).0
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuResetToConsistentState(
    pointers: *mut ExceptionPointers,
) -> NtStatusCode {
    let pointers = unsafe { pointers.as_ref() };
    let Some(context) = pointers.and_then(|ptrs| unsafe { ptrs.context.as_mut() }) else {
        return NtStatus::INVALID_PARAMETER.0;
    };
    status_of(&backend().reset_to_consistent_state(context)).0
}

#[unsafe(no_mangle)]
pub extern "system" fn BTCpuTurboThunkControl(enable: u32) -> NtStatusCode {
    status_of(&backend().turbo_thunk_control(enable != 0)).0
}
