//! Register-level side of the mode switch.

#[cfg(all(windows, target_arch = "x86_64"))]
mod x86_64_windows;

#[cfg(all(windows, target_arch = "x86_64"))]
pub use x86_64_windows::{simulate, syscall_entry};
