//! Loadable CPU backend: the `BTCpu*` entry points the 32-bit subsystem loader
//! resolves by name. Only meaningful on 64-bit Windows; elsewhere the library
//! is empty.

#[cfg(all(windows, target_arch = "x86_64"))]
mod exports;
