use crate::context::{EFLAGS_AC, EFLAGS_TRAP};
use crate::cpu::{CpuError, CpuResult};

pub const ENV_RESET_EFLAGS_CLEAR: &str = "WOWCPU_RESET_EFLAGS_CLEAR";
pub const ENV_LOG_TRANSITIONS: &str = "WOWCPU_LOG_TRANSITIONS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuConfig {
    /// Flag bits cleared from the guest eflags when resetting to a consistent state.
    pub reset_eflags_clear: u32,
    /// Log every handshake mode change at debug instead of trace level.
    pub log_transitions: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            reset_eflags_clear: EFLAGS_TRAP | EFLAGS_AC,
            log_transitions: false,
        }
    }
}

impl CpuConfig {
    pub fn from_env() -> CpuResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> CpuResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_RESET_EFLAGS_CLEAR) {
            config.reset_eflags_clear = parse_u32(&raw).ok_or_else(|| {
                CpuError::Config(format!(
                    "invalid {ENV_RESET_EFLAGS_CLEAR} value '{raw}', expected hex or decimal u32"
                ))
            })?;
        }
        if let Some(raw) = lookup(ENV_LOG_TRANSITIONS) {
            config.log_transitions = parse_bool(&raw).ok_or_else(|| {
                CpuError::Config(format!(
                    "invalid {ENV_LOG_TRANSITIONS} value '{raw}', expected 1/0/true/false"
                ))
            })?;
        }
        Ok(config)
    }
}

pub fn parse_u32(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        raw.parse::<u32>().ok()
    }
}

pub fn parse_u64(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse::<u64>().ok()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
