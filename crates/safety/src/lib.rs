use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ALLOW_NON_BLOCK_DEVICE_ENV: &str = "WINSTICK_ALLOW_NON_BLOCK_DEVICE";
pub const SKIP_SIZE_CHECK_ENV: &str = "WINSTICK_SKIP_SIZE_CHECK";

/// Escape hatches for test environments. Both default to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyContext {
    pub allow_non_block_device: bool,
    pub skip_size_check: bool,
}

impl SafetyContext {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            allow_non_block_device: lookup(ALLOW_NON_BLOCK_DEVICE_ENV)
                .is_some_and(|value| is_truthy(&value)),
            skip_size_check: lookup(SKIP_SIZE_CHECK_ENV).is_some_and(|value| is_truthy(&value)),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

/// What preflight learned about the destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFacts {
    pub path: PathBuf,
    pub is_block_device: bool,
    pub is_regular_file: bool,
    pub is_system_disk: bool,
}

pub fn can_target_destination(ctx: &SafetyContext, facts: &DestinationFacts) -> SafetyDecision {
    if facts.is_system_disk {
        return SafetyDecision::Deny(format!(
            "Denied: {} holds the running system",
            facts.path.display()
        ));
    }
    if facts.is_block_device {
        return SafetyDecision::Allow;
    }
    if !ctx.allow_non_block_device {
        return SafetyDecision::Deny(format!(
            "Denied: {} is not a block device (set {}=1 to target a file)",
            facts.path.display(),
            ALLOW_NON_BLOCK_DEVICE_ENV
        ));
    }
    if !facts.is_regular_file {
        return SafetyDecision::Deny(format!(
            "Denied: {} is neither a block device nor a regular file",
            facts.path.display()
        ));
    }
    SafetyDecision::Allow
}

pub fn check_capacity(ctx: &SafetyContext, image_bytes: u64, device_bytes: u64) -> SafetyDecision {
    if ctx.skip_size_check || image_bytes <= device_bytes {
        return SafetyDecision::Allow;
    }
    SafetyDecision::Deny(format!(
        "Denied: image of {} bytes does not fit on a {} byte destination",
        image_bytes, device_bytes
    ))
}
