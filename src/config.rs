//! Engine configuration.
//!
//! The engine does not persist configuration itself; values arrive either
//! as typed settings or through a flat key/value view supplied by the host.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default page/buffer size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default advisory cache capacity in buffers.
pub const DEFAULT_SCAVENGE_THRESHOLD: usize = 64;

/// Default device usage lock timeout in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Storage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Size in bytes of every page buffer. Device-wide constant.
    pub page_size: usize,
    /// Cache capacity above which a scavenge pass is triggered. Advisory,
    /// not a hard admission limit.
    pub scavenge_threshold: usize,
    /// Lock timeout applied when no ambient session supplies one.
    pub default_lock_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            scavenge_threshold: DEFAULT_SCAVENGE_THRESHOLD,
            default_lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl StorageSettings {
    /// Builds settings from a flat key/value view. Unknown keys are
    /// ignored; missing or unparseable values fall back to defaults.
    pub fn from_key_values(values: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            page_size: parse_or(values, "storage.page_size", defaults.page_size),
            scavenge_threshold: parse_or(
                values,
                "storage.scavenge_threshold",
                defaults.scavenge_threshold,
            ),
            default_lock_timeout_ms: parse_or(
                values,
                "storage.default_lock_timeout_ms",
                defaults.default_lock_timeout_ms,
            ),
        }
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.default_lock_timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> T {
    values
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
