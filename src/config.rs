//! Allocator debugging configuration.
//!
//! Both knobs trade speed or memory for catching dangling references
//! earlier. They are chosen when an allocator is constructed, so a test
//! binary can exercise every combination side by side.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MAPALLOC_DEBUG_MEMORY_LAYER` | Relocate and poison on every moving reallocation | false |
//! | `MAPALLOC_FORCE_REALLOC` | Relocate the arena buffer on every capacity check | false |
//!
//! # Example
//!
//! ```rust
//! use mapalloc::MemoryConfig;
//!
//! let config = MemoryConfig::new()
//!     .with_debug_memory_layer(true)
//!     .with_force_realloc(true);
//!
//! assert!(config.debug_memory_layer);
//! assert!(config.force_realloc_on_push);
//! ```

use std::env;

/// Byte written over heap regions abandoned by the debug memory layer.
pub const POISON_BYTE: u8 = 0xDD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryConfig {
    /// Every moving reallocation gets a brand new address. The old region is
    /// poisoned: page mappings become inaccessible (and are never returned to
    /// the kernel), heap regions are overwritten with [`POISON_BYTE`].
    pub debug_memory_layer: bool,
    /// The arena moves its buffer on every capacity check, even when the
    /// pending write would fit.
    pub force_realloc_on_push: bool,
}

impl MemoryConfig {
    /// Both debugging aids disabled.
    pub const fn new() -> Self {
        Self {
            debug_memory_layer: false,
            force_realloc_on_push: false,
        }
    }

    pub const fn with_debug_memory_layer(mut self, enabled: bool) -> Self {
        self.debug_memory_layer = enabled;
        self
    }

    pub const fn with_force_realloc(mut self, enabled: bool) -> Self {
        self.force_realloc_on_push = enabled;
        self
    }

    /// Loads the configuration from `MAPALLOC_*` environment variables.
    /// Unset or unparseable variables keep their default value.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("MAPALLOC_DEBUG_MEMORY_LAYER") {
            config.debug_memory_layer = val;
        }

        if let Some(val) = parse_env_bool("MAPALLOC_FORCE_REALLOC") {
            config.force_realloc_on_push = val;
        }

        config
    }
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
