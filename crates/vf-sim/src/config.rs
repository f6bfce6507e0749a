//! Boot-time configuration record (`spec.md` §6 "CLI/config").
//!
//! This is not a CLI parser -- the core accepts a plain, already-parsed
//! record. Whatever sits above this crate (CLI flags, a config file) is
//! responsible for producing one.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Boot-time configuration for a [`crate::api::SimWorld`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub map_width: i32,
    pub map_height: i32,
    pub viewport_width: i32,
    pub viewport_height: i32,
    pub tick_interval_ms: u32,
    pub ga_path: Option<PathBuf>,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            map_width: 200,
            map_height: 100,
            viewport_width: 80,
            viewport_height: 24,
            tick_interval_ms: 50,
            ga_path: None,
            seed: 0xC0FF_EE00_D15E_A5E5,
        }
    }
}
