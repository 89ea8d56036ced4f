//! Dispatch policy knobs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::Result;

pub const ENV_FORCE_PRECOMPILED: &str = "XATTN_FORCE_PRECOMPILED";
pub const ENV_BLOCKS_PER_SEQUENCE: &str = "XATTN_BLOCKS_PER_SEQUENCE";
pub const ENV_SYNC_AFTER_LAUNCH: &str = "XATTN_SYNC_AFTER_LAUNCH";

/// Tunable policy of the dispatcher.
///
/// None of these affect correctness, only which path is taken and how work is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Use the precompiled kernel whenever one exists, skipping the occupancy gate.
    pub force_precompiled: bool,

    /// Multiplier on the estimated block count before comparing with the SM count.
    pub enable_min_block_factor: f32,

    /// Minimum history tokens one cooperating block should process in multi-block mode.
    pub min_history_tokens_per_block: u32,

    /// Target resident blocks per multiprocessor when splitting a sequence.
    pub target_wave_factor: u32,

    /// Upper bound on blocks per sequence in multi-block mode.
    pub max_blocks_per_sequence: u32,

    /// Fixed blocks per sequence; bypasses the split heuristic.
    pub blocks_per_sequence: Option<u32>,

    /// Kernels declaring at least this much dynamic shared memory get their limit raised at load.
    pub large_smem_threshold: u32,

    /// Block on the stream after every launch (debugging aid).
    pub sync_after_launch: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            force_precompiled: false,
            enable_min_block_factor: 4.0,
            min_history_tokens_per_block: 512,
            target_wave_factor: 8,
            max_blocks_per_sequence: 8,
            blocks_per_sequence: None,
            large_smem_threshold: 46 * 1024,
            sync_after_launch: false,
        }
    }
}

impl DispatchConfig {
    /// Defaults overlaid with the `XATTN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a variable lookup. Unset variables leave fields untouched.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_FORCE_PRECOMPILED) {
            self.force_precompiled = parse_flag(ENV_FORCE_PRECOMPILED, &v)?;
        }
        if let Some(v) = lookup(ENV_BLOCKS_PER_SEQUENCE) {
            let n = v.trim().parse::<u32>().map_err(|_| {
                DispatchError::Config(format!("{} must be a positive integer, got '{}'", ENV_BLOCKS_PER_SEQUENCE, v))
            })?;
            self.blocks_per_sequence = Some(n);
        }
        if let Some(v) = lookup(ENV_SYNC_AFTER_LAUNCH) {
            self.sync_after_launch = parse_flag(ENV_SYNC_AFTER_LAUNCH, &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.enable_min_block_factor > 0.0) {
            return Err(DispatchError::Config(format!(
                "enable_min_block_factor must be positive, got {}",
                self.enable_min_block_factor
            )));
        }
        let positive = [
            ("min_history_tokens_per_block", self.min_history_tokens_per_block),
            ("target_wave_factor", self.target_wave_factor),
            ("max_blocks_per_sequence", self.max_blocks_per_sequence),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DispatchError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.blocks_per_sequence == Some(0) {
            return Err(DispatchError::Config("blocks_per_sequence must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        other => Err(DispatchError::Config(format!("{} must be a boolean, got '{}'", name, other))),
    }
}
