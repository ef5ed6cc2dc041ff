//! Host configuration: batch sizes, progress polling and sandbox limits.

use std::time::Duration;

use crate::script_log::DEFAULT_MAX_OUTPUT_ENTRIES;

/// Default number of pages rendered per image-export batch.
pub const IMAGE_BATCH_SIZE: u32 = 16;
/// Default number of frames rendered per movie-export batch.
pub const MOVIE_BATCH_SIZE: u32 = 8;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Limits applied to the embedded engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    /// 0 means unlimited.
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_output_entries: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_call_levels: 64,
            max_expr_depth: 64,
            max_operations: 0,
            max_string_size: 1_000_000,
            max_array_size: 100_000,
            max_map_size: 10_000,
            max_output_entries: DEFAULT_MAX_OUTPUT_ENTRIES,
        }
    }
}

impl EngineLimits {
    pub fn apply(&self, engine: &mut rhai::Engine) {
        engine.set_max_expr_depths(self.max_expr_depth, self.max_expr_depth);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_operations(self.max_operations);
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub image_batch_size: u32,
    pub movie_batch_size: u32,
    pub poll_interval: Duration,
    pub limits: EngineLimits,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            image_batch_size: IMAGE_BATCH_SIZE,
            movie_batch_size: MOVIE_BATCH_SIZE,
            poll_interval: POLL_INTERVAL,
            limits: EngineLimits::default(),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.image_batch_size == 0 || self.movie_batch_size == 0 {
            return Err("Batch sizes must be positive".to_string());
        }
        Ok(())
    }
}
