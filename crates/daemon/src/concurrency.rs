//! Concurrency planning module
//!
//! Derives the worker pool size from configuration and CPU core count.

use crate::config::Config;

/// Upper bound for an auto-derived pool; conversions shell out to
/// CPU-heavy renderers.
const MAX_AUTO_WORKERS: usize = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: usize,
    /// Number of files converted in parallel
    pub max_concurrent_files: usize,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the explicit `max_concurrent_files` when non-zero; otherwise half
    /// the logical cores, clamped to `[1, 4]`.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get())
    }

    fn derive_with_cores(cfg: &Config, total_cores: usize) -> Self {
        let max_concurrent_files = if cfg.queue.max_concurrent_files > 0 {
            cfg.queue.max_concurrent_files as usize
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_files,
        }
    }
}

fn derive_workers(cores: usize) -> usize {
    (cores / 2).clamp(1, MAX_AUTO_WORKERS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
