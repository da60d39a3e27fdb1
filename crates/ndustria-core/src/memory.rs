//! Heap accounting for memcheck runs
//!
//! Figures come from the `stats_alloc` instrumented system allocator.
//! Install it in the pipeline binary to get real numbers:
//!
//! ```ignore
//! use std::alloc::System;
//! use stats_alloc::StatsAlloc;
//!
//! #[global_allocator]
//! static GLOBAL: &StatsAlloc<System> = &ndustria_core::memory::INSTRUMENTED_SYSTEM;
//! ```
//!
//! Without it every sample reads zero.

use std::alloc::System;

use serde::{Deserialize, Serialize};
use stats_alloc::{Region, Stats};

pub use stats_alloc::INSTRUMENTED_SYSTEM;

/// Whether the instrumented allocator has served any allocation in this process
pub fn is_tracking() -> bool {
    INSTRUMENTED_SYSTEM.stats().allocations > 0
}

/// Live heap bytes
pub fn current() -> usize {
    live(&INSTRUMENTED_SYSTEM.stats())
}

fn live(stats: &Stats) -> usize {
    let net = stats.bytes_allocated as isize - stats.bytes_deallocated as isize
        + stats.bytes_reallocated;
    net.max(0) as usize
}

/// Heap figures around one task execution, in bytes
///
/// `peak` is the initial figure plus everything allocated while the task
/// ran, so it never undershoots the true high-water mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub initial: usize,
    #[serde(rename = "final")]
    pub final_bytes: usize,
    pub peak: usize,
}

impl MemorySample {
    fn from_change(initial: usize, change: &Stats) -> Self {
        let grown = change.bytes_allocated + change.bytes_reallocated.max(0) as usize;
        let shrunk = change.bytes_deallocated + (-change.bytes_reallocated).max(0) as usize;
        let final_bytes = (initial + grown).saturating_sub(shrunk);
        Self {
            initial,
            final_bytes,
            peak: (initial + grown).max(final_bytes),
        }
    }
}

/// An open measurement started by [`begin_sample`]
pub(crate) struct Sample {
    initial: usize,
    region: Region<'static, System>,
}

pub(crate) fn begin_sample() -> Sample {
    Sample {
        initial: current(),
        region: Region::new(&INSTRUMENTED_SYSTEM),
    }
}

pub(crate) fn end_sample(sample: Sample) -> MemorySample {
    MemorySample::from_change(sample.initial, &sample.region.change())
}
