//! Generic batching scheduler

mod service;
mod types;

pub use service::{BatchingService, SchedulerConfig};
pub use types::{
    BatchItem, BatchOptions, BatchProcessor, Priority, SchedulerStats, processor,
};
