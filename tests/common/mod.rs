use std::path::Path;
use std::sync::Arc;

use durlog_common::{FileBlockDevice, GeometryConfig};

/// A geometry small enough that a handful of writes fill the ring, so tests
/// can exercise wraparound and `LogFull` without multi-megabyte fixtures.
/// The region (file size minus the two 4 KiB master blocks) is sized to
/// comfortably hold a handful of small records plus the whole-log
/// checkpoint every fresh log bundles into its first write, while still
/// being small enough that a few dozen writes exhaust it.
pub fn tiny_geometry() -> GeometryConfig {
    GeometryConfig {
        block_size: 128,
        max_queued_write_depth: 8192,
        max_record_size: 2048,
        max_metadata_size: 256,
        max_io_buffer_size: 1024,
        min_file_size: 16384,
        min_free_space: 0,
        stream_checkpoint_interval: 1 << 20,
        whole_log_checkpoint_interval: 1 << 20,
        max_streams: 4,
    }
}

pub fn tiny_file_size() -> u64 {
    16384
}

pub fn create_device(path: &Path, size: u64) -> Arc<dyn durlog_common::BlockDevice> {
    Arc::new(FileBlockDevice::create(path, size).expect("create scratch log file"))
}

pub fn reopen_device(path: &Path) -> Arc<dyn durlog_common::BlockDevice> {
    Arc::new(FileBlockDevice::open(path).expect("reopen scratch log file"))
}
