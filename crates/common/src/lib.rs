use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod file_device;
pub use file_device::FileBlockDevice;

// ---------------------------------------------------------------------------
// Core identifiers
// ---------------------------------------------------------------------------

/// Engine-assigned sequence number into a log's circular LSN region.
/// Strictly increasing for accepted writes.
pub type Lsn = u64;

/// Caller-chosen sequence number identifying a logical record within a stream.
pub type Asn = u64;

/// Monotonic version attached to an ASN write; a lower version is rejected.
pub type Version = u64;

/// 128-bit log identifier, stamped into every record header.
pub type LogId = u128;

/// 128-bit stream identifier.
pub type StreamId = u128;

/// 128-bit caller-defined stream type tag.
pub type StreamType = u128;

/// 256 bits of salt generated when a log is created; every record carries it
/// so stale bytes from a previous incarnation of the file fail validation.
pub type LogSignature = [u32; 8];

/// Sentinel meaning "no LSN" — used for a stream's first `previousLsn` and
/// for an empty stream's checkpoint pointer.
pub const NULL_LSN: Lsn = u64::MAX;

// ---------------------------------------------------------------------------
// Disposition / record kind
// ---------------------------------------------------------------------------

/// Lifecycle state of an ASN-index entry. Advances `None -> Pending ->
/// Persisted`, never backwards except on a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    None,
    Pending,
    Persisted,
}

/// Tag carried in every record header distinguishing its on-wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum RecordType {
    User = 0,
    StreamCheckpointSegment = 1,
    PhysicalCheckpoint = 2,
}

// ---------------------------------------------------------------------------
// Geometry — the tunables stamped into a master block at log-creation time
// ---------------------------------------------------------------------------

/// Fixed configuration of a log, written into both master blocks at creation
/// and never mutated for the life of the file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub block_size: u32,
    pub max_queued_write_depth: u32,
    pub max_record_size: u32,
    pub max_metadata_size: u32,
    pub max_io_buffer_size: u32,
    pub min_file_size: u64,
    pub min_free_space: u64,
    pub stream_checkpoint_interval: u64,
    pub whole_log_checkpoint_interval: u64,
    pub max_streams: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_queued_write_depth: 1 << 20,
            max_record_size: 1 << 24,
            max_metadata_size: 4096,
            max_io_buffer_size: 1 << 24,
            min_file_size: 16 << 20,
            min_free_space: 1 << 20,
            stream_checkpoint_interval: 4096,
            whole_log_checkpoint_interval: 8192,
            max_streams: 256,
        }
    }
}

impl GeometryConfig {
    /// Round `size` up to the next multiple of `block_size`.
    pub fn round_up_to_block(&self, size: u64) -> u64 {
        let b = self.block_size as u64;
        (size + b - 1) / b * b
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors a caller of the log engine can observe. Most are local failures
/// with no state change; `LogStructureFault` is sticky and fails the log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("version {supplied} is stale; current version is {current}")]
    VersionStale { current: Version, supplied: Version },

    #[error("log is full: need {needed} bytes, have {available} free ({reserved} reserved)")]
    LogFull {
        needed: u64,
        available: u64,
        reserved: u64,
    },

    #[error("reservation too small: declared {declared}, consumed {consumed}")]
    ReserveTooSmall { declared: u64, consumed: u64 },

    #[error("record of {size} bytes exceeds per-record limits")]
    BufferOverflow { size: u64 },

    #[error("quota request of {requested} bytes exceeds max queued write depth {bound}")]
    DeviceConfigurationError { requested: u64, bound: u64 },

    #[error("log structure fault: {0}")]
    LogStructureFault(String),

    #[error("stream is being deleted")]
    DeletePending,

    #[error("not found")]
    NotFound,
}

impl LogError {
    pub fn structure_fault(msg: impl Into<String>) -> Self {
        LogError::LogStructureFault(msg.into())
    }
}

// ---------------------------------------------------------------------------
// Block device contract (external collaborator)
// ---------------------------------------------------------------------------

/// I/O priority for a physical write; background writes may be delayed or
/// coalesced by the device layer, foreground writes should not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePriority {
    Foreground,
    Background,
}

/// A half-open byte range, used both for allocation queries and trim hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

/// Device-level attributes reported by the backing store.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttributes {
    pub device_size: u64,
    pub is_sparse: bool,
}

/// Abstraction over a single fixed-size backing file, addressed by absolute
/// byte offset. The log engine is the only writer; concurrent writes at
/// disjoint offsets are assumed to be safe to run in parallel.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>>;

    /// Read the concatenation of several disjoint ranges as one buffer.
    /// Used by recovery when a scan window straddles the LSN ring.
    async fn read_non_contiguous(&self, ranges: &[ByteRange]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        for r in ranges {
            out.extend(self.read(r.offset, r.len).await?);
        }
        Ok(out)
    }

    async fn write(&self, priority: WritePriority, offset: u64, buf: bytes::Bytes) -> std::io::Result<()>;

    /// Punch a hole over `[from, to)`. No-op on non-sparse files; failures
    /// are expected to be treated as non-fatal by the caller.
    async fn trim(&self, from: u64, to: u64) -> std::io::Result<()>;

    async fn query_allocations(&self, offset: u64, len: u64) -> std::io::Result<Vec<ByteRange>>;

    async fn query_attributes(&self) -> std::io::Result<DeviceAttributes>;

    async fn set_sparse_file(&self, sparse: bool) -> std::io::Result<()>;
}

impl fmt::Display for GeometryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GeometryConfig(block_size={}, max_queued_write_depth={}, max_streams={})",
            self.block_size, self.max_queued_write_depth, self.max_streams
        )
    }
}
