//! Durable, crash-safe, append-only circular log engine.
//!
//! A log is a single fixed-size file split into two master blocks framing a
//! circular LSN region. Streams are independent append-only sequences
//! multiplexed onto that region; each record a stream writes carries both
//! the engine-assigned LSN and the caller's own ASN, so a stream can be
//! queried either by physical position or by application sequence number.
//! Space is reclaimed by truncating each stream's ASN floor and rolling the
//! log-wide low-water mark forward behind the slowest stream.
//!
//! Everything that mutates the stream table or the log-wide LSN/space
//! counters runs under one exclusive admit lock ([`log::AdmitState`]);
//! everything that mutates a single stream's ASN index runs under that
//! stream's own lock instead, never both at once (see `pipeline` for the
//! lock-order discipline this depends on).

pub mod asn_index;
pub mod checkpoint;
pub mod completion;
pub mod format;
pub mod log;
pub mod lsn;
pub mod lsn_index;
pub mod pipeline;
pub mod quota;
pub mod recovery;
pub mod stream;
pub mod truncate;

pub use asn_index::{AsnEntry, AsnIndex, AsnQueryKind};
pub use log::{Log, Stream};
pub use lsn_index::LsnRecordInfo;
pub use recovery::{create, open, CHECKPOINT_STREAM_ID};
pub use stream::{StreamMeta, StreamState};

pub use durlog_common::{
    Asn, BlockDevice, ByteRange, Disposition, DeviceAttributes, GeometryConfig, LogError, LogId,
    LogSignature, Lsn, RecordType, StreamId, StreamType, Version, WritePriority, NULL_LSN,
};
