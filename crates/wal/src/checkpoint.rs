//! Checkpoint content preparation. Building the bytes of a checkpoint record
//! is pure computation over already-held state (the admit-locked stream
//! table, and a best-effort snapshot of a stream's ASN index); no I/O runs
//! here, so a prepared checkpoint can always be thrown away without a
//! physical side effect.

use durlog_common::{GeometryConfig, LogId, LogSignature, RecordType, StreamId, StreamType, NULL_LSN};

use crate::format::{
    AsnMappingEntry, LsnIndexEntry, PhysicalCheckpointMetadata, RecordHeader,
    StreamCheckpointMetadata, StreamTableEntry, RECORD_FIXED_PREFIX_SIZE,
};
use crate::log::AdmitState;
use crate::stream::StreamMeta;

pub struct PreparedCheckpoint {
    pub header: RecordHeader,
    pub metadata: Vec<u8>,
    /// Total on-disk size: `this_header_size` (header+metadata, block
    /// aligned) since checkpoint records carry no payload.
    pub total_size: u64,
}

fn make_header(
    geometry: &GeometryConfig,
    log_id: LogId,
    log_signature: LogSignature,
    stream_id: StreamId,
    stream_type: StreamType,
    record_type: RecordType,
    metadata: &[u8],
    last_checkpoint_lsn: u64,
    highest_completed_lsn: u64,
) -> (RecordHeader, u64) {
    let this_header_size =
        geometry.round_up_to_block((RECORD_FIXED_PREFIX_SIZE + metadata.len()) as u64);
    let header = RecordHeader {
        lsn: 0,
        highest_completed_lsn,
        last_checkpoint_lsn,
        previous_lsn_in_stream: NULL_LSN,
        log_id,
        log_signature,
        stream_id,
        stream_type,
        this_header_size: this_header_size as u32,
        metadata_size: metadata.len() as u32,
        io_buffer_size: 0,
        record_type,
        truncation_point: 0,
    };
    (header, this_header_size)
}

/// Snapshot the stream table into a whole-log checkpoint record.
pub fn prepare_physical_checkpoint(
    geometry: &GeometryConfig,
    log_id: LogId,
    log_signature: LogSignature,
    admit: &AdmitState,
    highest_completed_lsn: u64,
) -> PreparedCheckpoint {
    let streams = admit
        .streams
        .iter()
        .flatten()
        .map(|s| StreamTableEntry {
            stream_id: s.id,
            stream_type: s.stream_type,
            lowest_lsn: s.lowest,
            highest_lsn: s.highest,
            next_lsn: s.next,
        })
        .collect();
    let metadata = PhysicalCheckpointMetadata { streams }.encode();
    let cp_stream = admit
        .stream(admit.cp_stream_index)
        .expect("checkpoint stream slot always populated");
    let (header, size) = make_header(
        geometry,
        log_id,
        log_signature,
        cp_stream.id,
        cp_stream.stream_type,
        RecordType::PhysicalCheckpoint,
        &metadata,
        admit.last_whole_log_cp_lsn,
        highest_completed_lsn,
    );
    PreparedCheckpoint {
        header,
        metadata,
        total_size: size,
    }
}

/// Snapshot a stream's ASN and LSN indices into one or more stream-checkpoint
/// segments, each bounded by `geometry.max_metadata_size`. The ASN index is
/// read via a non-blocking `try_lock`: by the time admission reaches
/// checkpoint preparation, stage 2 (which holds the lock only briefly) has
/// already released it for this write, and holding two distinct async
/// mutexes here would otherwise invert the lock order used elsewhere.
pub fn prepare_stream_checkpoint(
    geometry: &GeometryConfig,
    log_id: LogId,
    log_signature: LogSignature,
    stream: &StreamMeta,
    highest_completed_lsn: u64,
) -> Vec<PreparedCheckpoint> {
    let asn_entries: Vec<AsnMappingEntry> = match stream.asn_index.try_lock() {
        Ok(idx) => idx
            .iter()
            .map(|(asn, e)| AsnMappingEntry {
                asn: *asn,
                version: e.version,
                disposition: e.disposition,
                lsn: e.lsn,
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    let lsn_entries: Vec<LsnIndexEntry> = stream
        .lsn_index
        .iter()
        .map(|(lsn, info)| LsnIndexEntry {
            lsn: *lsn,
            header_size: info.header_and_metadata_size,
            payload_size: info.payload_size,
        })
        .collect();

    let cap = geometry.max_metadata_size as usize;
    let mut segments = Vec::new();
    let mut asn_chunk = Vec::new();
    let mut lsn_chunk = Vec::new();
    let mut estimate = 8usize;

    let mut asn_iter = asn_entries.into_iter().peekable();
    let mut lsn_iter = lsn_entries.into_iter().peekable();
    while asn_iter.peek().is_some() || lsn_iter.peek().is_some() {
        if let Some(e) = asn_iter.peek() {
            if estimate + 32 <= cap {
                estimate += 32;
                asn_chunk.push(asn_iter.next().unwrap());
                let _ = e;
                continue;
            }
        }
        if let Some(_e) = lsn_iter.peek() {
            if estimate + 16 <= cap {
                estimate += 16;
                lsn_chunk.push(lsn_iter.next().unwrap());
                continue;
            }
        }
        // Neither fits; flush what we have and start a fresh segment.
        segments.push(StreamCheckpointMetadata {
            asn_entries: std::mem::take(&mut asn_chunk),
            lsn_entries: std::mem::take(&mut lsn_chunk),
        });
        estimate = 8;
    }
    if !asn_chunk.is_empty() || !lsn_chunk.is_empty() || segments.is_empty() {
        segments.push(StreamCheckpointMetadata {
            asn_entries: asn_chunk,
            lsn_entries: lsn_chunk,
        });
    }

    segments
        .into_iter()
        .map(|seg| {
            let metadata = seg.encode();
            let (header, size) = make_header(
                geometry,
                log_id,
                log_signature,
                stream.id,
                stream.stream_type,
                RecordType::StreamCheckpointSegment,
                &metadata,
                stream.last_cp_lsn,
                highest_completed_lsn,
            );
            PreparedCheckpoint {
                header,
                metadata,
                total_size: size,
            }
        })
        .collect()
}

/// Upper bound on a whole-log checkpoint's on-disk size for a given
/// geometry: every stream slot present, worst case.
pub fn max_whole_log_checkpoint_size(geometry: &GeometryConfig) -> u64 {
    let metadata_len = 4 + geometry.max_streams as usize * crate::format::STREAM_TABLE_ENTRY_SIZE;
    geometry.round_up_to_block((RECORD_FIXED_PREFIX_SIZE + metadata_len) as u64)
}

/// Upper bound on a single stream-checkpoint segment's on-disk size: exactly
/// the configured single-segment metadata cap, header included.
pub fn max_stream_checkpoint_segment_size(geometry: &GeometryConfig) -> u64 {
    geometry.round_up_to_block((RECORD_FIXED_PREFIX_SIZE + geometry.max_metadata_size as usize) as u64)
}
