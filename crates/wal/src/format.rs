//! Fixed binary on-disk layouts: the master block, the generic record
//! header, and the type-specific suffixes for physical and stream
//! checkpoints. All integers are little-endian.

use crc::{Crc, CRC_64_XZ};
use durlog_common::{
    Asn, Disposition, GeometryConfig, LogError, LogId, LogSignature, Lsn, RecordType, StreamId,
    StreamType, Version,
};

/// Physical size of a master block on disk. Fixed independent of the
/// configured `block_size` so the geometry itself can be read out of it.
pub const MASTER_BLOCK_SIZE: usize = 4096;

const LOG_FORMAT_GUID: u128 = 0x4b544c4c_4f47464d_41535445_5242_4c4b;
const FORMAT_MAJOR: u16 = 1;
const FORMAT_MINOR: u16 = 0;

const CREATION_DIR_MAX_CHARS: usize = 128;
const LOG_TYPE_MAX_CHARS: usize = 32;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

pub fn crc64(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

// ---------------------------------------------------------------------------
// Master block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MasterBlock {
    pub major_format_version: u16,
    pub minor_format_version: u16,
    pub log_id: LogId,
    pub log_file_size: u64,
    pub master_block_location: u64,
    pub log_signature: LogSignature,
    pub geometry: GeometryConfig,
    pub creation_directory: Option<String>,
    pub log_type: Option<String>,
}

impl MasterBlock {
    pub fn new(
        log_id: LogId,
        log_file_size: u64,
        location: u64,
        signature: LogSignature,
        geometry: GeometryConfig,
    ) -> Self {
        Self {
            major_format_version: FORMAT_MAJOR,
            minor_format_version: FORMAT_MINOR,
            log_id,
            log_file_size,
            master_block_location: location,
            log_signature: signature,
            geometry,
            creation_directory: None,
            log_type: None,
        }
    }

    pub fn encode(&self) -> [u8; MASTER_BLOCK_SIZE] {
        let mut buf = [0u8; MASTER_BLOCK_SIZE];
        // checksum field (0..8) is filled last.
        buf[8..10].copy_from_slice(&self.major_format_version.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor_format_version.to_le_bytes());
        // 12..16 reserved
        buf[16..32].copy_from_slice(&LOG_FORMAT_GUID.to_le_bytes());
        buf[32..48].copy_from_slice(&self.log_id.to_le_bytes());
        buf[48..56].copy_from_slice(&self.log_file_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.master_block_location.to_le_bytes());
        // 64..68 creation flags, unused
        let mut off = 68;
        for word in &self.log_signature {
            buf[off..off + 4].copy_from_slice(&word.to_le_bytes());
            off += 4;
        }
        off += encode_geometry(&self.geometry, &mut buf[off..]);
        off += encode_utf16_field(
            self.creation_directory.as_deref().unwrap_or(""),
            CREATION_DIR_MAX_CHARS,
            &mut buf[off..],
        );
        encode_utf16_field(
            self.log_type.as_deref().unwrap_or(""),
            LOG_TYPE_MAX_CHARS,
            &mut buf[off..],
        );

        let checksum = crc64(&buf[8..]);
        buf[0..8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decode and validate a master block read from `location`. `expected_id`
    /// and `expected_signature` are `None` when validating the leading block
    /// (nothing to cross-check yet); the trailing block is cross-checked
    /// against the leading block's signature when that one validated.
    pub fn decode_and_validate(
        raw: &[u8],
        location: u64,
        expected_id: Option<LogId>,
        expected_signature: Option<LogSignature>,
    ) -> Result<Self, LogError> {
        if raw.len() < MASTER_BLOCK_SIZE {
            return Err(LogError::structure_fault("master block short read"));
        }
        let stored_checksum = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let computed = crc64(&raw[8..MASTER_BLOCK_SIZE]);
        if stored_checksum != computed {
            return Err(LogError::structure_fault("master block checksum mismatch"));
        }
        let major = u16::from_le_bytes(raw[8..10].try_into().unwrap());
        let minor = u16::from_le_bytes(raw[10..12].try_into().unwrap());
        let guid = u128::from_le_bytes(raw[16..32].try_into().unwrap());
        if guid != LOG_FORMAT_GUID {
            return Err(LogError::structure_fault("master block format guid mismatch"));
        }
        let log_id = u128::from_le_bytes(raw[32..48].try_into().unwrap());
        let log_file_size = u64::from_le_bytes(raw[48..56].try_into().unwrap());
        let master_block_location = u64::from_le_bytes(raw[56..64].try_into().unwrap());
        if master_block_location != location {
            return Err(LogError::structure_fault("master block location mismatch"));
        }
        if let Some(expected) = expected_id {
            if expected != log_id {
                return Err(LogError::structure_fault("master block log id mismatch"));
            }
        }
        let mut log_signature = [0u32; 8];
        let mut off = 68;
        for word in log_signature.iter_mut() {
            *word = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
            off += 4;
        }
        if let Some(expected) = expected_signature {
            if expected != log_signature {
                return Err(LogError::structure_fault("master block signature mismatch"));
            }
        }
        let (geometry, consumed) = decode_geometry(&raw[off..])?;
        off += consumed;
        let (creation_directory, consumed) =
            decode_utf16_field(&raw[off..], CREATION_DIR_MAX_CHARS);
        off += consumed;
        let (log_type, _) = decode_utf16_field(&raw[off..], LOG_TYPE_MAX_CHARS);

        Ok(Self {
            major_format_version: major,
            minor_format_version: minor,
            log_id,
            log_file_size,
            master_block_location,
            log_signature,
            geometry,
            creation_directory,
            log_type,
        })
    }
}

fn encode_geometry(g: &GeometryConfig, out: &mut [u8]) -> usize {
    out[0..4].copy_from_slice(&g.block_size.to_le_bytes());
    out[4..8].copy_from_slice(&g.max_queued_write_depth.to_le_bytes());
    out[8..12].copy_from_slice(&g.max_record_size.to_le_bytes());
    out[12..16].copy_from_slice(&g.max_metadata_size.to_le_bytes());
    out[16..20].copy_from_slice(&g.max_io_buffer_size.to_le_bytes());
    out[20..28].copy_from_slice(&g.min_file_size.to_le_bytes());
    out[28..36].copy_from_slice(&g.min_free_space.to_le_bytes());
    out[36..44].copy_from_slice(&g.stream_checkpoint_interval.to_le_bytes());
    out[44..52].copy_from_slice(&g.whole_log_checkpoint_interval.to_le_bytes());
    out[52..56].copy_from_slice(&g.max_streams.to_le_bytes());
    56
}

fn decode_geometry(raw: &[u8]) -> Result<(GeometryConfig, usize), LogError> {
    if raw.len() < 56 {
        return Err(LogError::structure_fault("geometry short read"));
    }
    let g = GeometryConfig {
        block_size: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        max_queued_write_depth: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        max_record_size: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
        max_metadata_size: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        max_io_buffer_size: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
        min_file_size: u64::from_le_bytes(raw[20..28].try_into().unwrap()),
        min_free_space: u64::from_le_bytes(raw[28..36].try_into().unwrap()),
        stream_checkpoint_interval: u64::from_le_bytes(raw[36..44].try_into().unwrap()),
        whole_log_checkpoint_interval: u64::from_le_bytes(raw[44..52].try_into().unwrap()),
        max_streams: u32::from_le_bytes(raw[52..56].try_into().unwrap()),
    };
    Ok((g, 56))
}

fn encode_utf16_field(s: &str, max_chars: usize, out: &mut [u8]) -> usize {
    let bytes_len = max_chars * 2;
    for (i, unit) in s.encode_utf16().take(max_chars).enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    bytes_len
}

fn decode_utf16_field(raw: &[u8], max_chars: usize) -> (Option<String>, usize) {
    let bytes_len = max_chars * 2;
    let units: Vec<u16> = raw[..bytes_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    let s = String::from_utf16_lossy(&units);
    (if s.is_empty() { None } else { Some(s) }, bytes_len)
}

// ---------------------------------------------------------------------------
// Record header
// ---------------------------------------------------------------------------

/// Fixed prefix common to every record, before its type-specific suffix.
pub const RECORD_FIXED_PREFIX_SIZE: usize = 144;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub highest_completed_lsn: Lsn,
    pub last_checkpoint_lsn: Lsn,
    pub previous_lsn_in_stream: Lsn,
    pub log_id: LogId,
    pub log_signature: LogSignature,
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub this_header_size: u32,
    pub metadata_size: u32,
    pub io_buffer_size: u32,
    pub record_type: RecordType,
    pub truncation_point: Asn,
}

// Byte layout of the fixed prefix (little-endian):
//   0..8    thisBlockChecksum   — the single on-disk checksum (see below)
//   8..16   lsn
//   16..24  highestCompletedLsn
//   24..32  lastCheckPointLsn
//   32..40  previousLsnInStream      <- LsnChksumBlock ends here (40 bytes)
//   40..56  logId
//   56..88  logSignature (8 x u32)
//   88..104 logStreamId
//   104..120 logStreamType
//   120..124 thisHeaderSize
//   124..128 metaDataSize
//   128..132 ioBufferSize
//   132..136 recordType
//   136..144 truncationPoint
//
// Checksumming: CRC1 covers bytes [40..thisHeaderSize) — the header tail,
// type-specific metadata, and any trailing pad, none of which depend on the
// LSN this record will be assigned. CRC2 folds CRC1 into the LSN block
// itself (bytes 8..40) and is the only value actually stored on disk, at
// offset 0. This lets the admit stage stamp bytes 8..40 after CRC1 has
// already been computed once, without needing a separate on-disk field for
// CRC1.

impl RecordHeader {
    /// Encode everything except the LSN block (left zeroed) and the final
    /// checksum. Safe to call before LSN allocation.
    pub fn encode_prefix_pre_admit(&self, buf: &mut [u8]) {
        encode_non_lsn_fields(self, buf);
    }

    /// Compute CRC1 over the header tail + metadata (+ any trailing pad
    /// already written into `buf[40..this_header_size]`).
    fn crc1(buf: &[u8], this_header_size: usize) -> u64 {
        crc64(&buf[40..this_header_size])
    }

    /// Stamp the LSN block and compute+store the final checksum. Must run
    /// after the header tail, metadata, and pad are already in `buf`.
    pub fn finalize(&self, buf: &mut [u8]) {
        let this_header_size = self.this_header_size as usize;
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.highest_completed_lsn.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        buf[32..40].copy_from_slice(&self.previous_lsn_in_stream.to_le_bytes());
        let crc1 = Self::crc1(buf, this_header_size);
        let mut fold_input = [0u8; 40];
        fold_input[0..32].copy_from_slice(&buf[8..40]);
        fold_input[32..40].copy_from_slice(&crc1.to_le_bytes());
        let checksum = crc64(&fold_input);
        buf[0..8].copy_from_slice(&checksum.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), LogError> {
        if buf.len() < RECORD_FIXED_PREFIX_SIZE {
            return Err(LogError::structure_fault("record header short read"));
        }
        let lsn = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let highest_completed_lsn = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let last_checkpoint_lsn = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let previous_lsn_in_stream = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let log_id = u128::from_le_bytes(buf[40..56].try_into().unwrap());
        let mut log_signature = [0u32; 8];
        let mut off = 56;
        for w in log_signature.iter_mut() {
            *w = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let stream_id = u128::from_le_bytes(buf[off..off + 16].try_into().unwrap());
        off += 16;
        let stream_type = u128::from_le_bytes(buf[off..off + 16].try_into().unwrap());
        off += 16;
        let this_header_size = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let metadata_size = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let io_buffer_size = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let record_type_raw = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let truncation_point = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let record_type = match record_type_raw {
            0 => RecordType::User,
            1 => RecordType::StreamCheckpointSegment,
            2 => RecordType::PhysicalCheckpoint,
            _ => return Err(LogError::structure_fault("unknown record type tag")),
        };
        Ok((
            Self {
                lsn,
                highest_completed_lsn,
                last_checkpoint_lsn,
                previous_lsn_in_stream,
                log_id,
                log_signature,
                stream_id,
                stream_type,
                this_header_size,
                metadata_size,
                io_buffer_size,
                record_type,
                truncation_point,
            },
            off,
        ))
    }

    /// Recompute CRC1 from `buf[40..this_header_size]` and fold it against
    /// the LSN block to check the single stored checksum. `buf` must hold
    /// at least `this_header_size` bytes of the record starting at its LSN
    /// offset 0 (i.e. the full header+metadata region, pad included).
    pub fn verify_checksum(buf: &[u8], this_header_size: usize) -> bool {
        if buf.len() < this_header_size || this_header_size < RECORD_FIXED_PREFIX_SIZE {
            return false;
        }
        let stored = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let crc1 = Self::crc1(buf, this_header_size);
        let mut fold_input = [0u8; 40];
        fold_input[0..32].copy_from_slice(&buf[8..40]);
        fold_input[32..40].copy_from_slice(&crc1.to_le_bytes());
        crc64(&fold_input) == stored
    }
}

fn encode_non_lsn_fields(h: &RecordHeader, buf: &mut [u8]) {
    buf[40..56].copy_from_slice(&h.log_id.to_le_bytes());
    let mut off = 56;
    for w in &h.log_signature {
        buf[off..off + 4].copy_from_slice(&w.to_le_bytes());
        off += 4;
    }
    buf[off..off + 16].copy_from_slice(&h.stream_id.to_le_bytes());
    off += 16;
    buf[off..off + 16].copy_from_slice(&h.stream_type.to_le_bytes());
    off += 16;
    buf[off..off + 4].copy_from_slice(&h.this_header_size.to_le_bytes());
    off += 4;
    buf[off..off + 4].copy_from_slice(&h.metadata_size.to_le_bytes());
    off += 4;
    buf[off..off + 4].copy_from_slice(&h.io_buffer_size.to_le_bytes());
    off += 4;
    buf[off..off + 4].copy_from_slice(&(h.record_type as u32).to_le_bytes());
    off += 4;
    buf[off..off + 8].copy_from_slice(&h.truncation_point.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Type-specific suffixes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserMetadata {
    pub asn: Asn,
    pub asn_version: Version,
    pub opaque: Vec<u8>,
}

impl UserMetadata {
    pub const FIXED_SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + self.opaque.len());
        buf.extend_from_slice(&self.asn.to_le_bytes());
        buf.extend_from_slice(&self.asn_version.to_le_bytes());
        buf.extend_from_slice(&self.opaque);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(LogError::structure_fault("user metadata short read"));
        }
        Ok(Self {
            asn: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            asn_version: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            opaque: buf[16..].to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamTableEntry {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub lowest_lsn: Lsn,
    pub highest_lsn: Lsn,
    pub next_lsn: Lsn,
}

pub const STREAM_TABLE_ENTRY_SIZE: usize = 16 + 16 + 8 + 8 + 8;

impl StreamTableEntry {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&self.stream_type.to_le_bytes());
        out.extend_from_slice(&self.lowest_lsn.to_le_bytes());
        out.extend_from_slice(&self.highest_lsn.to_le_bytes());
        out.extend_from_slice(&self.next_lsn.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            stream_id: u128::from_le_bytes(buf[0..16].try_into().unwrap()),
            stream_type: u128::from_le_bytes(buf[16..32].try_into().unwrap()),
            lowest_lsn: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            highest_lsn: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            next_lsn: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhysicalCheckpointMetadata {
    pub streams: Vec<StreamTableEntry>,
}

impl PhysicalCheckpointMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.streams.len() * STREAM_TABLE_ENTRY_SIZE);
        buf.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        for s in &self.streams {
            s.encode(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < 4 {
            return Err(LogError::structure_fault("physical checkpoint short read"));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut streams = Vec::with_capacity(count);
        let mut off = 4;
        for _ in 0..count {
            if buf.len() < off + STREAM_TABLE_ENTRY_SIZE {
                return Err(LogError::structure_fault("physical checkpoint truncated"));
            }
            streams.push(StreamTableEntry::decode(&buf[off..off + STREAM_TABLE_ENTRY_SIZE]));
            off += STREAM_TABLE_ENTRY_SIZE;
        }
        Ok(Self { streams })
    }
}

#[derive(Debug, Clone)]
pub struct AsnMappingEntry {
    pub asn: Asn,
    pub version: Version,
    pub disposition: Disposition,
    pub lsn: Lsn,
}

pub const ASN_MAPPING_ENTRY_SIZE: usize = 8 + 8 + 1 + 7 + 8;

#[derive(Debug, Clone)]
pub struct LsnIndexEntry {
    pub lsn: Lsn,
    pub header_size: u32,
    pub payload_size: u32,
}

pub const LSN_INDEX_ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct StreamCheckpointMetadata {
    pub asn_entries: Vec<AsnMappingEntry>,
    pub lsn_entries: Vec<LsnIndexEntry>,
}

impl StreamCheckpointMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            8 + self.asn_entries.len() * ASN_MAPPING_ENTRY_SIZE
                + self.lsn_entries.len() * LSN_INDEX_ENTRY_SIZE,
        );
        buf.extend_from_slice(&(self.asn_entries.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.lsn_entries.len() as u32).to_le_bytes());
        for e in &self.asn_entries {
            buf.extend_from_slice(&e.asn.to_le_bytes());
            buf.extend_from_slice(&e.version.to_le_bytes());
            let disp = match e.disposition {
                Disposition::None => 0u8,
                Disposition::Pending => 1u8,
                Disposition::Persisted => 2u8,
            };
            buf.push(disp);
            buf.extend_from_slice(&[0u8; 7]);
            buf.extend_from_slice(&e.lsn.to_le_bytes());
        }
        for e in &self.lsn_entries {
            buf.extend_from_slice(&e.lsn.to_le_bytes());
            buf.extend_from_slice(&e.header_size.to_le_bytes());
            buf.extend_from_slice(&e.payload_size.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < 8 {
            return Err(LogError::structure_fault("stream checkpoint short read"));
        }
        let n_asn = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let n_lsn = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let mut off = 8;
        let mut asn_entries = Vec::with_capacity(n_asn);
        for _ in 0..n_asn {
            if buf.len() < off + ASN_MAPPING_ENTRY_SIZE {
                return Err(LogError::structure_fault("stream checkpoint asn entries truncated"));
            }
            let asn = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            let version = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
            let disposition = match buf[off + 16] {
                0 => Disposition::None,
                1 => Disposition::Pending,
                _ => Disposition::Persisted,
            };
            let lsn = u64::from_le_bytes(buf[off + 24..off + 32].try_into().unwrap());
            asn_entries.push(AsnMappingEntry { asn, version, disposition, lsn });
            off += ASN_MAPPING_ENTRY_SIZE;
        }
        let mut lsn_entries = Vec::with_capacity(n_lsn);
        for _ in 0..n_lsn {
            if buf.len() < off + LSN_INDEX_ENTRY_SIZE {
                return Err(LogError::structure_fault("stream checkpoint lsn entries truncated"));
            }
            let lsn = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            let header_size = u32::from_le_bytes(buf[off + 8..off + 12].try_into().unwrap());
            let payload_size = u32::from_le_bytes(buf[off + 12..off + 16].try_into().unwrap());
            lsn_entries.push(LsnIndexEntry { lsn, header_size, payload_size });
            off += LSN_INDEX_ENTRY_SIZE;
        }
        Ok(Self { asn_entries, lsn_entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durlog_common::GeometryConfig;

    #[test]
    fn master_block_round_trips() {
        let geometry = GeometryConfig::default();
        let mb = MasterBlock::new(42, 16 << 20, 0, [1, 2, 3, 4, 5, 6, 7, 8], geometry);
        let encoded = mb.encode();
        let decoded = MasterBlock::decode_and_validate(&encoded, 0, Some(42), None).unwrap();
        assert_eq!(decoded.log_id, 42);
        assert_eq!(decoded.log_signature, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoded.geometry.block_size, 4096);
    }

    #[test]
    fn master_block_rejects_bad_checksum() {
        let geometry = GeometryConfig::default();
        let mb = MasterBlock::new(42, 16 << 20, 0, [1, 2, 3, 4, 5, 6, 7, 8], geometry);
        let mut encoded = mb.encode();
        encoded[200] ^= 0xFF;
        assert!(MasterBlock::decode_and_validate(&encoded, 0, Some(42), None).is_err());
    }

    #[test]
    fn record_header_checksum_round_trips() {
        let metadata = UserMetadata {
            asn: 100,
            asn_version: 1,
            opaque: vec![0xAA; 16],
        }
        .encode();
        let header_size = 256usize;
        let mut header = RecordHeader {
            lsn: 0,
            highest_completed_lsn: 0,
            last_checkpoint_lsn: 0,
            previous_lsn_in_stream: durlog_common::NULL_LSN,
            log_id: 1,
            log_signature: [9; 8],
            stream_id: 2,
            stream_type: 3,
            this_header_size: header_size as u32,
            metadata_size: metadata.len() as u32,
            io_buffer_size: 4080,
            record_type: RecordType::User,
            truncation_point: 0,
        };
        let mut buf = vec![0u8; header_size];
        header.encode_prefix_pre_admit(&mut buf);
        buf[RECORD_FIXED_PREFIX_SIZE..RECORD_FIXED_PREFIX_SIZE + metadata.len()]
            .copy_from_slice(&metadata);
        header.lsn = 42;
        header.finalize(&mut buf);
        assert!(RecordHeader::verify_checksum(&buf, header_size));

        // Mutating the metadata after finalize should break the checksum.
        buf[RECORD_FIXED_PREFIX_SIZE] ^= 0xFF;
        assert!(!RecordHeader::verify_checksum(&buf, header_size));
    }

    #[test]
    fn physical_checkpoint_round_trips() {
        let meta = PhysicalCheckpointMetadata {
            streams: vec![StreamTableEntry {
                stream_id: 7,
                stream_type: 1,
                lowest_lsn: 0,
                highest_lsn: 10,
                next_lsn: 11,
            }],
        };
        let encoded = meta.encode();
        let decoded = PhysicalCheckpointMetadata::decode(&encoded).unwrap();
        assert_eq!(decoded.streams.len(), 1);
        assert_eq!(decoded.streams[0].highest_lsn, 10);
    }
}
