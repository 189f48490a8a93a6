//! In-memory stream descriptor. Streams are referred to by arena index plus
//! id (rather than a shared pointer with a weak back-reference to the log)
//! so write ops can hold a cheap `(index, id)` pair instead of a cycle.

use std::sync::Arc;

use durlog_common::{Asn, Lsn, StreamId, StreamType, NULL_LSN};
use tokio::sync::Mutex as AsyncMutex;

use crate::asn_index::AsnIndex;
use crate::lsn_index::LsnIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Deleting,
}

/// Everything about a stream that is mutated only under the log's admit
/// lock, plus a separately-lockable ASN index (mutated in pipeline stage 2
/// and stage 6, neither of which holds the admit lock).
pub struct StreamMeta {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub lowest: Lsn,
    pub highest: Lsn,
    pub next: Lsn,
    pub last_cp_lsn: Lsn,
    pub truncation_asn: Asn,
    pub reservation: u64,
    pub lsn_index: LsnIndex,
    pub asn_index: Arc<AsyncMutex<AsnIndex>>,
    pub state: StreamState,
    pub truncation_running: bool,
    pub truncation_rerun_requested: bool,
    pub is_checkpoint_stream: bool,
}

impl StreamMeta {
    pub fn new(id: StreamId, stream_type: StreamType, is_checkpoint_stream: bool) -> Self {
        Self {
            id,
            stream_type,
            lowest: NULL_LSN,
            highest: NULL_LSN,
            next: 0,
            last_cp_lsn: NULL_LSN,
            truncation_asn: 0,
            reservation: 0,
            lsn_index: LsnIndex::new(),
            asn_index: Arc::new(AsyncMutex::new(AsnIndex::new())),
            state: StreamState::Open,
            truncation_running: false,
            truncation_rerun_requested: false,
            is_checkpoint_stream,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lowest == NULL_LSN && self.highest == NULL_LSN
    }

    /// Mark the stream empty, pointing all three watermarks at `next`.
    pub fn mark_empty_at(&mut self, next: Lsn) {
        self.lowest = next;
        self.highest = next;
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stream_is_empty() {
        let meta = StreamMeta::new(1, 0, false);
        assert!(meta.is_empty());
        assert_eq!(meta.next, 0);
        assert_eq!(meta.truncation_asn, 0);
    }

    #[test]
    fn mark_empty_at_moves_all_watermarks_together() {
        let mut meta = StreamMeta::new(1, 0, false);
        meta.lowest = 10;
        meta.highest = 40;
        meta.next = 50;
        meta.mark_empty_at(50);
        assert!(meta.is_empty());
        assert_eq!(meta.lowest, 50);
        assert_eq!(meta.highest, 50);
    }
}
