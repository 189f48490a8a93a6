//! The `Log`: owns the block device, the stream table, and the admit-lock
//! protected counters. Everything that mutates the stream table or the
//! log-wide LSN/space counters does so while holding `admit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

use durlog_common::{
    BlockDevice, GeometryConfig, LogError, LogId, LogSignature, Lsn, StreamId, StreamType,
    NULL_LSN,
};

use crate::asn_index::{AsnIndex, AsnQueryKind};
use crate::completion::CompletionGate;
use crate::lsn::LsnSpace;
use crate::quota::QuotaGate;
use crate::stream::{StreamMeta, StreamState};

/// The internal stream that carries whole-log checkpoint records. Always
/// lives at arena slot 0, created by `Log::create`/`Log::open` before any
/// user stream.
pub const CHECKPOINT_STREAM_TYPE: StreamType = 0;

/// Everything mutated only under the admit lock: the stream table, free
/// slots, and the log-wide LSN/space counters.
pub struct AdmitState {
    pub streams: Vec<Option<StreamMeta>>,
    pub free_slots: Vec<usize>,
    pub id_index: HashMap<StreamId, usize>,
    pub cp_stream_index: usize,
    pub lowest: Lsn,
    pub next: Lsn,
    pub free: u64,
    pub reserved: u64,
    pub last_whole_log_cp_lsn: Lsn,
}

impl AdmitState {
    pub fn stream_mut(&mut self, index: usize) -> Result<&mut StreamMeta, LogError> {
        self.streams
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .ok_or(LogError::NotFound)
    }

    pub fn stream(&self, index: usize) -> Result<&StreamMeta, LogError> {
        self.streams
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(LogError::NotFound)
    }
}

pub struct Log {
    pub device: Arc<dyn BlockDevice>,
    pub geometry: GeometryConfig,
    pub log_id: LogId,
    pub log_signature: LogSignature,
    pub lsn_space: LsnSpace,
    pub quota: QuotaGate,
    pub completion_gate: CompletionGate,
    pub admit: AsyncMutex<AdmitState>,
    failed: AtomicBool,
    highest_completed_lsn: AtomicU64,
    highest_checkpoint_lsn: AtomicU64,
}

impl Log {
    pub(crate) fn new(
        device: Arc<dyn BlockDevice>,
        geometry: GeometryConfig,
        log_id: LogId,
        log_signature: LogSignature,
        file_size: u64,
        lowest: Lsn,
        next: Lsn,
        highest_completed_lsn: Lsn,
        highest_checkpoint_lsn: Lsn,
        streams: Vec<Option<StreamMeta>>,
        cp_stream_index: usize,
        last_whole_log_cp_lsn: Lsn,
        reserved: u64,
    ) -> Arc<Self> {
        let lsn_space = LsnSpace::new(file_size);
        let mut id_index = HashMap::new();
        let mut free_slots = Vec::new();
        for (i, slot) in streams.iter().enumerate() {
            match slot {
                Some(meta) => {
                    id_index.insert(meta.id, i);
                }
                None => free_slots.push(i),
            }
        }
        let region_size = lsn_space.region_size;
        let used = next.saturating_sub(lowest);
        let free = region_size.saturating_sub(reserved).saturating_sub(used);
        Arc::new(Self {
            device,
            geometry,
            log_id,
            log_signature,
            lsn_space,
            quota: QuotaGate::new(geometry.max_queued_write_depth as u64),
            completion_gate: CompletionGate::new(next),
            admit: AsyncMutex::new(AdmitState {
                streams,
                free_slots,
                id_index,
                cp_stream_index,
                lowest,
                next,
                free,
                reserved,
                last_whole_log_cp_lsn,
            }),
            failed: AtomicBool::new(false),
            highest_completed_lsn: AtomicU64::new(highest_completed_lsn),
            highest_checkpoint_lsn: AtomicU64::new(highest_checkpoint_lsn),
        })
    }

    pub fn query_geometry(&self) -> GeometryConfig {
        self.geometry
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self, reason: &str) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(reason, "log entering failed state");
        }
    }

    pub fn highest_completed_lsn(&self) -> Option<Lsn> {
        let v = self.highest_completed_lsn.load(Ordering::Acquire);
        if v == NULL_LSN {
            None
        } else {
            Some(v)
        }
    }

    pub(crate) fn set_highest_completed_lsn(&self, lsn: Lsn) {
        self.highest_completed_lsn.store(lsn, Ordering::Release);
    }

    pub fn highest_checkpoint_lsn(&self) -> Option<Lsn> {
        let v = self.highest_checkpoint_lsn.load(Ordering::Acquire);
        if v == NULL_LSN {
            None
        } else {
            Some(v)
        }
    }

    pub(crate) fn set_highest_checkpoint_lsn(&self, lsn: Lsn) {
        self.highest_checkpoint_lsn.store(lsn, Ordering::Release);
    }

    /// Open (mount) an existing stream, or create one if `stream_id` is new.
    pub async fn open_or_create_stream(
        self: &Arc<Self>,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> Result<Stream, LogError> {
        let mut admit = self.admit.lock().await;
        if let Some(&idx) = admit.id_index.get(&stream_id) {
            let meta = admit.stream(idx)?;
            if meta.state == StreamState::Deleting {
                return Err(LogError::DeletePending);
            }
            let asn_index = meta.asn_index.clone();
            debug!(stream_id = %stream_id, "opened existing stream");
            return Ok(Stream {
                log: self.clone(),
                index: idx,
                id: stream_id,
                asn_index,
            });
        }
        if admit.streams.len() - admit.free_slots.len() >= self.geometry.max_streams as usize {
            return Err(LogError::LogStructureFault(
                "max stream count exceeded".into(),
            ));
        }
        let meta = StreamMeta::new(stream_id, stream_type, false);
        let asn_index = meta.asn_index.clone();
        let index = match admit.free_slots.pop() {
            Some(i) => {
                admit.streams[i] = Some(meta);
                i
            }
            None => {
                admit.streams.push(Some(meta));
                admit.streams.len() - 1
            }
        };
        admit.id_index.insert(stream_id, index);
        debug!(stream_id = %stream_id, index, "created new stream");
        Ok(Stream {
            log: self.clone(),
            index,
            id: stream_id,
            asn_index,
        })
    }

    /// Mark a stream deleting and release its arena slot once it is empty.
    /// A non-empty stream is truncated fully (forcing a whole-log checkpoint)
    /// before the slot is released, following the same path as `truncate`
    /// with the caller's "forced" flag set.
    pub async fn delete_stream(self: &Arc<Self>, stream_id: StreamId) -> Result<(), LogError> {
        let index = {
            let mut admit = self.admit.lock().await;
            let idx = *admit.id_index.get(&stream_id).ok_or(LogError::NotFound)?;
            admit.stream_mut(idx)?.state = StreamState::Deleting;
            idx
        };
        crate::truncate::truncate_stream(self, index, Lsn::MAX, true).await?;
        let mut admit = self.admit.lock().await;
        admit.id_index.remove(&stream_id);
        admit.streams[index] = None;
        admit.free_slots.push(index);
        Ok(())
    }

    /// Trigger a whole-log checkpoint through the ordinary write pipeline.
    pub async fn force_checkpoint(self: &Arc<Self>) -> Result<(), LogError> {
        crate::pipeline::force_checkpoint(self).await
    }
}

/// A handle to an open stream. Cheap to clone-by-reference via `Arc<Log>`;
/// carries the arena index rather than a back-pointer into the log.
#[derive(Clone)]
pub struct Stream {
    pub log: Arc<Log>,
    pub index: usize,
    pub id: StreamId,
    pub asn_index: Arc<AsyncMutex<AsnIndex>>,
}

impl Stream {
    pub async fn write(
        &self,
        asn: durlog_common::Asn,
        version: durlog_common::Version,
        metadata: Vec<u8>,
        payload: Vec<u8>,
        reservation_to_use: u64,
        priority: durlog_common::WritePriority,
    ) -> Result<Lsn, LogError> {
        crate::pipeline::write_user_record(
            &self.log,
            self.index,
            self.asn_index.clone(),
            asn,
            version,
            metadata,
            payload,
            reservation_to_use,
            priority,
        )
        .await
    }

    pub async fn update_reservation(&self, delta: i64) -> Result<(), LogError> {
        crate::pipeline::update_reservation(&self.log, self.index, delta).await
    }

    pub async fn delete_record(
        &self,
        asn: durlog_common::Asn,
        version: durlog_common::Version,
    ) -> Result<(), LogError> {
        let (removed, min_lsn) = {
            let mut idx = self.asn_index.lock().await;
            idx.try_remove_for_delete(asn, version)
        };
        if !removed {
            return Err(LogError::NotFound);
        }
        if let Some(min_lsn) = min_lsn {
            // Removal may have unblocked truncation up to the next-lowest
            // surviving ASN's LSN; let the truncation engine decide.
            let _ = crate::truncate::truncate_stream(&self.log, self.index, min_lsn, false).await;
        }
        Ok(())
    }

    pub async fn truncate(&self, new_truncation: durlog_common::Asn) -> Result<(), LogError> {
        let lsn = {
            let admit = self.log.admit.lock().await;
            let meta = admit.stream(self.index)?;
            meta.highest
        };
        crate::truncate::truncate_stream(&self.log, self.index, lsn.min(new_truncation), false)
            .await
    }

    pub async fn query(
        &self,
        asn: durlog_common::Asn,
        kind: AsnQueryKind,
    ) -> Option<(durlog_common::Asn, crate::asn_index::AsnEntry)> {
        self.asn_index.lock().await.query(asn, kind)
    }

    pub async fn query_range(
        &self,
        low: durlog_common::Asn,
        high: durlog_common::Asn,
    ) -> Vec<(durlog_common::Asn, crate::asn_index::AsnEntry)> {
        self.asn_index.lock().await.range(low, high)
    }
}
