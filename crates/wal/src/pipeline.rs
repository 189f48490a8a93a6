//! The seven-stage write pipeline: prepare, ASN update, quota acquire,
//! admit (LSN allocation + checkpoint decision under the exclusive admit
//! lock), parallel physical writes, LSN-ordered completion, user
//! completion.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use durlog_common::{
    Asn, Disposition, LogError, Lsn, RecordType, Version, WritePriority, NULL_LSN,
};

use crate::asn_index::AsnEntry;
use crate::asn_index::AsnIndex;
use crate::checkpoint::{
    max_stream_checkpoint_segment_size, max_whole_log_checkpoint_size, prepare_physical_checkpoint,
    prepare_stream_checkpoint, PreparedCheckpoint,
};
use crate::format::{RecordHeader, UserMetadata, RECORD_FIXED_PREFIX_SIZE};
use crate::log::Log;
use crate::lsn_index::LsnRecordInfo;

struct PreparedWrite {
    header: RecordHeader,
    metadata: Vec<u8>,
    payload: Vec<u8>,
}

pub(crate) fn build_buffer(header: &mut RecordHeader, metadata: &[u8], payload: &[u8], lsn: Lsn) -> Vec<u8> {
    let mut buf = vec![0u8; header.this_header_size as usize + payload.len()];
    header.encode_prefix_pre_admit(&mut buf);
    buf[RECORD_FIXED_PREFIX_SIZE..RECORD_FIXED_PREFIX_SIZE + metadata.len()]
        .copy_from_slice(metadata);
    buf[header.this_header_size as usize..].copy_from_slice(payload);
    header.lsn = lsn;
    header.finalize(&mut buf);
    buf
}

pub(crate) fn schedule_write(
    log: &Arc<Log>,
    priority: WritePriority,
    lsn: Lsn,
    buf: Vec<u8>,
) -> Vec<JoinHandle<std::io::Result<()>>> {
    let total_len = buf.len() as u64;
    let (head, tail) = log.lsn_space.split(lsn, total_len);
    let bytes = Bytes::from(buf);
    let mut handles = Vec::new();
    {
        let device = log.device.clone();
        let head_bytes = bytes.slice(0..head.len as usize);
        let offset = head.offset;
        handles.push(tokio::spawn(async move {
            device.write(priority, offset, head_bytes).await
        }));
    }
    if let Some(tail) = tail {
        let device = log.device.clone();
        let tail_bytes = bytes.slice(head.len as usize..(head.len + tail.len) as usize);
        let offset = tail.offset;
        handles.push(tokio::spawn(async move {
            device.write(priority, offset, tail_bytes).await
        }));
    }
    handles
}

async fn join_all(handles: Vec<JoinHandle<std::io::Result<()>>>) -> Result<(), LogError> {
    for h in handles {
        h.await
            .map_err(|e| LogError::structure_fault(format!("write task panicked: {e}")))?
            .map_err(LogError::Io)?;
    }
    Ok(())
}

/// `stage 1`: validate, size, and pre-encode everything that does not
/// depend on the LSN this record will be assigned.
fn prepare_user_record(
    log: &Log,
    stream_id: u128,
    stream_type: u128,
    asn: Asn,
    version: Version,
    metadata: Vec<u8>,
    payload: Vec<u8>,
    truncation_point: Asn,
) -> Result<PreparedWrite, LogError> {
    let user_metadata = UserMetadata {
        asn,
        asn_version: version,
        opaque: metadata,
    }
    .encode();
    if user_metadata.len() > log.geometry.max_metadata_size as usize {
        return Err(LogError::BufferOverflow {
            size: user_metadata.len() as u64,
        });
    }
    if payload.len() > log.geometry.max_io_buffer_size as usize {
        return Err(LogError::BufferOverflow {
            size: payload.len() as u64,
        });
    }
    let this_header_size =
        log.geometry
            .round_up_to_block((RECORD_FIXED_PREFIX_SIZE + user_metadata.len()) as u64);
    let total_size = this_header_size + payload.len() as u64;
    if total_size > log.geometry.max_record_size as u64 {
        return Err(LogError::BufferOverflow { size: total_size });
    }
    let header = RecordHeader {
        lsn: 0,
        highest_completed_lsn: 0,
        last_checkpoint_lsn: NULL_LSN,
        previous_lsn_in_stream: NULL_LSN,
        log_id: log.log_id,
        log_signature: log.log_signature,
        stream_id,
        stream_type,
        this_header_size: this_header_size as u32,
        metadata_size: user_metadata.len() as u32,
        io_buffer_size: payload.len() as u32,
        record_type: RecordType::User,
        truncation_point,
    };
    Ok(PreparedWrite {
        header,
        metadata: user_metadata,
        payload,
    })
}

pub async fn write_user_record(
    log: &Arc<Log>,
    stream_index: usize,
    asn_index: Arc<AsyncMutex<AsnIndex>>,
    asn: Asn,
    version: Version,
    metadata: Vec<u8>,
    payload: Vec<u8>,
    reservation_to_use: u64,
    priority: WritePriority,
) -> Result<Lsn, LogError> {
    if log.is_failed() {
        return Err(LogError::structure_fault("log is in a failed state"));
    }

    // Old writes at or below the stream's truncation point are a no-op.
    let (stream_id, stream_type, truncation_asn) = {
        let admit = log.admit.lock().await;
        let meta = admit.stream(stream_index)?;
        (meta.id, meta.stream_type, meta.truncation_asn)
    };
    if asn <= truncation_asn && truncation_asn != 0 {
        trace!(asn, truncation_asn, "write below truncation point, no-op");
        return Ok(NULL_LSN);
    }

    let mut prepared = prepare_user_record(
        log,
        stream_id,
        stream_type,
        asn,
        version,
        metadata,
        payload,
        truncation_asn,
    )?;
    let total_size = prepared.header.this_header_size as u64 + prepared.payload.len() as u64;

    // Stage 2: ASN index update.
    let prior: Option<AsnEntry> = {
        let mut idx = asn_index.lock().await;
        match idx.add_or_update(asn, version, prepared.payload.len() as u32) {
            Ok(prior) => prior,
            Err(current) => {
                return Err(LogError::VersionStale {
                    current,
                    supplied: version,
                })
            }
        }
    };

    // Stage 3: quota acquire, sized to cover any checkpoint this write might
    // trigger.
    let quota_bound = total_size
        + max_stream_checkpoint_segment_size(&log.geometry)
        + max_whole_log_checkpoint_size(&log.geometry);
    let mut token = match log.quota.acquire(quota_bound).await {
        Ok(t) => t,
        Err(e) => {
            asn_index.lock().await.restore(asn, prior);
            return Err(e);
        }
    };

    // Stage 4: admit.
    let admit_result = admit_and_emit(
        log,
        stream_index,
        &mut prepared,
        total_size,
        reservation_to_use,
        priority,
    )
    .await;

    let (lsn, write_handles, committed_bytes, batch_end, last_lsn) = match admit_result {
        Ok(v) => v,
        Err(e) => {
            asn_index.lock().await.restore(asn, prior);
            token.release_all();
            return Err(e);
        }
    };
    token.release(token.bytes() - committed_bytes);

    // Stage 5: parallel physical writes.
    let write_result = join_all(write_handles).await;
    if let Err(e) = write_result {
        log.mark_failed("physical write failed");
        asn_index
            .lock()
            .await
            .set_disposition(asn, version, Disposition::Pending);
        token.release_all();
        return Err(e);
    }

    // Stage 6: LSN-ordered completion. The gate advances past the whole
    // admitted batch (the record plus any checkpoints bundled into the same
    // admit step) since they share one physical-write join and complete
    // atomically together.
    let turn = log.completion_gate.wait_turn(lsn).await;
    {
        let mut idx = asn_index.lock().await;
        idx.update_lsn_and_disposition(asn, version, Disposition::Persisted, lsn);
    }
    log.set_highest_completed_lsn(last_lsn);
    turn.advance(batch_end).await;

    // Stage 7: user completion.
    token.release_all();
    debug!(asn, lsn, "user record persisted");
    Ok(lsn)
}

/// Stage 4 + the start of stage 5: assign the LSN, decide checkpoints,
/// charge space, stamp and schedule every physical write. Returns the
/// record's LSN, the spawned write handles (record plus any checkpoints),
/// and the number of quota bytes actually committed (so the caller can trim
/// the excess acquired in stage 3).
async fn admit_and_emit(
    log: &Arc<Log>,
    stream_index: usize,
    prepared: &mut PreparedWrite,
    total_size: u64,
    reservation_to_use: u64,
    priority: WritePriority,
) -> Result<(Lsn, Vec<JoinHandle<std::io::Result<()>>>, u64, Lsn, Lsn), LogError> {
    let mut admit = log.admit.lock().await;
    if log.is_failed() {
        return Err(LogError::structure_fault("log is in a failed state"));
    }

    let lsn = admit.next;
    let last_whole_log_cp_lsn = admit.last_whole_log_cp_lsn;
    let whole_log_due = last_whole_log_cp_lsn == NULL_LSN
        || lsn.saturating_sub(last_whole_log_cp_lsn) >= log.geometry.whole_log_checkpoint_interval;

    let (stream_prev, stream_last_cp, stream_next_before) = {
        let meta = admit.stream_mut(stream_index)?;
        (meta.highest, meta.last_cp_lsn, meta.next)
    };
    let stream_due = stream_last_cp == NULL_LSN
        || stream_next_before.saturating_sub(stream_last_cp) >= log.geometry.stream_checkpoint_interval;

    let completed_as_of_admission = log.highest_completed_lsn().unwrap_or(NULL_LSN);
    let whole_log_cp = if whole_log_due {
        Some(prepare_physical_checkpoint(
            &log.geometry,
            log.log_id,
            log.log_signature,
            &admit,
            completed_as_of_admission,
        ))
    } else {
        None
    };
    let stream_cps: Vec<PreparedCheckpoint> = if stream_due {
        let meta = admit.stream(stream_index)?;
        prepare_stream_checkpoint(
            &log.geometry,
            log.log_id,
            log.log_signature,
            meta,
            completed_as_of_admission,
        )
    } else {
        Vec::new()
    };

    let cp_total: u64 = whole_log_cp.as_ref().map(|c| c.total_size).unwrap_or(0)
        + stream_cps.iter().map(|c| c.total_size).sum::<u64>();
    let total_needed = total_size + cp_total;

    if total_needed > admit.free + reservation_to_use {
        let shortfall = total_needed.saturating_sub(admit.free);
        return Err(if reservation_to_use > 0 {
            LogError::ReserveTooSmall {
                declared: reservation_to_use,
                consumed: shortfall,
            }
        } else {
            LogError::LogFull {
                needed: total_needed,
                available: admit.free,
                reserved: admit.reserved,
            }
        });
    }

    let from_reservation = total_needed.saturating_sub(admit.free);
    admit.free -= total_needed - from_reservation;
    admit.reserved = admit.reserved.saturating_sub(from_reservation);

    prepared.header.lsn = lsn;
    prepared.header.highest_completed_lsn = completed_as_of_admission;
    prepared.header.last_checkpoint_lsn = last_whole_log_cp_lsn;
    prepared.header.previous_lsn_in_stream = stream_prev;

    {
        let meta = admit.stream_mut(stream_index)?;
        meta.lsn_index.guarantee_add_two_higher_records();
        meta.lsn_index.add_higher_lsn_record(
            lsn,
            LsnRecordInfo {
                header_and_metadata_size: prepared.header.this_header_size,
                payload_size: prepared.payload.len() as u32,
            },
        );
        if meta.is_empty() {
            meta.lowest = lsn;
        }
        meta.highest = lsn;
        meta.next = lsn + total_size;
        if from_reservation > 0 {
            meta.reservation = meta.reservation.saturating_sub(from_reservation);
        }
    }
    admit.next = lsn + total_size;

    let mut handles = schedule_write(
        log,
        priority,
        lsn,
        build_buffer(
            &mut prepared.header,
            &prepared.metadata,
            &prepared.payload,
            lsn,
        ),
    );

    let mut whole_log_cp_lsn: Option<Lsn> = None;
    if let Some(mut cp) = whole_log_cp {
        let cp_lsn = admit.next;
        whole_log_cp_lsn = Some(cp_lsn);
        let cp_stream_index = admit.cp_stream_index;
        let cp_meta = admit.stream_mut(cp_stream_index)?;
        cp.header.previous_lsn_in_stream = if cp_meta.is_empty() {
            NULL_LSN
        } else {
            cp_meta.highest
        };
        if cp_meta.is_empty() {
            cp_meta.lowest = cp_lsn;
        }
        cp_meta.highest = cp_lsn;
        cp_meta.next = cp_lsn + cp.total_size;
        cp_meta.lsn_index.guarantee_add_two_higher_records();
        cp_meta.lsn_index.add_higher_lsn_record(
            cp_lsn,
            LsnRecordInfo {
                header_and_metadata_size: cp.total_size as u32,
                payload_size: 0,
            },
        );
        admit.next = cp_lsn + cp.total_size;
        admit.last_whole_log_cp_lsn = cp_lsn;
        log.set_highest_checkpoint_lsn(cp_lsn);
        handles.extend(schedule_write(
            log,
            WritePriority::Background,
            cp_lsn,
            build_buffer(&mut cp.header, &cp.metadata, &[], cp_lsn),
        ));
    }

    let mut last_segment_lsn = None;
    for mut seg in stream_cps {
        let seg_lsn = admit.next;
        let meta = admit.stream_mut(stream_index)?;
        seg.header.previous_lsn_in_stream = meta.highest;
        meta.highest = seg_lsn;
        meta.next = seg_lsn + seg.total_size;
        meta.lsn_index.guarantee_add_two_higher_records();
        meta.lsn_index.add_higher_lsn_record(
            seg_lsn,
            LsnRecordInfo {
                header_and_metadata_size: seg.total_size as u32,
                payload_size: 0,
            },
        );
        admit.next = seg_lsn + seg.total_size;
        last_segment_lsn = Some(seg_lsn);
        handles.extend(schedule_write(
            log,
            WritePriority::Background,
            seg_lsn,
            build_buffer(&mut seg.header, &seg.metadata, &[], seg_lsn),
        ));
    }
    if let Some(last) = last_segment_lsn {
        admit.stream_mut(stream_index)?.last_cp_lsn = last;
    }

    let batch_end = admit.next;
    let last_lsn = last_segment_lsn.or(whole_log_cp_lsn).unwrap_or(lsn);
    Ok((lsn, handles, total_needed, batch_end, last_lsn))
}

pub async fn update_reservation(log: &Arc<Log>, stream_index: usize, delta: i64) -> Result<(), LogError> {
    let mut admit = log.admit.lock().await;
    if delta >= 0 {
        let delta = delta as u64;
        if admit.free < delta + log.geometry.min_free_space {
            return Err(LogError::LogFull {
                needed: delta,
                available: admit.free,
                reserved: admit.reserved,
            });
        }
        admit.free -= delta;
        admit.reserved += delta;
        admit.stream_mut(stream_index)?.reservation += delta;
    } else {
        let delta = (-delta) as u64;
        let meta = admit.stream_mut(stream_index)?;
        if meta.reservation < delta {
            return Err(LogError::ReserveTooSmall {
                declared: delta,
                consumed: meta.reservation,
            });
        }
        meta.reservation -= delta;
        admit.reserved = admit.reserved.saturating_sub(delta);
        admit.free += delta;
    }
    Ok(())
}

pub async fn force_checkpoint(log: &Arc<Log>) -> Result<(), LogError> {
    if log.is_failed() {
        return Err(LogError::structure_fault("log is in a failed state"));
    }
    let token_bound = max_whole_log_checkpoint_size(&log.geometry);
    let mut token = log.quota.acquire(token_bound).await?;

    let (lsn, handles, committed) = {
        let mut admit = log.admit.lock().await;
        if log.is_failed() {
            return Err(LogError::structure_fault("log is in a failed state"));
        }
        let mut cp = prepare_physical_checkpoint(
            &log.geometry,
            log.log_id,
            log.log_signature,
            &admit,
            log.highest_completed_lsn().unwrap_or(NULL_LSN),
        );
        if cp.total_size > admit.free {
            return Err(LogError::LogFull {
                needed: cp.total_size,
                available: admit.free,
                reserved: admit.reserved,
            });
        }
        let lsn = admit.next;
        admit.free -= cp.total_size;
        let cp_stream_index = admit.cp_stream_index;
        let cp_meta = admit.stream_mut(cp_stream_index)?;
        cp.header.previous_lsn_in_stream = if cp_meta.is_empty() {
            NULL_LSN
        } else {
            cp_meta.highest
        };
        if cp_meta.is_empty() {
            cp_meta.lowest = lsn;
        }
        cp_meta.highest = lsn;
        cp_meta.next = lsn + cp.total_size;
        cp_meta.lsn_index.guarantee_add_two_higher_records();
        cp_meta.lsn_index.add_higher_lsn_record(
            lsn,
            LsnRecordInfo {
                header_and_metadata_size: cp.total_size as u32,
                payload_size: 0,
            },
        );
        admit.next = lsn + cp.total_size;
        admit.last_whole_log_cp_lsn = lsn;
        log.set_highest_checkpoint_lsn(lsn);
        let handles = schedule_write(
            log,
            WritePriority::Foreground,
            lsn,
            build_buffer(&mut cp.header, &cp.metadata, &[], lsn),
        );
        (lsn, handles, cp.total_size)
    };
    token.release(token.bytes() - committed);

    if let Err(e) = join_all(handles).await {
        log.mark_failed("forced checkpoint write failed");
        token.release_all();
        return Err(e);
    }

    let turn = log.completion_gate.wait_turn(lsn).await;
    log.set_highest_completed_lsn(lsn);
    turn.advance(lsn + committed).await;
    token.release_all();
    Ok(())
}
