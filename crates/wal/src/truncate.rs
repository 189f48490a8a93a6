//! Truncation engine: reclaims LSN space behind a
//! stream's truncation point, forcing a whole-log checkpoint when enough
//! space is freed to be worth the write, and trimming now-unused ranges on
//! sparse files.

use std::sync::Arc;

use tracing::{debug, warn};

use durlog_common::{Asn, LogError, Lsn, NULL_LSN};

use crate::checkpoint::{max_whole_log_checkpoint_size, prepare_physical_checkpoint};
use crate::log::Log;
use crate::lsn_index::LsnRecordInfo;
use crate::stream::StreamState;

/// Run (or queue, if one is already running for this stream) a truncation
/// pass up to `target_lsn` / `truncation_asn`. `forced` bypasses the
/// reclaim-size threshold (used by stream deletion).
pub async fn truncate_stream(
    log: &Arc<Log>,
    stream_index: usize,
    target_lsn: Lsn,
    forced: bool,
) -> Result<(), LogError> {
    truncate_stream_with_asn(log, stream_index, target_lsn, 0, forced).await
}

pub async fn truncate_stream_with_asn(
    log: &Arc<Log>,
    stream_index: usize,
    target_lsn: Lsn,
    truncation_asn: Asn,
    forced: bool,
) -> Result<(), LogError> {
    loop {
        let mut admit = log.admit.lock().await;
        {
            let meta = admit.stream_mut(stream_index)?;
            if meta.truncation_running {
                meta.truncation_rerun_requested = true;
                return Ok(());
            }
            meta.truncation_running = true;
        }

        // Step 1: advance stream.lowest.
        {
            let meta = admit.stream_mut(stream_index)?;
            if !meta.is_empty() {
                meta.lowest = meta.lowest.max(target_lsn).min(meta.next);
                meta.truncation_asn = meta.truncation_asn.max(truncation_asn);
                if meta.lowest > meta.highest {
                    meta.mark_empty_at(meta.next);
                }
                meta.lsn_index.truncate(meta.lowest);
            }
        }

        // Step 2: temporarily park the CP stream's lowest at its highest —
        // its own space will be reclaimed by the forced CP about to be
        // written.
        let cp_stream_index = admit.cp_stream_index;
        let saved_cp_lowest = admit.stream(cp_stream_index)?.lowest;
        let cp_highest = admit.stream(cp_stream_index)?.highest;
        admit.stream_mut(cp_stream_index)?.lowest = cp_highest;

        // Step 3: recompute the log-wide low-water LSN.
        let mut new_lowest = None;
        for slot in admit.streams.iter().flatten() {
            if slot.is_checkpoint_stream || slot.state == StreamState::Deleting {
                continue;
            }
            if slot.is_empty() {
                continue;
            }
            new_lowest = Some(match new_lowest {
                Some(cur) => std::cmp::min(cur, slot.lowest),
                None => slot.lowest,
            });
        }
        let new_lowest = new_lowest.unwrap_or(admit.next);

        let reclaim = new_lowest.saturating_sub(admit.lowest);
        let cp_bound = max_whole_log_checkpoint_size(&log.geometry);

        let write_handles;
        let cp_lsn;
        if forced || reclaim >= cp_bound {
            admit.lowest = new_lowest;
            admit.free += reclaim;
            let mut cp = prepare_physical_checkpoint(
                &log.geometry,
                log.log_id,
                log.log_signature,
                &admit,
                log.highest_completed_lsn().unwrap_or(NULL_LSN),
            );
            if cp.total_size > admit.free {
                // Not enough room even after reclaim; skip the checkpoint
                // this pass, truncation of the index itself still stands.
                admit.stream_mut(cp_stream_index)?.lowest = saved_cp_lowest;
                admit.stream_mut(stream_index)?.truncation_running = false;
                debug!(stream_index, "truncation reclaimed space without a checkpoint");
                drop(admit);
                maybe_rerun(log, stream_index, target_lsn, truncation_asn, forced).await?;
                return Ok(());
            }
            let lsn = admit.next;
            admit.free -= cp.total_size;
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
            cp_lsn = Some(lsn);
            let buf = crate::pipeline::build_buffer(&mut cp.header, &cp.metadata, &[], lsn);
            write_handles = Some(crate::pipeline::schedule_write(
                log,
                durlog_common::WritePriority::Background,
                lsn,
                buf,
            ));
        } else {
            admit.stream_mut(cp_stream_index)?.lowest = saved_cp_lowest;
            write_handles = None;
            cp_lsn = None;
        }

        let trim_ranges = unused_ranges(
            &log.geometry,
            admit.lowest,
            admit.next,
            log.lsn_space.region_size,
            log.geometry.max_queued_write_depth as u64,
        );

        admit.stream_mut(stream_index)?.truncation_running = false;
        drop(admit);

        if let Some(handles) = write_handles {
            for h in handles {
                match h.await {
                    Ok(Ok(())) => {}
                    _ => {
                        log.mark_failed("truncation checkpoint write failed");
                        return Err(LogError::structure_fault("truncation checkpoint write failed"));
                    }
                }
            }
            if let Some(lsn) = cp_lsn {
                log.set_highest_completed_lsn(lsn);
            }
        }

        for (from, to) in trim_ranges {
            if let Err(e) = log.device.trim(from, to).await {
                warn!(error = %e, from, to, "trim hint failed, ignoring");
            }
        }

        return maybe_rerun(log, stream_index, target_lsn, truncation_asn, forced).await;
    }
}

async fn maybe_rerun(
    log: &Arc<Log>,
    stream_index: usize,
    target_lsn: Lsn,
    truncation_asn: Asn,
    forced: bool,
) -> Result<(), LogError> {
    let rerun = {
        let mut admit = log.admit.lock().await;
        let meta = admit.stream_mut(stream_index)?;
        let pending = meta.truncation_rerun_requested;
        meta.truncation_rerun_requested = false;
        pending
    };
    if rerun {
        Box::pin(truncate_stream_with_asn(
            log,
            stream_index,
            target_lsn,
            truncation_asn,
            forced,
        ))
        .await
    } else {
        Ok(())
    }
}

/// Compute the (at most two) now-unused byte ranges behind `lowest`:
/// `lowest` is bumped to a block boundary, the protection
/// window of `quota_bound` bytes nearest `next` is never trimmed, and the
/// remaining region is reported as one or two file-offset ranges depending
/// on whether it straddles the ring boundary.
fn unused_ranges(
    geometry: &durlog_common::GeometryConfig,
    lowest: Lsn,
    next: Lsn,
    region_size: u64,
    quota_bound: u64,
) -> Vec<(u64, u64)> {
    let lowest = geometry.round_up_to_block(lowest);
    if next.saturating_sub(lowest) < quota_bound {
        return Vec::new();
    }
    let lowest = next - quota_bound;
    let lowest = geometry.round_up_to_block(lowest);
    let space = crate::lsn::LsnSpace { region_size };
    let (lowest_off, _) = space.map(lowest);
    let (next_off, _) = space.map(next);
    let master = crate::format::MASTER_BLOCK_SIZE as u64;
    let region_end = master + region_size;

    if lowest_off <= next_off {
        vec![(lowest_off, next_off)]
    } else {
        let mut ranges = Vec::new();
        if next_off > master {
            ranges.push((master, next_off));
        }
        if lowest_off < region_end {
            ranges.push((lowest_off, region_end));
        }
        ranges
    }
}
