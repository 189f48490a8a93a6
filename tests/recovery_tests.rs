mod common;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use common::{create_device, reopen_device, tiny_file_size, tiny_geometry};
use durlog_common::{AsnQueryKind, WritePriority};
use durlog_wal::lsn::LsnSpace;
use durlog_wal::recovery;

const LOG_ID: u128 = 7;
const STREAM_ID: u128 = 55;

#[tokio::test]
async fn data_persists_across_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.log");

    {
        let device = create_device(&path, tiny_file_size());
        let log = recovery::create(device, tiny_geometry(), LOG_ID).await.unwrap();
        let stream = log.open_or_create_stream(STREAM_ID, 0).await.unwrap();
        stream
            .write(1, 3, b"meta".to_vec(), b"hello".to_vec(), 0, WritePriority::Foreground)
            .await
            .unwrap();
        // `log` (and with it every Arc<dyn BlockDevice> clone) drops here,
        // closing the file the way a process exit would.
    }

    let device = reopen_device(&path);
    let log = recovery::open(device, LOG_ID).await.unwrap();
    let stream = log.open_or_create_stream(STREAM_ID, 0).await.unwrap();
    let (asn, entry) = stream
        .query(1, AsnQueryKind::Exact)
        .await
        .expect("written record must survive reopen");
    assert_eq!(asn, 1);
    assert_eq!(entry.version, 3);
    assert_eq!(entry.disposition, durlog_common::Disposition::Persisted);
}

#[tokio::test]
async fn reopen_rejects_mismatched_log_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrong_id.log");

    {
        let device = create_device(&path, tiny_file_size());
        recovery::create(device, tiny_geometry(), LOG_ID).await.unwrap();
    }

    let device = reopen_device(&path);
    let err = recovery::open(device, LOG_ID + 1).await.unwrap_err();
    match err {
        durlog_common::LogError::LogStructureFault(_) => {}
        other => panic!("expected a structure fault for mismatched log id, got {other:?}"),
    }
}

/// Simulates a crash that tore the last physical write. A record's own
/// completion is only provable on disk via the `highestCompletedLsn` field
/// of whatever record got admitted right after it, so losing the tail
/// record also strips recovery's only evidence that its predecessor ever
/// reached the completion gate: both must be discarded, not just the torn
/// one, even though the predecessor's own bytes are perfectly intact.
#[tokio::test]
async fn recovery_discards_the_unconfirmed_record_behind_a_corrupted_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.log");
    let file_size = tiny_file_size();

    let fourth_lsn = {
        let device = create_device(&path, file_size);
        let log = recovery::create(device, tiny_geometry(), LOG_ID).await.unwrap();
        let stream = log.open_or_create_stream(STREAM_ID, 0).await.unwrap();

        stream
            .write(1, 1, vec![], b"first".to_vec(), 0, WritePriority::Foreground)
            .await
            .unwrap();
        stream
            .write(2, 1, vec![], b"second".to_vec(), 0, WritePriority::Foreground)
            .await
            .unwrap();
        stream
            .write(3, 1, vec![], b"third".to_vec(), 0, WritePriority::Foreground)
            .await
            .unwrap();
        stream
            .write(4, 1, vec![], b"fourth".to_vec(), 0, WritePriority::Foreground)
            .await
            .unwrap()
    };

    // Flip a byte well inside the fourth record's header so its checksum can
    // no longer validate, mimicking a write that was in flight at crash time.
    let lsn_space = LsnSpace::new(file_size);
    let (offset, _) = lsn_space.map(fourth_lsn);
    {
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset + 4)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset + 4)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    }

    let device = reopen_device(&path);
    let log = recovery::open(device, LOG_ID).await.unwrap();
    let stream = log.open_or_create_stream(STREAM_ID, 0).await.unwrap();

    assert!(stream.query(1, AsnQueryKind::Exact).await.is_some());
    assert!(stream.query(2, AsnQueryKind::Exact).await.is_some());
    assert!(
        stream.query(3, AsnQueryKind::Exact).await.is_none(),
        "the record right behind the torn tail has no on-disk proof of its \
         own completion and must not have been replayed"
    );
    assert!(
        stream.query(4, AsnQueryKind::Exact).await.is_none(),
        "the torn record must not have been replayed"
    );
}
