//! Minimal demo: create a log in a scratch file, open a stream, write one
//! record, and read it back by ASN.

use std::sync::Arc;

use durlog_common::{AsnQueryKind, FileBlockDevice, GeometryConfig, WritePriority};
use durlog_wal::recovery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("demo.log");
    let geometry = GeometryConfig::default();
    let device = Arc::new(FileBlockDevice::create(&path, geometry.min_file_size)?);

    let log = recovery::create(device, geometry, 1).await?;
    let stream = log.open_or_create_stream(42, 0).await?;
    let lsn = stream
        .write(
            1,
            1,
            b"demo-metadata".to_vec(),
            b"demo-payload".to_vec(),
            0,
            WritePriority::Foreground,
        )
        .await?;
    tracing::info!(lsn, "wrote record");

    let (asn, entry) = stream
        .query(1, AsnQueryKind::Exact)
        .await
        .expect("just-written record should be queryable");
    tracing::info!(asn, lsn = entry.lsn, "read record back");

    Ok(())
}
