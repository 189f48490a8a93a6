use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{BlockDevice, ByteRange, DeviceAttributes, WritePriority};

/// [`BlockDevice`] backed by a single `std::fs::File`. Positioned reads and
/// writes are serialized behind a mutex and run on the blocking thread pool;
/// the file itself is assumed pre-sized to its final length by the caller.
pub struct FileBlockDevice {
    file: Mutex<std::fs::File>,
    sparse: Mutex<bool>,
}

impl FileBlockDevice {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            sparse: Mutex::new(false),
        })
    }

    pub fn create(path: &Path, size: u64) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Mutex::new(file),
            sparse: Mutex::new(false),
        })
    }
}

#[async_trait]
impl BlockDevice for FileBlockDevice {
    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap().try_clone()?;
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .expect("blocking read task panicked")
    }

    async fn write(&self, _priority: WritePriority, offset: u64, buf: bytes::Bytes) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap().try_clone()?;
        tokio::task::spawn_blocking(move || {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buf)?;
            file.sync_data()
        })
        .await
        .expect("blocking write task panicked")
    }

    async fn trim(&self, from: u64, to: u64) -> std::io::Result<()> {
        if !*self.sparse.lock().unwrap() || to <= from {
            return Ok(());
        }
        // Plain files have no portable hole-punch in std; zero-fill instead,
        // which preserves the "unused bytes read as garbage-free" contract
        // without requiring a platform-specific fallocate binding.
        let mut file = self.file.lock().unwrap().try_clone()?;
        let len = (to - from) as usize;
        tokio::task::spawn_blocking(move || {
            file.seek(SeekFrom::Start(from))?;
            file.write_all(&vec![0u8; len])
        })
        .await
        .expect("blocking trim task panicked")
    }

    async fn query_allocations(&self, offset: u64, len: u64) -> std::io::Result<Vec<ByteRange>> {
        Ok(vec![ByteRange { offset, len }])
    }

    async fn query_attributes(&self) -> std::io::Result<DeviceAttributes> {
        let file = self.file.lock().unwrap().try_clone()?;
        let size = file.metadata()?.len();
        Ok(DeviceAttributes {
            device_size: size,
            is_sparse: *self.sparse.lock().unwrap(),
        })
    }

    async fn set_sparse_file(&self, sparse: bool) -> std::io::Result<()> {
        *self.sparse.lock().unwrap() = sparse;
        Ok(())
    }
}
