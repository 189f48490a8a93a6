//! A FIFO, non-reentrant byte quantum semaphore bounding total in-flight
//! write bytes across a log. Every writer must acquire bytes before
//! entering the admit queue; it releases what it no longer needs as soon
//! as the true committed size is known, and the remainder on completion.

use std::sync::Arc;

use durlog_common::LogError;
use tokio::sync::Semaphore;

pub struct QuotaGate {
    semaphore: Arc<Semaphore>,
    bound: u64,
}

/// An outstanding grant of `bytes` from a [`QuotaGate`]. The underlying
/// tokio permit is intentionally forgotten on acquire so bytes are only
/// returned to the pool via an explicit `release` call, matching the
/// acquire/release contract rather than drop-based RAII.
pub struct QuotaToken {
    semaphore: Arc<Semaphore>,
    bytes: u64,
}

impl QuotaGate {
    pub fn new(bound: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(bound as usize)),
            bound,
        }
    }

    pub fn bound(&self) -> u64 {
        self.bound
    }

    /// Asynchronously grant `bytes` once available, first-come-first-served.
    pub async fn acquire(&self, bytes: u64) -> Result<QuotaToken, LogError> {
        if bytes > self.bound {
            return Err(LogError::DeviceConfigurationError {
                requested: bytes,
                bound: self.bound,
            });
        }
        // Semaphore::acquire_many takes permits in u32-sized batches; bound
        // is itself enforced above so this never exceeds the pool size.
        let mut remaining = bytes;
        let mut acquired: u64 = 0;
        while remaining > 0 {
            let chunk = remaining.min(u32::MAX as u64) as u32;
            let permit = self
                .semaphore
                .clone()
                .acquire_many_owned(chunk)
                .await
                .expect("quota semaphore never closes");
            permit.forget();
            acquired += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(QuotaToken {
            semaphore: self.semaphore.clone(),
            bytes: acquired,
        })
    }
}

impl QuotaToken {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Return `bytes` to the pool. Panics (a programming error, not a
    /// runtime condition) if asked to release more than is held.
    pub fn release(&mut self, bytes: u64) {
        assert!(bytes <= self.bytes, "releasing more than held");
        self.add_permits(bytes);
        self.bytes -= bytes;
    }

    /// Release everything still held.
    pub fn release_all(mut self) {
        self.add_permits(self.bytes);
        self.bytes = 0;
    }

    fn add_permits(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(u32::MAX as u64) as usize;
            self.semaphore.add_permits(chunk);
            remaining -= chunk as u64;
        }
    }
}

impl Drop for QuotaToken {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.add_permits(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_beyond_bound_fails() {
        let gate = QuotaGate::new(1024);
        let err = gate.acquire(2048).await.unwrap_err();
        assert!(matches!(err, LogError::DeviceConfigurationError { .. }));
    }

    #[tokio::test]
    async fn release_returns_bytes_to_pool() {
        let gate = QuotaGate::new(1024);
        let mut token = gate.acquire(1024).await.unwrap();
        // Pool is fully drained; a second acquire would block, so release
        // part of it first and confirm the remainder is still enforced by
        // trying to acquire exactly what's left.
        token.release(512);
        let second = gate.acquire(512).await.unwrap();
        assert_eq!(second.bytes(), 512);
    }

    #[tokio::test]
    async fn drop_returns_remaining_bytes() {
        let gate = QuotaGate::new(256);
        {
            let _token = gate.acquire(256).await.unwrap();
        }
        let token = gate.acquire(256).await.unwrap();
        assert_eq!(token.bytes(), 256);
    }
}
