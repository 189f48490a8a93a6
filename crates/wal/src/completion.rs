//! LSN-ordered completion gate: dequeues ops strictly in LSN order so that
//! observers of `highestCompletedLsn` always see a monotonically increasing
//! value, even though the physical writes that produced each LSN may settle
//! out of order.

use tokio::sync::{Mutex as AsyncMutex, Notify};

use durlog_common::Lsn;

pub struct CompletionGate {
    next_expected: AsyncMutex<Lsn>,
    notify: Notify,
}

impl CompletionGate {
    pub fn new(initial_next: Lsn) -> Self {
        Self {
            next_expected: AsyncMutex::new(initial_next),
            notify: Notify::new(),
        }
    }

    /// Block until it is this op's turn, i.e. until every op with a lower
    /// LSN has already advanced the gate. Returns a guard; the caller must
    /// call [`CompletionTurn::advance`] to hand the gate to the next LSN.
    pub async fn wait_turn(&self, lsn: Lsn) -> CompletionTurn<'_> {
        loop {
            {
                let guard = self.next_expected.lock().await;
                if *guard == lsn {
                    drop(guard);
                    return CompletionTurn { gate: self, lsn };
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn current(&self) -> Lsn {
        *self.next_expected.lock().await
    }
}

#[must_use = "a completion turn must be advanced or the gate deadlocks"]
pub struct CompletionTurn<'a> {
    gate: &'a CompletionGate,
    lsn: Lsn,
}

impl<'a> CompletionTurn<'a> {
    /// Hand the gate to `next_lsn` (the LSN immediately past this record).
    pub async fn advance(self, next_lsn: Lsn) {
        let mut guard = self.gate.next_expected.lock().await;
        debug_assert_eq!(*guard, self.lsn);
        *guard = next_lsn;
        drop(guard);
        self.gate.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn completions_observe_strict_lsn_order() {
        let gate = Arc::new(CompletionGate::new(0));
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for lsn in [2u64, 0, 1] {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let turn = gate.wait_turn(lsn).await;
                order.lock().await.push(lsn);
                turn.advance(lsn + 1).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
