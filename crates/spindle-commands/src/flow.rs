//! Character-counting flow control.
//!
//! Tracks how many bytes sit in the controller's receive buffer (sent but not
//! yet acknowledged) and admits a line only if it still fits.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Ledger snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub capacity: usize,
    pub pending: usize,
    pub peak: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    pending: usize,
    peak: usize,
}

/// Byte ledger for the controller receive buffer.
#[derive(Debug)]
pub struct FlowController {
    capacity: usize,
    ledger: Mutex<Ledger>,
    released: Notify,
}

impl FlowController {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently reserved.
    pub fn pending(&self) -> usize {
        self.ledger.lock().pending
    }

    pub fn stats(&self) -> FlowStats {
        let ledger = self.ledger.lock();
        FlowStats {
            capacity: self.capacity,
            pending: ledger.pending,
            peak: ledger.peak,
        }
    }

    /// Reserve `cost` bytes if they fit.
    pub fn try_reserve(&self, cost: usize) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.pending + cost > self.capacity {
            return false;
        }
        ledger.pending += cost;
        ledger.peak = ledger.peak.max(ledger.pending);
        true
    }

    /// Wait until `cost` bytes fit, then reserve them.
    ///
    /// Never completes for `cost > capacity`; callers reject such lines first.
    pub async fn reserve(&self, cost: usize) {
        loop {
            let released = self.released.notified();
            if self.try_reserve(cost) {
                return;
            }
            released.await;
        }
    }

    /// Return `cost` bytes once their line is acknowledged.
    pub fn release(&self, cost: usize) {
        {
            let mut ledger = self.ledger.lock();
            ledger.pending = ledger.pending.saturating_sub(cost);
        }
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_admission_boundary() {
        let flow = FlowController::new(127);
        assert!(flow.try_reserve(100));
        assert!(flow.try_reserve(27));
        assert!(!flow.try_reserve(1));
        flow.release(100);
        assert!(flow.try_reserve(50));
        assert_eq!(
            flow.stats(),
            FlowStats {
                capacity: 127,
                pending: 77,
                peak: 127
            }
        );
    }

    #[tokio::test]
    async fn test_reserve_waits_for_release() {
        let flow = Arc::new(FlowController::new(10));
        assert!(flow.try_reserve(8));

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.reserve(5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flow.release(8);
        waiter.await.unwrap();
        assert_eq!(flow.pending(), 5);
    }
}
