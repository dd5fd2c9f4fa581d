use crate::address::Address;
use crate::error::SendStatus;
use crate::packet::Packet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Completion signal a blocking sender waits on until a worker finishes its record.
pub struct SendSignal {
    state: Mutex<Option<SendStatus>>,
    done: Condvar,
}

impl SendSignal {
    pub fn new() -> Arc<SendSignal> {
        Arc::new(SendSignal {
            state: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    /// Marks the record finished and wakes the sender.
    pub fn complete(&self, status: SendStatus) {
        let mut state = self.state.lock().expect("Send signal poisoned");
        *state = Some(status);
        self.done.notify_all();
    }

    /// Waits for completion up to `timeout_ms`. Expiry reports `FailedKill` so the caller can
    /// disconnect the entity.
    pub fn wait(&self, timeout_ms: u64) -> SendStatus {
        let timer = quark::time::Timer::new(timeout_ms);
        let mut state = self.state.lock().expect("Send signal poisoned");

        loop {
            if let Some(status) = *state {
                return status;
            }

            let remaining = timer.remaining();
            if remaining == Duration::from_millis(0) {
                return SendStatus::FailedKill;
            }

            let (guard, _) = self
                .done
                .wait_timeout(state, remaining)
                .expect("Send signal poisoned");
            state = guard;
        }
    }
}

/// One queued asynchronous send: an owned composite buffer plus progress and completion state.
/// The storage is copied from the caller, so reallocation of the original packet cannot
/// invalidate the bytes handed to the kernel.
pub struct SendRecord {
    buffer: Packet,
    offset: usize,
    /// Bytes charged against the socket's send accountant when the record was queued.
    charged: usize,
    /// Datagram destination; `None` sends to the connected remote.
    pub target: Option<Address>,
    pub signal: Option<Arc<SendSignal>>,
}

impl SendRecord {
    pub fn new(buffer: Packet, target: Option<Address>) -> SendRecord {
        SendRecord {
            buffer,
            offset: 0,
            charged: 0,
            target,
            signal: None,
        }
    }

    /// Bytes not yet handed to the kernel.
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..]
    }

    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.offset += count;
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.offset >= self.buffer.used_size()
    }

    #[inline]
    pub fn charged(&self) -> usize {
        self.charged
    }

    #[inline]
    pub fn set_charged(&mut self, charged: usize) {
        self.charged = charged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_record_progress() {
        let mut record = SendRecord::new(Packet::from_str("hello world"), None);

        assert_eq!(record.remaining(), b"hello world");
        assert!(!record.is_complete());

        record.advance(6);
        assert_eq!(record.remaining(), b"world");

        record.advance(5);
        assert!(record.is_complete());
    }

    #[test]
    fn test_signal_timeout_reports_kill() {
        let signal = SendSignal::new();
        assert_eq!(signal.wait(5), SendStatus::FailedKill);
    }

    #[test]
    fn test_signal_completion_wins() {
        let signal = SendSignal::new();

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait(60_000))
        };

        signal.complete(SendStatus::Completed);
        assert_eq!(waiter.join().unwrap(), SendStatus::Completed);
    }
}
