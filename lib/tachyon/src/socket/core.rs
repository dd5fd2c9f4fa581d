use crate::engine::{Engine, SocketKey};
use crate::error::{set_last_error, Error, NetResult, SendStatus};
use crate::memory::{MemoryTracker, NO_LIMIT};
use crate::mode::RecvCallback;
use crate::socket::send::{SendRecord, SendSignal};
use mio::Ready;
use quark::logging;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};

const TOKEN_UNSET: usize = usize::max_value();

/// Per-socket knobs taken from the instance profile.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Size of the single pre-allocated receive buffer (one TCP chunk / one datagram).
    pub recv_buffer_size: usize,
    /// Ceiling over bytes held by queued asynchronous sends.
    pub send_memory_limit: usize,
    /// Consecutive receive failures tolerated before the socket is reported fatal. Only
    /// meaningful for datagram sockets; stream receives are fatal on first failure.
    pub max_recv_failures: usize,
    /// OS-level Nagle toggle (stream sockets).
    pub nagle: bool,
    /// Enables the half-close sequence on shutdown (stream sockets).
    pub graceful_disconnect: bool,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            recv_buffer_size: 65536,
            send_memory_limit: NO_LIMIT,
            max_recv_failures: 10,
            nagle: true,
            graceful_disconnect: true,
        }
    }
}

/// Machinery shared by both socket specializations: engine registration state, the receive
/// buffer, the pending-send set with its accountant, and the close/error flags workers set for
/// the owning instance to poll.
pub struct SocketCore {
    engine: std::sync::Arc<Engine>,
    token: AtomicUsize,
    interest: Mutex<Ready>,

    pending: Mutex<VecDeque<SendRecord>>,
    send_tracker: MemoryTracker,

    recv_buffer: Mutex<Vec<u8>>,
    recv_gate: Mutex<bool>,
    recv_done: Condvar,
    recv_failures: AtomicUsize,

    close_requested: AtomicBool,
    closed: AtomicBool,

    recv_fn: RwLock<Option<RecvCallback>>,

    config: SocketConfig,
    log: logging::Logger,
}

impl SocketCore {
    pub fn new(engine: std::sync::Arc<Engine>, config: SocketConfig, log: logging::Logger) -> SocketCore {
        SocketCore {
            engine,
            token: AtomicUsize::new(TOKEN_UNSET),
            interest: Mutex::new(Ready::empty()),
            pending: Mutex::new(VecDeque::new()),
            send_tracker: MemoryTracker::bounded(config.send_memory_limit),
            recv_buffer: Mutex::new(vec![0u8; config.recv_buffer_size]),
            recv_gate: Mutex::new(false),
            recv_done: Condvar::new(),
            recv_failures: AtomicUsize::new(0),
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_fn: RwLock::new(None),
            config,
            log,
        }
    }

    #[inline]
    pub fn engine(&self) -> &std::sync::Arc<Engine> {
        &self.engine
    }

    #[inline]
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }

    /// Registers the handle with the engine. Must be called exactly once before any IO is armed.
    pub fn associate<E: mio::Evented>(&self, handle: &E, key: SocketKey) -> NetResult<()> {
        let token = self.engine.associate(handle, key)?;
        self.token.store(token, Ordering::Release);
        Ok(())
    }

    /// Adds interest bits and re-arms the oneshot registration.
    pub fn arm<E: mio::Evented>(&self, handle: &E, bits: Ready) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut interest = self.lock_interest();
        *interest |= bits;
        self.engine.rearm(handle, self.token(), *interest)
    }

    /// Drops interest bits and re-arms with whatever remains.
    pub fn disarm<E: mio::Evented>(&self, handle: &E, bits: Ready) -> NetResult<()> {
        let mut interest = self.lock_interest();
        *interest = *interest - bits;
        self.engine.rearm(handle, self.token(), *interest)
    }

    /// Re-arms the oneshot registration with the current interest set. Workers call this after
    /// draining an event, which is what keeps the socket's single receive in flight.
    pub fn rearm<E: mio::Evented>(&self, handle: &E) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let interest = self.lock_interest();
        self.engine.rearm(handle, self.token(), *interest)
    }

    /// Submits one composite buffer. A synchronous write is attempted first when nothing is
    /// queued; the remainder becomes a pending record charged against the send accountant.
    ///
    /// With `block` set the call waits on the record's signal up to `timeout_ms` and reports
    /// `FailedKill` on expiry so the caller can disconnect the entity.
    pub fn submit_send<E, W>(
        &self,
        handle: &E,
        mut record: SendRecord,
        block: bool,
        timeout_ms: u64,
        mut write: W,
    ) -> NetResult<SendStatus>
    where
        E: mio::Evented,
        W: FnMut(&[u8], Option<crate::address::Address>) -> io::Result<usize>,
    {
        if self.closed.load(Ordering::Acquire) || self.close_requested.load(Ordering::Acquire) {
            return Ok(SendStatus::Failed);
        }

        let mut pending = self.lock_pending();

        // Direct path: nothing queued ahead of this record.
        if pending.is_empty() {
            loop {
                if record.is_complete() {
                    return Ok(SendStatus::Completed);
                }

                match write(record.remaining(), record.target) {
                    Ok(0) => {
                        set_last_error(&Error::Io(io::ErrorKind::WriteZero));
                        return Ok(SendStatus::FailedKill);
                    }
                    Ok(count) => {
                        record.advance(count);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let error = Error::from(err);
                        set_last_error(&error);
                        logging::warn!(self.log, "synchronous send failed";
                                       "context" => "send", "error" => ?error);
                        return Ok(SendStatus::FailedKill);
                    }
                }
            }
        }

        // Queue the remainder; the accountant rejects the record before anything is enqueued.
        let outstanding = record.remaining().len();
        self.send_tracker.increase(outstanding)?;
        record.set_charged(outstanding);

        let signal = if block {
            let signal = SendSignal::new();
            record.signal = Some(signal.clone());
            Some(signal)
        } else {
            None
        };

        pending.push_back(record);
        drop(pending);

        if let Err(err) = self.arm(handle, Ready::writable()) {
            set_last_error(&err);
            return Ok(SendStatus::FailedKill);
        }

        match signal {
            Some(signal) => Ok(signal.wait(timeout_ms)),
            None => Ok(SendStatus::InProgress),
        }
    }

    /// Flushes the pending send set in FIFO order. Called by workers on send completions.
    pub fn flush_sends<E, W>(&self, handle: &E, mut write: W)
    where
        E: mio::Evented,
        W: FnMut(&[u8], Option<crate::address::Address>) -> io::Result<usize>,
    {
        let mut pending = self.lock_pending();

        while let Some(record) = pending.front_mut() {
            loop {
                if record.is_complete() {
                    break;
                }

                match write(record.remaining(), record.target) {
                    Ok(0) => {
                        set_last_error(&Error::Io(io::ErrorKind::WriteZero));
                        drop(pending);
                        self.fail_pending(SendStatus::FailedKill);
                        self.request_close();
                        return;
                    }
                    Ok(count) => {
                        record.advance(count);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // The kernel is full again; stay armed for another completion.
                        drop(self.arm(handle, Ready::writable()));
                        return;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let error = Error::from(err);
                        set_last_error(&error);
                        logging::warn!(self.log, "queued send failed";
                                       "context" => "send", "error" => ?error);
                        drop(pending);
                        self.fail_pending(SendStatus::FailedKill);
                        self.request_close();
                        return;
                    }
                }
            }

            // Front record finished: release its accounting and wake any blocking sender.
            let record = pending.pop_front().expect("Pending set changed underneath worker");
            self.send_tracker
                .decrease(record.charged())
                .expect("Send accounting underflow");

            if let Some(signal) = record.signal {
                signal.complete(SendStatus::Completed);
            }
        }

        drop(pending);
        drop(self.disarm(handle, Ready::writable()));
    }

    /// Fails every queued record, releasing accounting and waking blocked senders.
    pub fn fail_pending(&self, status: SendStatus) {
        let drained: Vec<SendRecord> = self.lock_pending().drain(..).collect();

        for record in drained {
            self.send_tracker
                .decrease(record.charged())
                .expect("Send accounting underflow");

            if let Some(signal) = record.signal {
                signal.complete(status);
            }
        }
    }

    /// Marks the start of a receive dispatch. Returns false once the socket is closed, in which
    /// case the worker must drop the completion.
    pub fn begin_recv(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut dealing = self.recv_gate.lock().expect("Receive gate poisoned");
        *dealing = true;
        true
    }

    /// Marks the end of a receive dispatch and wakes `close()` if it is waiting.
    pub fn end_recv(&self) {
        let mut dealing = self.recv_gate.lock().expect("Receive gate poisoned");
        *dealing = false;
        self.recv_done.notify_all();
    }

    /// Blocks until no worker is inside the receive path. Serialized inside `close()` so the
    /// receive buffer is never freed underneath a worker.
    pub fn wait_not_receiving(&self) {
        let mut dealing = self.recv_gate.lock().expect("Receive gate poisoned");
        while *dealing {
            dealing = self.recv_done.wait(dealing).expect("Receive gate poisoned");
        }
    }

    /// Shared close path: detaches from the engine, fails queued sends and waits for any
    /// in-flight receive dispatch before the receive buffer is released.
    pub fn close_common<E: mio::Evented>(&self, handle: &E) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.token.load(Ordering::Acquire) != TOKEN_UNSET {
            self.engine.forget(handle, self.token());
        }

        self.fail_pending(SendStatus::Failed);
        self.wait_not_receiving();

        let mut buffer = self.recv_buffer.lock().expect("Receive buffer poisoned");
        buffer.clear();
        buffer.shrink_to_fit();

        logging::debug!(self.log, "socket closed"; "context" => "close");
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set by workers on fatal errors; polled by the owning instance so cleanup happens on the
    /// owning thread.
    #[inline]
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    #[inline]
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    /// Consecutive receive failures observed. Reset on any successful receive.
    #[inline]
    pub fn recv_failures(&self) -> usize {
        self.recv_failures.load(Ordering::Acquire)
    }

    #[inline]
    pub fn note_recv_success(&self) {
        self.recv_failures.store(0, Ordering::Release);
    }

    /// Bumps the failure counter; true once the configured tolerance is exhausted.
    pub fn note_recv_failure(&self) -> bool {
        let failures = self.recv_failures.fetch_add(1, Ordering::AcqRel) + 1;
        failures >= self.config.max_recv_failures
    }

    pub fn set_recv_fn(&self, recv_fn: Option<RecvCallback>) {
        *self.recv_fn.write().expect("Receive callback poisoned") = recv_fn;
    }

    pub fn recv_fn(&self) -> Option<RecvCallback> {
        self.recv_fn.read().expect("Receive callback poisoned").clone()
    }

    #[inline]
    pub fn send_memory_size(&self) -> usize {
        self.send_tracker.used()
    }

    #[inline]
    pub fn send_memory_limit(&self) -> usize {
        self.send_tracker.limit()
    }

    #[inline]
    pub fn pending_sends(&self) -> usize {
        self.lock_pending().len()
    }

    /// The single pre-allocated receive buffer. Locked for the duration of a receive dispatch.
    pub fn lock_recv_buffer(&self) -> MutexGuard<Vec<u8>> {
        self.recv_buffer.lock().expect("Receive buffer poisoned")
    }

    fn token(&self) -> usize {
        let token = self.token.load(Ordering::Acquire);
        assert!(token != TOKEN_UNSET, "Socket used before association");
        token
    }

    fn lock_interest(&self) -> MutexGuard<Ready> {
        self.interest.lock().expect("Interest lock poisoned")
    }

    fn lock_pending(&self) -> MutexGuard<VecDeque<SendRecord>> {
        self.pending.lock().expect("Pending send set poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::packet::Packet;
    use mio::Registration;
    use std::sync::Arc;

    fn test_core(limit: usize) -> (Arc<engine::Engine>, SocketCore, Registration) {
        let eng = engine::Engine::new(1, logging::discard()).unwrap();
        let config = SocketConfig {
            send_memory_limit: limit,
            ..SocketConfig::default()
        };
        let core = SocketCore::new(eng.clone(), config, logging::discard());

        // A Registration stands in for a real socket handle.
        let (registration, _readiness) = Registration::new2();
        let key = SocketKey::new(std::sync::Weak::<DummySocket>::new(), 0, 0);
        core.associate(&registration, key).unwrap();

        (eng, core, registration)
    }

    struct DummySocket;

    impl crate::engine::EngineSocket for DummySocket {
        fn handle_recv_ready(&self, _client_id: usize, _instance_id: usize) {}
        fn handle_send_ready(&self) {}
        fn handle_fatal(&self) {}
    }

    fn record(text: &str) -> SendRecord {
        SendRecord::new(Packet::from_str(text), None)
    }

    #[test]
    fn test_direct_send_completes_without_charge() {
        let (eng, core, registration) = test_core(NO_LIMIT);

        let status = core
            .submit_send(&registration, record("hello"), false, 0, |bytes, _| Ok(bytes.len()))
            .unwrap();

        assert_eq!(status, SendStatus::Completed);
        assert_eq!(core.send_memory_size(), 0);
        assert_eq!(core.pending_sends(), 0);

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_send_memory_limit_rejects_third_send() {
        let (eng, core, registration) = test_core(1024);
        let blocked = |_: &[u8], _: Option<crate::address::Address>| -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        };

        let payload = "x".repeat(400);

        assert_eq!(
            core.submit_send(&registration, record(&payload), false, 0, blocked).unwrap(),
            SendStatus::InProgress
        );
        assert_eq!(
            core.submit_send(&registration, record(&payload), false, 0, blocked).unwrap(),
            SendStatus::InProgress
        );

        let third = core.submit_send(&registration, record(&payload), false, 0, blocked);
        assert_eq!(third.unwrap_err(), Error::MemoryLimitExceeded);

        assert_eq!(core.send_memory_size(), 800);
        assert_eq!(core.pending_sends(), 2);

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_flush_completes_in_fifo_order() {
        let (eng, core, registration) = test_core(NO_LIMIT);
        let blocked = |_: &[u8], _: Option<crate::address::Address>| -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        };

        core.submit_send(&registration, record("first "), false, 0, blocked).unwrap();
        core.submit_send(&registration, record("second"), false, 0, blocked).unwrap();

        let mut flushed = Vec::new();
        core.flush_sends(&registration, |bytes, _| {
            flushed.extend_from_slice(bytes);
            Ok(bytes.len())
        });

        assert_eq!(&flushed[..], b"first second");
        assert_eq!(core.send_memory_size(), 0);
        assert_eq!(core.pending_sends(), 0);

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_partial_direct_write_queues_remainder() {
        let (eng, core, registration) = test_core(NO_LIMIT);

        let mut first = true;
        let status = core
            .submit_send(&registration, record("hello world"), false, 0, |bytes, _| {
                if first {
                    first = false;
                    Ok(bytes.len() - 5)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                }
            })
            .unwrap();

        assert_eq!(status, SendStatus::InProgress);
        assert_eq!(core.send_memory_size(), 5);

        let mut flushed = Vec::new();
        core.flush_sends(&registration, |bytes, _| {
            flushed.extend_from_slice(bytes);
            Ok(bytes.len())
        });
        assert_eq!(&flushed[..], b"world");

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_blocking_send_times_out_with_kill() {
        let (eng, core, registration) = test_core(NO_LIMIT);
        let blocked = |_: &[u8], _: Option<crate::address::Address>| -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        };

        let status = core.submit_send(&registration, record("data"), true, 10, blocked).unwrap();
        assert_eq!(status, SendStatus::FailedKill);

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_fatal_write_error_fails_all_pending() {
        let (eng, core, registration) = test_core(NO_LIMIT);
        let blocked = |_: &[u8], _: Option<crate::address::Address>| -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        };

        core.submit_send(&registration, record("first"), false, 0, blocked).unwrap();
        core.submit_send(&registration, record("second"), false, 0, blocked).unwrap();

        core.flush_sends(&registration, |_, _| Err(io::ErrorKind::BrokenPipe.into()));

        assert!(core.close_requested());
        assert_eq!(core.pending_sends(), 0);
        assert_eq!(core.send_memory_size(), 0);

        eng.shutdown_friendly(true);
    }

    #[test]
    fn test_recv_gate_blocks_close_until_dispatch_ends() {
        let (eng, core, registration) = test_core(NO_LIMIT);
        let core = Arc::new(core);

        assert!(core.begin_recv());

        let closer = {
            let core = core.clone();
            let registration = Arc::new(registration);
            let handle = registration.clone();
            std::thread::spawn(move || {
                core.close_common(&*handle);
            })
        };

        // The closer cannot finish while the gate is held.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!closer.is_finished());

        core.end_recv();
        closer.join().unwrap();
        assert!(core.is_closed());

        eng.shutdown_friendly(true);
    }
}
