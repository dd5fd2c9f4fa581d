use crate::error::{set_last_error, Error, NetResult};
use crate::{ClientId, InstanceId};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use quark::logging;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Token reserved for the wakeup registration.
const WAKE_TOKEN: Token = Token(0);

/// How long the dispatcher sleeps in the kernel before rechecking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dispatch surface the workers call into when a completion arrives for a socket.
pub trait EngineSocket: Send + Sync {
    /// A receive completed: drain the ready data and re-arm.
    fn handle_recv_ready(&self, client_id: ClientId, instance_id: InstanceId);

    /// A send completed: flush the pending send set.
    fn handle_send_ready(&self);

    /// A worker hit an unrecoverable failure while dispatching on this socket.
    fn handle_fatal(&self);
}

/// Identifies the socket behind a completion. The socket reference is weak: a completion whose
/// socket has been freed is a spurious late completion and is dropped.
#[derive(Clone)]
pub struct SocketKey {
    pub socket: Weak<dyn EngineSocket>,
    pub instance: InstanceId,
    pub client: ClientId,
}

impl SocketKey {
    pub fn new(socket: Weak<dyn EngineSocket>, instance: InstanceId, client: ClientId) -> SocketKey {
        SocketKey {
            socket,
            instance,
            client,
        }
    }
}

/// Tagged key posted with every completion.
#[derive(Clone)]
pub enum CompletionKey {
    Socket(SocketKey),
    Shutdown,
}

/// One demultiplexed IO completion. Readable readiness marks a receive completion, writable
/// readiness a send completion; both bits may be set at once.
pub struct Completion {
    pub key: CompletionKey,
    pub ready: Ready,
}

/// The completion engine: a fixed pool of worker threads draining per-socket IO completions.
///
/// A dispatcher thread converts kernel readiness events into completion records on a shared
/// queue; workers block on the queue and route each record to the owning socket's receive or
/// send path. Shutdown is ordered: one SHUTDOWN key is posted per worker and the dispatcher
/// observes the running flag.
pub struct Engine {
    poll: Poll,
    queue: Mutex<VecDeque<Completion>>,
    available: Condvar,
    keys: Mutex<HashMap<usize, CompletionKey>>,
    next_token: AtomicUsize,
    wake: SetReadiness,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    log: logging::Logger,
}

impl Engine {
    /// Builds the engine and spawns the dispatcher plus `workers` worker threads (0 selects the
    /// logical core count).
    pub fn new(workers: usize, log: logging::Logger) -> NetResult<Arc<Engine>> {
        let workers = match workers {
            0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };

        let poll = Poll::new()?;
        let (registration, wake) = Registration::new2();

        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let engine = Arc::new(Engine {
            poll,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            keys: Mutex::new(HashMap::new()),
            // Token 0 is the wakeup registration.
            next_token: AtomicUsize::new(1),
            wake,
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            workers,
            log,
        });

        // The wakeup registration moves into the dispatcher so it stays alive for as long as
        // anything can poll it.
        let mut threads = Vec::with_capacity(workers + 1);

        {
            let engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name("engine-dispatch".into())
                    .spawn(move || dispatch_loop(engine, registration))
                    .expect("Dispatcher spawn failed"),
            );
        }

        for id in 0..workers {
            let engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("engine-worker-{}", id))
                    .spawn(move || worker_loop(engine, id))
                    .expect("Worker spawn failed"),
            );
        }

        *engine.threads.lock().expect("Engine thread list poisoned") = threads;

        logging::debug!(engine.log, "completion engine started"; "context" => "engine", "workers" => workers);

        Ok(engine)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Attaches a socket handle and records its completion key. Returns the token under which
    /// readiness events will be reported.
    pub fn associate<E: mio::Evented>(&self, handle: &E, key: SocketKey) -> NetResult<usize> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        self.keys
            .lock()
            .expect("Engine key table poisoned")
            .insert(token, CompletionKey::Socket(key));

        self.poll
            .register(handle, Token(token), Ready::empty(), PollOpt::edge() | PollOpt::oneshot())
            .map_err(|err| {
                self.keys.lock().expect("Engine key table poisoned").remove(&token);
                Error::from(err)
            })?;

        logging::trace!(self.log, "socket associated"; "context" => "engine", "token" => token);

        Ok(token)
    }

    /// Re-arms the interest set for an associated handle. The oneshot registration means every
    /// delivered event disarms the socket until this is called again.
    pub fn rearm<E: mio::Evented>(&self, handle: &E, token: usize, interest: Ready) -> NetResult<()> {
        self.poll
            .reregister(handle, Token(token), interest, PollOpt::edge() | PollOpt::oneshot())
            .map_err(Into::into)
    }

    /// Detaches a socket handle. Late completions for the token are dropped by the dispatcher.
    pub fn forget<E: mio::Evented>(&self, handle: &E, token: usize) {
        self.keys.lock().expect("Engine key table poisoned").remove(&token);

        // The handle may already be closed; deregistration failure is uninteresting.
        drop(self.poll.deregister(handle));
    }

    /// Manually injects a completion.
    pub fn post(&self, key: CompletionKey, ready: Ready) {
        self.push(Completion { key, ready });
    }

    /// Blocks until the next completion is available. Returns SHUTDOWN once the engine stops.
    pub fn get_next(&self) -> Completion {
        let mut queue = self.queue.lock().expect("Engine queue poisoned");

        loop {
            if let Some(completion) = queue.pop_front() {
                return completion;
            }

            if !self.running.load(Ordering::Acquire) {
                return Completion {
                    key: CompletionKey::Shutdown,
                    ready: Ready::empty(),
                };
            }

            queue = self.available.wait(queue).expect("Engine queue poisoned");
        }
    }

    /// Posts one SHUTDOWN key per worker and stops the dispatcher. With `block` set, joins every
    /// engine thread before returning.
    pub fn shutdown_friendly(&self, block: bool) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        logging::debug!(self.log, "completion engine stopping"; "context" => "engine", "block" => block);

        for _ in 0..self.workers {
            self.post(CompletionKey::Shutdown, Ready::empty());
        }

        // Break the dispatcher out of the kernel wait.
        drop(self.wake.set_readiness(Ready::readable()));

        if block {
            let threads: Vec<_> = self
                .threads
                .lock()
                .expect("Engine thread list poisoned")
                .drain(..)
                .collect();

            for handle in threads {
                drop(handle.join());
            }
        }
    }

    fn push(&self, completion: Completion) {
        self.queue
            .lock()
            .expect("Engine queue poisoned")
            .push_back(completion);
        self.available.notify_one();
    }

    fn lookup(&self, token: Token) -> Option<CompletionKey> {
        self.keys
            .lock()
            .expect("Engine key table poisoned")
            .get(&token.0)
            .cloned()
    }
}

fn dispatch_loop(engine: Arc<Engine>, _registration: Registration) {
    let mut events = Events::with_capacity(1024);

    while engine.running.load(Ordering::Acquire) {
        match engine.poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                logging::error!(engine.log, "completion poll failed"; "context" => "engine", "error" => %err);
                set_last_error(&Error::PollFailed);
                break;
            }
        }

        for event in &events {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            if let Some(key) = engine.lookup(event.token()) {
                engine.push(Completion {
                    key,
                    ready: event.readiness(),
                });
            }
        }
    }
}

fn worker_loop(engine: Arc<Engine>, id: usize) {
    loop {
        let completion = engine.get_next();

        let key = match completion.key {
            CompletionKey::Shutdown => {
                logging::trace!(engine.log, "worker shutting down"; "context" => "engine", "worker" => id);
                break;
            }
            CompletionKey::Socket(key) => key,
        };

        // A freed socket means a spurious late completion.
        let socket = match key.socket.upgrade() {
            Some(socket) => socket,
            None => continue,
        };

        // Failures never escape a worker; a panicking dispatch marks the socket fatal and the
        // worker returns to its loop.
        let ready = completion.ready;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if ready.is_readable() {
                socket.handle_recv_ready(key.client, key.instance);
            }
            if ready.is_writable() {
                socket.handle_send_ready();
            }
        }));

        if outcome.is_err() {
            logging::error!(engine.log, "completion dispatch panicked"; "context" => "engine", "worker" => id);
            socket.handle_fatal();
        }
    }
}

lazy_static! {
    static ref ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);
}

/// Starts the process-wide engine with `workers` threads (0 selects the logical core count).
/// Idempotent: a running engine is left untouched.
pub fn start(workers: usize, log: logging::Logger) -> NetResult<()> {
    let mut slot = ENGINE.write().expect("Engine singleton poisoned");

    if slot.is_none() {
        *slot = Some(Engine::new(workers, log)?);
    }

    Ok(())
}

/// The process-wide engine. Fails with `Closed` before `start` or after shutdown.
pub fn get() -> NetResult<Arc<Engine>> {
    ENGINE
        .read()
        .expect("Engine singleton poisoned")
        .clone()
        .ok_or(Error::Closed)
}

/// Stops the process-wide engine, optionally blocking until all threads have exited.
pub fn shutdown_friendly(block: bool) {
    let engine = ENGINE.write().expect("Engine singleton poisoned").take();

    if let Some(engine) = engine {
        engine.shutdown_friendly(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingSocket {
        recvs: AtomicUsize,
        sends: AtomicUsize,
        fatals: AtomicUsize,
        panic_on_recv: bool,
    }

    impl CountingSocket {
        fn new(panic_on_recv: bool) -> Arc<CountingSocket> {
            Arc::new(CountingSocket {
                recvs: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                fatals: AtomicUsize::new(0),
                panic_on_recv,
            })
        }
    }

    impl EngineSocket for CountingSocket {
        fn handle_recv_ready(&self, _client_id: ClientId, _instance_id: InstanceId) {
            if self.panic_on_recv {
                panic!("Dispatch failure");
            }
            self.recvs.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_send_ready(&self) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_fatal(&self) {
            self.fatals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for engine");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn socket_key(socket: &Arc<CountingSocket>) -> SocketKey {
        let as_dyn: Arc<dyn EngineSocket> = socket.clone();
        SocketKey::new(Arc::downgrade(&as_dyn), 1, 2)
    }

    #[test]
    fn test_posted_completions_dispatch() {
        let engine = Engine::new(2, logging::discard()).unwrap();
        let socket = CountingSocket::new(false);
        let as_dyn: Arc<dyn EngineSocket> = socket.clone();
        let key = SocketKey::new(Arc::downgrade(&as_dyn), 0, 0);

        engine.post(CompletionKey::Socket(key.clone()), Ready::readable());
        engine.post(CompletionKey::Socket(key.clone()), Ready::writable());
        engine.post(
            CompletionKey::Socket(key),
            Ready::readable() | Ready::writable(),
        );

        wait_for(|| socket.recvs.load(Ordering::SeqCst) == 2 && socket.sends.load(Ordering::SeqCst) == 2);

        engine.shutdown_friendly(true);
    }

    #[test]
    fn test_spurious_completion_for_dead_socket() {
        let engine = Engine::new(1, logging::discard()).unwrap();

        let key = {
            let socket = CountingSocket::new(false);
            socket_key(&socket)
            // socket dropped here
        };

        engine.post(CompletionKey::Socket(key), Ready::readable());

        // The live socket posted afterwards proves the dead one was skipped without harm.
        let alive = CountingSocket::new(false);
        engine.post(CompletionKey::Socket(socket_key(&alive)), Ready::readable());

        wait_for(|| alive.recvs.load(Ordering::SeqCst) == 1);

        engine.shutdown_friendly(true);
    }

    #[test]
    fn test_panicking_dispatch_is_contained() {
        let engine = Engine::new(1, logging::discard()).unwrap();
        let socket = CountingSocket::new(true);
        let as_dyn: Arc<dyn EngineSocket> = socket.clone();
        let key = SocketKey::new(Arc::downgrade(&as_dyn), 0, 0);

        engine.post(CompletionKey::Socket(key), Ready::readable());
        wait_for(|| socket.fatals.load(Ordering::SeqCst) == 1);

        // The worker survived and keeps dispatching.
        let alive = CountingSocket::new(false);
        engine.post(CompletionKey::Socket(socket_key(&alive)), Ready::readable());
        wait_for(|| alive.recvs.load(Ordering::SeqCst) == 1);

        engine.shutdown_friendly(true);
    }

    #[test]
    fn test_readiness_events_reach_workers() {
        let engine = Engine::new(1, logging::discard()).unwrap();
        let socket = CountingSocket::new(false);
        let as_dyn: Arc<dyn EngineSocket> = socket.clone();

        let (registration, readiness) = Registration::new2();
        let token = engine
            .associate(&registration, SocketKey::new(Arc::downgrade(&as_dyn), 0, 0))
            .unwrap();

        engine.rearm(&registration, token, Ready::readable()).unwrap();
        readiness.set_readiness(Ready::readable()).unwrap();

        wait_for(|| socket.recvs.load(Ordering::SeqCst) == 1);

        engine.forget(&registration, token);
        engine.shutdown_friendly(true);
    }

    #[test]
    fn test_shutdown_joins_all_threads() {
        let engine = Engine::new(4, logging::discard()).unwrap();
        engine.shutdown_friendly(true);

        assert!(engine.threads.lock().unwrap().is_empty());
    }
}
