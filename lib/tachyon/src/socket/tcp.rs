use crate::address::Address;
use crate::engine::{EngineSocket, SocketKey};
use crate::error::{set_last_error, Error, NetResult, SendStatus};
use crate::mode::TcpMode;
use crate::packet::Packet;
use crate::socket::core::{SocketConfig, SocketCore};
use crate::socket::send::SendRecord;
use crate::{ClientId, InstanceId};
use mio::net::TcpStream;
use mio::Ready;
use quark::logging;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Result of polling an in-progress connect.
#[derive(Debug)]
pub enum ConnectPoll {
    Connected,
    InProgress,
    Failed(Error),
}

/// Connection-oriented socket. Owns the stream, its framing mode and the shared send/receive
/// machinery; half-close state is tracked through the `sendable`/`recv_possible` flags.
pub struct TcpSocket {
    stream: TcpStream,
    core: SocketCore,
    mode: RwLock<Option<Arc<dyn TcpMode>>>,

    sendable: AtomicBool,
    recv_possible: AtomicBool,
    /// Peer performed an orderly shutdown; observed by the owning instance.
    fin_received: AtomicBool,
}

impl TcpSocket {
    /// Initiates a non-blocking connect and registers the socket with the engine. The connect
    /// completes asynchronously; progress is reported by `poll_connect`.
    pub fn connect(
        remote: Address,
        config: SocketConfig,
        mode: Option<Arc<dyn TcpMode>>,
        instance_id: InstanceId,
        client_id: ClientId,
        log: logging::Logger,
    ) -> NetResult<Arc<TcpSocket>> {
        let stream = TcpStream::connect(&remote.socket_addr())?;
        TcpSocket::build(stream, config, mode, instance_id, client_id, log)
    }

    /// Wraps an accepted stream (server side).
    pub fn from_stream(
        stream: TcpStream,
        config: SocketConfig,
        mode: Option<Arc<dyn TcpMode>>,
        instance_id: InstanceId,
        client_id: ClientId,
        log: logging::Logger,
    ) -> NetResult<Arc<TcpSocket>> {
        TcpSocket::build(stream, config, mode, instance_id, client_id, log)
    }

    fn build(
        stream: TcpStream,
        config: SocketConfig,
        mode: Option<Arc<dyn TcpMode>>,
        instance_id: InstanceId,
        client_id: ClientId,
        log: logging::Logger,
    ) -> NetResult<Arc<TcpSocket>> {
        stream.set_nodelay(!config.nagle)?;

        let engine = crate::engine::get()?;
        let socket = Arc::new(TcpSocket {
            stream,
            core: SocketCore::new(engine, config, log),
            mode: RwLock::new(mode),
            sendable: AtomicBool::new(true),
            recv_possible: AtomicBool::new(true),
            fin_received: AtomicBool::new(false),
        });

        let socket_dyn: Arc<dyn EngineSocket> = socket.clone();
        let weak: Weak<dyn EngineSocket> = Arc::downgrade(&socket_dyn);
        socket
            .core
            .associate(&socket.stream, SocketKey::new(weak, instance_id, client_id))?;

        Ok(socket)
    }

    #[inline]
    pub fn core(&self) -> &SocketCore {
        &self.core
    }

    /// Reports whether an in-progress connect has finished.
    pub fn poll_connect(&self) -> ConnectPoll {
        match self.stream.take_error() {
            Ok(Some(err)) => {
                if err.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectPoll::Failed(Error::ConnectRefused)
                } else {
                    ConnectPoll::Failed(err.into())
                }
            }
            Err(err) => ConnectPoll::Failed(err.into()),
            Ok(None) => match self.stream.peer_addr() {
                Ok(_) => ConnectPoll::Connected,
                Err(ref err) if err.kind() == io::ErrorKind::NotConnected => ConnectPoll::InProgress,
                Err(err) => ConnectPoll::Failed(err.into()),
            },
        }
    }

    /// Arms the socket's single asynchronous receive. Workers keep it armed by re-issuing after
    /// each `deal_with_data` round, so chunks reach the mode in kernel order.
    pub fn recv(&self) -> NetResult<()> {
        if !self.recv_possible.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        self.core.arm(&self.stream, Ready::readable())
    }

    /// Wraps the packet through the framing mode and transmits the composite buffer.
    pub fn send(&self, packet: &Packet, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        if !self.sendable.load(Ordering::Acquire) {
            return Ok(SendStatus::Failed);
        }

        let mode = self.mode().ok_or(Error::ModeNotLoaded)?;
        let composite = mode.get_send_object(packet)?;

        let stream = &self.stream;
        self.core.submit_send(
            &self.stream,
            SendRecord::new(composite, None),
            block,
            timeout_ms,
            move |bytes, _| (&*stream).write(bytes),
        )
    }

    /// Half-close: stops sends and delivers a FIN; the peer drains queued receives and then
    /// closes. The receive direction stays open.
    pub fn shutdown(&self) -> NetResult<()> {
        self.sendable.store(false, Ordering::Release);
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    /// Marks the socket non-sendable, detaches it from the engine and waits until no worker is
    /// inside the receive path before releasing buffers.
    pub fn close(&self) {
        self.sendable.store(false, Ordering::Release);
        self.recv_possible.store(false, Ordering::Release);
        self.core.close_common(&self.stream);
    }

    #[inline]
    pub fn is_send_possible(&self) -> bool {
        self.sendable.load(Ordering::Acquire) && !self.core.is_closed()
    }

    #[inline]
    pub fn is_recv_possible(&self) -> bool {
        self.recv_possible.load(Ordering::Acquire) && !self.core.is_closed()
    }

    /// True once the peer's orderly shutdown has been observed.
    #[inline]
    pub fn fin_received(&self) -> bool {
        self.fin_received.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> Option<Arc<dyn TcpMode>> {
        self.mode.read().expect("Mode lock poisoned").clone()
    }

    pub fn load_mode(&self, mode: Arc<dyn TcpMode>) {
        *self.mode.write().expect("Mode lock poisoned") = Some(mode);
    }

    pub fn peer_addr(&self) -> NetResult<Address> {
        Ok(self.stream.peer_addr()?.into())
    }

    pub fn local_addr(&self) -> NetResult<Address> {
        Ok(self.stream.local_addr()?.into())
    }
}

impl EngineSocket for TcpSocket {
    fn handle_recv_ready(&self, client_id: ClientId, instance_id: InstanceId) {
        if !self.core.begin_recv() {
            return;
        }

        let mode = self.mode();
        let recv_fn = self.core.recv_fn();
        let mut rearm = false;

        {
            let mut buffer = self.core.lock_recv_buffer();

            loop {
                match (&self.stream).read(&mut buffer[..]) {
                    Ok(0) => {
                        // Orderly shutdown from the peer: no more inbound data. Queued packets
                        // stay readable; the owning instance decides when to close.
                        self.recv_possible.store(false, Ordering::Release);
                        self.fin_received.store(true, Ordering::Release);
                        logging::debug!(self.core.log(), "peer closed its send direction";
                                        "context" => "recv", "client_id" => client_id);
                        break;
                    }
                    Ok(count) => {
                        self.core.note_recv_success();

                        let mode = match mode.as_ref() {
                            Some(mode) => mode,
                            None => {
                                set_last_error(&Error::ModeNotLoaded);
                                self.core.request_close();
                                break;
                            }
                        };

                        if let Err(err) = mode.deal_with_data(&buffer[..count], recv_fn.as_ref(), client_id, instance_id)
                        {
                            // Stream framing failures are always fatal for the stream.
                            set_last_error(&err);
                            logging::warn!(self.core.log(), "receive framing failed";
                                           "context" => "recv", "client_id" => client_id, "error" => ?err);
                            self.core.request_close();
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        rearm = true;
                        break;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let error = Error::from(err);
                        set_last_error(&error);
                        logging::warn!(self.core.log(), "receive failed";
                                       "context" => "recv", "client_id" => client_id, "error" => ?error);
                        self.core.request_close();
                        break;
                    }
                }
            }
        }

        if rearm {
            drop(self.core.rearm(&self.stream));
        }

        self.core.end_recv();
    }

    fn handle_send_ready(&self) {
        let stream = &self.stream;
        self.core
            .flush_sends(&self.stream, move |bytes, _| (&*stream).write(bytes));
    }

    fn handle_fatal(&self) {
        self.core.request_close();
    }
}
