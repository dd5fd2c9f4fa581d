use crate::address::{Address, SharedAddress};
use crate::engine::{EngineSocket, SocketKey};
use crate::error::{set_last_error, Error, NetResult, SendStatus};
use crate::mode::UdpMode;
use crate::packet::Packet;
use crate::socket::core::{SocketConfig, SocketCore};
use crate::socket::send::SendRecord;
use crate::{ClientId, InstanceId};
use net2::UdpBuilder;
use quark::logging;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, Weak};

/// What to do with an inbound datagram before framing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disposition {
    /// Frame the datagram for this client's store.
    Deliver(ClientId),
    /// The router handled the datagram itself (handshake traffic).
    Consumed,
    /// Silently discard (unknown source, forged authentication).
    Drop,
}

/// Pre-framing routing hook. A server installs one to resolve the source address to a client id
/// and to intercept authentication datagrams; instances without a router deliver everything to
/// the completion key's client id.
pub trait DatagramRouter: Send + Sync {
    fn route(&self, datagram: &[u8], from: Address) -> Disposition;
}

/// Connectionless socket. Tracks the most recent datagram source, an optional default remote for
/// plain `send`, and the routing hook.
pub struct UdpSocket {
    socket: mio::net::UdpSocket,
    core: SocketCore,
    mode: RwLock<Option<Arc<dyn UdpMode>>>,
    router: RwLock<Option<Arc<dyn DatagramRouter>>>,
    remote: SharedAddress,
    last_from: SharedAddress,
}

impl UdpSocket {
    /// Binds a datagram socket. `reuse` sets SO_REUSEADDR before binding; `broadcast` flips the
    /// broadcast flag (broadcast instances set both).
    pub fn bind(
        local: Address,
        config: SocketConfig,
        reuse: bool,
        broadcast: bool,
        instance_id: InstanceId,
        client_id: ClientId,
        log: logging::Logger,
    ) -> NetResult<Arc<UdpSocket>> {
        let builder = match local.ip() {
            IpAddr::V4(_) => UdpBuilder::new_v4()?,
            IpAddr::V6(_) => UdpBuilder::new_v6()?,
        };

        if reuse {
            builder.reuse_address(true)?;
        }

        let std_socket = builder.bind(&local.socket_addr())?;
        std_socket.set_nonblocking(true)?;

        let socket = mio::net::UdpSocket::from_socket(std_socket)?;

        if broadcast {
            socket.set_broadcast(true)?;
        }

        let engine = crate::engine::get()?;
        let socket = Arc::new(UdpSocket {
            socket,
            core: SocketCore::new(engine, config, log),
            mode: RwLock::new(None),
            router: RwLock::new(None),
            remote: SharedAddress::unspecified(),
            last_from: SharedAddress::unspecified(),
        });

        let socket_dyn: Arc<dyn EngineSocket> = socket.clone();
        let weak: Weak<dyn EngineSocket> = Arc::downgrade(&socket_dyn);
        socket
            .core
            .associate(&socket.socket, SocketKey::new(weak, instance_id, client_id))?;

        Ok(socket)
    }

    #[inline]
    pub fn core(&self) -> &SocketCore {
        &self.core
    }

    /// Default destination used by plain `send`.
    pub fn set_remote(&self, remote: Address) {
        self.remote.set(remote);
    }

    pub fn remote(&self) -> Address {
        self.remote.get()
    }

    /// Source address of the most recently received datagram.
    pub fn last_from(&self) -> Address {
        self.last_from.get()
    }

    /// Arms the socket's single asynchronous receive.
    pub fn recv(&self) -> NetResult<()> {
        self.core.arm(&self.socket, mio::Ready::readable())
    }

    /// Wraps the packet through the mode and sends it to the configured remote.
    pub fn send(&self, packet: &Packet, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        let remote = self.remote.get();
        if !remote.is_specified() {
            return Err(Error::Closed);
        }

        self.send_to(remote, packet, block, timeout_ms)
    }

    /// Wraps the packet through the mode and sends it to an arbitrary remote.
    pub fn send_to(&self, target: Address, packet: &Packet, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        let mode = self.mode().ok_or(Error::ModeNotLoaded)?;
        let composite = mode.get_send_object(packet)?;
        self.submit(composite, target, block, timeout_ms)
    }

    /// Sends the packet bytes as-is, bypassing the mode's composite construction. Used for
    /// handshake datagrams before a mode is negotiated.
    pub fn raw_send(&self, packet: &Packet, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        let remote = self.remote.get();
        if !remote.is_specified() {
            return Err(Error::Closed);
        }

        self.raw_send_to(remote, packet, block, timeout_ms)
    }

    pub fn raw_send_to(&self, target: Address, packet: &Packet, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        self.submit(packet.clone(), target, block, timeout_ms)
    }

    fn submit(&self, composite: Packet, target: Address, block: bool, timeout_ms: u64) -> NetResult<SendStatus> {
        let socket = &self.socket;

        self.core.submit_send(
            &self.socket,
            SendRecord::new(composite, Some(target)),
            block,
            timeout_ms,
            move |bytes, target| match target {
                Some(addr) => socket.send_to(bytes, &addr.socket_addr()),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
        )
    }

    pub fn mode(&self) -> Option<Arc<dyn UdpMode>> {
        self.mode.read().expect("Mode lock poisoned").clone()
    }

    /// Installs the framing mode. On a client this happens mid-handshake once the server's
    /// welcome names the negotiated discriminant.
    pub fn load_mode(&self, mode: Arc<dyn UdpMode>) {
        *self.mode.write().expect("Mode lock poisoned") = Some(mode);
    }

    pub fn set_router(&self, router: Option<Arc<dyn DatagramRouter>>) {
        *self.router.write().expect("Router lock poisoned") = router;
    }

    pub fn close(&self) {
        self.core.close_common(&self.socket);
    }

    pub fn local_addr(&self) -> NetResult<Address> {
        Ok(self.socket.local_addr()?.into())
    }
}

impl EngineSocket for UdpSocket {
    fn handle_recv_ready(&self, client_id: ClientId, instance_id: InstanceId) {
        if !self.core.begin_recv() {
            return;
        }

        let mode = self.mode();
        let recv_fn = self.core.recv_fn();
        let router = self.router.read().expect("Router lock poisoned").clone();
        let mut rearm = true;

        {
            let mut buffer = self.core.lock_recv_buffer();

            loop {
                match self.socket.recv_from(&mut buffer[..]) {
                    Ok((count, from)) => {
                        self.core.note_recv_success();
                        self.last_from.set(from.into());

                        let datagram = &buffer[..count];

                        let deliver_to = match router.as_ref() {
                            Some(router) => match router.route(datagram, from.into()) {
                                Disposition::Deliver(resolved) => Some(resolved),
                                Disposition::Consumed | Disposition::Drop => None,
                            },
                            None => Some(client_id),
                        };

                        let deliver_to = match deliver_to {
                            Some(id) => id,
                            None => continue,
                        };

                        if let Some(mode) = mode.as_ref() {
                            if let Err(err) =
                                mode.deal_with_data(datagram, recv_fn.as_ref(), deliver_to, instance_id)
                            {
                                // A bad datagram is dropped; the stream continues.
                                set_last_error(&err);
                                logging::debug!(self.core.log(), "datagram discarded";
                                                "context" => "recv", "client_id" => deliver_to, "error" => ?err);
                            }
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        // Datagram receive failures are not fatal; the receive is re-armed until
                        // the consecutive-failure tolerance is exhausted.
                        let error = Error::from(err);
                        set_last_error(&error);
                        logging::warn!(self.core.log(), "datagram receive failed";
                                       "context" => "recv", "error" => ?error);

                        if self.core.note_recv_failure() {
                            self.core.request_close();
                            rearm = false;
                        }
                        break;
                    }
                }
            }
        }

        if rearm {
            drop(self.core.rearm(&self.socket));
        }

        self.core.end_recv();
    }

    fn handle_send_ready(&self) {
        let socket = &self.socket;

        self.core.flush_sends(&self.socket, move |bytes, target| match target {
            Some(addr) => socket.send_to(bytes, &addr.socket_addr()),
            None => Err(io::ErrorKind::NotConnected.into()),
        });
    }

    fn handle_fatal(&self) {
        self.core.request_close();
    }
}
