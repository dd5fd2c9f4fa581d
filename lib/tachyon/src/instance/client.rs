use crate::address::Address;
use crate::error::{set_last_error, ConnectionStatus, Error, NetResult, SendStatus};
use crate::instance::profile::InstanceProfile;
use crate::instance::{build_auth_packet, HANDSHAKE_POLL_MS, HANDSHAKE_RESEND_MS};
use crate::mode::udp::generate_udp_mode;
use crate::mode::{RecvCallback, UdpModeId};
use crate::packet::Packet;
use crate::socket::{ConnectPoll, TcpSocket, UdpSocket};
use crate::{ClientId, InstanceId, OperationId, AUTH_STRENGTH};
use quark::logging;
use quark::time::Timer;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Connection-oriented client: one TCP socket, optionally one UDP socket, and the three-way
/// handshake that binds both endpoints to a client record on the server.
///
/// The handshake runs on a dedicated task so cancellation is a flag check at each poll step.
/// While it runs, the user's TCP receive callback is suspended and packets accumulate in the
/// mode's store; the callback is restored once the connection is fully established.
pub struct ClientInstance {
    instance_id: InstanceId,
    profile: InstanceProfile,

    tcp: Mutex<Option<Arc<TcpSocket>>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,

    status: Mutex<ConnectionStatus>,
    cancel: Arc<AtomicBool>,
    handshake: Mutex<Option<JoinHandle<()>>>,

    client_id: AtomicUsize,
    max_clients: AtomicUsize,
    num_operations: AtomicUsize,

    user_recv_tcp: Mutex<Option<RecvCallback>>,
    user_recv_udp: Mutex<Option<RecvCallback>>,

    destroy_requested: AtomicBool,

    log: logging::Logger,
}

impl ClientInstance {
    pub fn new(instance_id: InstanceId, profile: InstanceProfile, log: logging::Logger) -> NetResult<Arc<ClientInstance>> {
        profile.validate()?;

        Ok(Arc::new(ClientInstance {
            instance_id,
            profile,
            tcp: Mutex::new(None),
            udp: Mutex::new(None),
            status: Mutex::new(ConnectionStatus::NotConnected),
            cancel: Arc::new(AtomicBool::new(false)),
            handshake: Mutex::new(None),
            client_id: AtomicUsize::new(0),
            max_clients: AtomicUsize::new(0),
            num_operations: AtomicUsize::new(0),
            user_recv_tcp: Mutex::new(None),
            user_recv_udp: Mutex::new(None),
            destroy_requested: AtomicBool::new(false),
            log,
        }))
    }

    /// Starts connecting to `tcp_addr` (and `udp_addr` when UDP is enabled). The handshake runs
    /// asynchronously; with `block` set, waits until it reaches a terminal status.
    pub fn connect(
        self: &Arc<Self>,
        tcp_addr: Address,
        udp_addr: Option<Address>,
        timeout_ms: u64,
        block: bool,
    ) -> NetResult<ConnectionStatus> {
        {
            let mut status = self.lock_status();
            match *status {
                ConnectionStatus::NotConnected
                | ConnectionStatus::Refused
                | ConnectionStatus::TimedOut
                | ConnectionStatus::ConnectionError => {}
                _ => return Err(Error::Aborted),
            }
            *status = ConnectionStatus::Connecting;
        }

        if self.profile.udp_enabled && udp_addr.is_none() {
            *self.lock_status() = ConnectionStatus::NotConnected;
            return Err(Error::AddrParse);
        }

        self.cancel.store(false, Ordering::Release);

        let tcp = match TcpSocket::connect(
            tcp_addr,
            self.profile.tcp_socket_config(),
            Some(self.profile.build_tcp_mode()),
            self.instance_id,
            0,
            self.log.new(logging::o!("socket" => "tcp")),
        ) {
            Ok(tcp) => tcp,
            Err(err) => {
                *self.lock_status() = ConnectionStatus::NotConnected;
                return Err(err);
            }
        };
        *self.tcp.lock().expect("Socket slot poisoned") = Some(tcp);

        if self.profile.udp_enabled {
            let local = Address::parse("0.0.0.0:0").expect("Static address");
            let udp = match UdpSocket::bind(
                local,
                self.profile.udp_socket_config(),
                self.profile.reusable_udp,
                false,
                self.instance_id,
                0,
                self.log.new(logging::o!("socket" => "udp")),
            ) {
                Ok(udp) => udp,
                Err(err) => {
                    self.teardown();
                    *self.lock_status() = ConnectionStatus::NotConnected;
                    return Err(err);
                }
            };

            udp.set_remote(udp_addr.expect("Validated above"));
            *self.udp.lock().expect("Socket slot poisoned") = Some(udp);
        }

        logging::debug!(self.log, "connection attempt started";
                        "context" => "connect", "remote" => %tcp_addr, "timeout_ms" => timeout_ms);

        let task = {
            let this = self.clone();
            thread::Builder::new()
                .name("client-handshake".into())
                .spawn(move || handshake_routine(this, timeout_ms))
                .expect("Handshake spawn failed")
        };
        *self.handshake.lock().expect("Handshake slot poisoned") = Some(task);

        if !block {
            return Ok(ConnectionStatus::StillConnecting);
        }

        loop {
            let status = self.poll_connect();
            if status != ConnectionStatus::StillConnecting {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(HANDSHAKE_POLL_MS));
        }
    }

    /// Non-blocking progress report for an in-flight connect.
    pub fn poll_connect(&self) -> ConnectionStatus {
        match *self.lock_status() {
            ConnectionStatus::Connecting => ConnectionStatus::StillConnecting,
            status => status,
        }
    }

    /// Cancels an in-progress handshake and tears the sockets down.
    pub fn stop_connect(&self) {
        self.cancel.store(true, Ordering::Release);

        let task = self.handshake.lock().expect("Handshake slot poisoned").take();
        if let Some(task) = task {
            drop(task.join());
        }

        self.teardown();
        *self.lock_status() = ConnectionStatus::NotConnected;
    }

    /// Current connection status, folding in error flags the workers have recorded since the
    /// last poll. A fatal flag transitions to DISCONNECTING and requests destroy.
    pub fn connection_status(&self) -> ConnectionStatus {
        let mut status = self.lock_status();

        if status.is_send_possible() || status.is_recv_possible() {
            let tcp_failed = self
                .tcp_socket()
                .map(|tcp| tcp.core().close_requested())
                .unwrap_or(false);
            let udp_failed = self
                .udp_socket()
                .map(|udp| udp.core().close_requested())
                .unwrap_or(false);

            if tcp_failed || udp_failed {
                *status = ConnectionStatus::Disconnecting;
                self.destroy_requested.store(true, Ordering::Release);
            } else if let Some(tcp) = self.tcp_socket() {
                // Peer half-closed: stop expecting inbound data, keep draining the store.
                if tcp.fin_received() {
                    *status = match *status {
                        ConnectionStatus::NoSend | ConnectionStatus::NoSendRecv => ConnectionStatus::NoSendRecv,
                        _ => ConnectionStatus::NoRecv,
                    };
                }
            }
        }

        *status
    }

    /// True while the connection is usable in at least one direction.
    pub fn client_connected(&self) -> bool {
        match self.connection_status() {
            ConnectionStatus::Connected
            | ConnectionStatus::NoSend
            | ConnectionStatus::NoRecv => true,
            _ => false,
        }
    }

    /// Identifier allocated by the server during the handshake.
    pub fn client_id(&self) -> ClientId {
        self.client_id.load(Ordering::Acquire)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients.load(Ordering::Acquire)
    }

    pub fn operations(&self) -> usize {
        self.num_operations.load(Ordering::Acquire)
    }

    /// Sends over the stream. A kill-level failure (send timeout included) disconnects the
    /// instance.
    pub fn send_tcp(&self, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        let tcp = self.tcp_socket().ok_or(Error::Closed)?;
        let status = tcp.send(packet, block, self.profile.send_timeout_ms)?;

        if status == SendStatus::FailedKill {
            set_last_error(&Error::SendTimeout);
            self.disconnect();
        }

        Ok(status)
    }

    /// Pulls the oldest queued stream packet. Returns the number of packets copied (0 or 1).
    pub fn recv_tcp(&self, destination: &mut Packet) -> NetResult<usize> {
        let tcp = self.tcp_socket().ok_or(Error::Closed)?;
        let mode = tcp.mode().ok_or(Error::ModeNotLoaded)?;
        Ok(mode.get_packet(destination))
    }

    /// Sends a datagram to the server.
    pub fn send_udp(&self, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        let udp = self.udp_socket().ok_or(Error::Closed)?;
        let status = udp.send(packet, block, self.profile.send_timeout_ms)?;

        if status == SendStatus::FailedKill {
            set_last_error(&Error::SendTimeout);
            self.disconnect();
        }

        Ok(status)
    }

    /// Sends a datagram to an arbitrary remote.
    pub fn send_udp_to(&self, target: Address, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        let udp = self.udp_socket().ok_or(Error::Closed)?;
        udp.send_to(target, packet, block, self.profile.send_timeout_ms)
    }

    /// Pulls a queued datagram packet. `client_id` 0 names the server's own traffic; per-client
    /// modes may deliver under other ids.
    pub fn recv_udp(&self, destination: &mut Packet, client_id: ClientId, operation_id: OperationId) -> NetResult<usize> {
        let udp = self.udp_socket().ok_or(Error::Closed)?;
        let mode = udp.mode().ok_or(Error::ModeNotLoaded)?;
        mode.get_packet(destination, client_id, operation_id)
    }

    /// Half-close: no more sends from this side; the server drains what is queued and closes.
    pub fn shutdown_tcp(&self) -> NetResult<()> {
        let tcp = self.tcp_socket().ok_or(Error::Closed)?;
        tcp.shutdown()?;

        let mut status = self.lock_status();
        *status = match *status {
            ConnectionStatus::NoRecv | ConnectionStatus::NoSendRecv => ConnectionStatus::NoSendRecv,
            _ => ConnectionStatus::NoSend,
        };
        Ok(())
    }

    /// Installs (or clears) the synchronous TCP receive callback. Suspended automatically while
    /// a handshake is using the packet store.
    pub fn set_recv_fn_tcp(&self, recv_fn: Option<RecvCallback>) {
        *self.user_recv_tcp.lock().expect("Callback slot poisoned") = recv_fn.clone();

        if *self.lock_status() == ConnectionStatus::Connected {
            if let Some(tcp) = self.tcp_socket() {
                tcp.core().set_recv_fn(recv_fn);
            }
        }
    }

    pub fn set_recv_fn_udp(&self, recv_fn: Option<RecvCallback>) {
        *self.user_recv_udp.lock().expect("Callback slot poisoned") = recv_fn.clone();

        if let Some(udp) = self.udp_socket() {
            udp.core().set_recv_fn(recv_fn);
        }
    }

    /// Closes both sockets and returns to NOT_CONNECTED.
    pub fn disconnect(&self) {
        self.cancel.store(true, Ordering::Release);
        self.teardown();
        *self.lock_status() = ConnectionStatus::NotConnected;
    }

    /// Set once the instance wants the embedder to destroy it.
    pub fn should_destroy(&self) -> bool {
        self.destroy_requested.load(Ordering::Acquire)
    }

    pub(crate) fn tcp_socket(&self) -> Option<Arc<TcpSocket>> {
        self.tcp.lock().expect("Socket slot poisoned").clone()
    }

    pub(crate) fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.lock().expect("Socket slot poisoned").clone()
    }

    fn teardown(&self) {
        if let Some(tcp) = self.tcp_socket() {
            tcp.close();
        }
        if let Some(udp) = self.udp_socket() {
            udp.close();
        }
    }

    fn lock_status(&self) -> std::sync::MutexGuard<ConnectionStatus> {
        self.status.lock().expect("Status poisoned")
    }
}

impl Drop for ClientInstance {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.teardown();
    }
}

fn handshake_routine(this: Arc<ClientInstance>, timeout_ms: u64) {
    let timer = Timer::new(timeout_ms);
    let status = run_handshake(&this, &timer);

    logging::debug!(this.log, "handshake finished"; "context" => "handshake", "status" => ?status);

    *this.status.lock().expect("Status poisoned") = status;

    if status == ConnectionStatus::Connected {
        // Restore the user's receive paths now that the handshake no longer owns the store.
        if let Some(tcp) = this.tcp_socket() {
            let recv_fn = this.user_recv_tcp.lock().expect("Callback slot poisoned").clone();
            tcp.core().set_recv_fn(recv_fn);
        }
        if let Some(udp) = this.udp_socket() {
            let recv_fn = this.user_recv_udp.lock().expect("Callback slot poisoned").clone();
            udp.core().set_recv_fn(recv_fn);
            drop(udp.recv());
        }
    } else {
        this.teardown();
    }
}

/// The handshake state machine. Every wait is a sleep-poll so cancellation and the overall
/// deadline are observed between steps.
fn run_handshake(this: &Arc<ClientInstance>, timer: &Timer) -> ConnectionStatus {
    let tcp = match this.tcp_socket() {
        Some(tcp) => tcp,
        None => return ConnectionStatus::ConnectionError,
    };

    // Step 1: wait for the TCP connect to finish.
    loop {
        if let Some(interrupted) = gate(this, timer) {
            return interrupted;
        }

        match tcp.poll_connect() {
            ConnectPoll::Connected => break,
            ConnectPoll::InProgress => thread::sleep(Duration::from_millis(HANDSHAKE_POLL_MS)),
            ConnectPoll::Failed(Error::ConnectRefused) => return ConnectionStatus::Refused,
            ConnectPoll::Failed(err) => {
                set_last_error(&err);
                return ConnectionStatus::ConnectionError;
            }
        }
    }

    // Step 2: without a handshake the connection is complete as soon as the stream is up.
    if !this.profile.handshake_enabled {
        if tcp.recv().is_err() {
            return ConnectionStatus::ConnectionError;
        }
        return ConnectionStatus::Connected;
    }

    // Step 3: start receiving; the welcome arrives through the normal framing into the store.
    if tcp.recv().is_err() {
        return ConnectionStatus::ConnectionError;
    }

    let mode = match tcp.mode() {
        Some(mode) => mode,
        None => return ConnectionStatus::ConnectionError,
    };

    let mut welcome = Packet::new();
    loop {
        if let Some(interrupted) = gate(this, timer) {
            return interrupted;
        }
        if tcp.core().close_requested() {
            return ConnectionStatus::ConnectionError;
        }

        if mode.get_packet(&mut welcome) > 0 {
            break;
        }

        thread::sleep(Duration::from_millis(HANDSHAKE_POLL_MS));
    }

    // Step 4: parse the welcome.
    let parsed = parse_welcome(this, &mut welcome);
    let (udp_mode_id, tokens) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            set_last_error(&err);
            return ConnectionStatus::ConnectionError;
        }
    };

    if !this.profile.udp_enabled {
        return ConnectionStatus::Connected;
    }

    // Step 5: bring up the negotiated UDP mode and authenticate until the server acks over TCP.
    let udp = match this.udp_socket() {
        Some(udp) => udp,
        None => return ConnectionStatus::ConnectionError,
    };

    let udp_mode_id = udp_mode_id.expect("UDP discriminant present when UDP is enabled");
    let config = match this.profile.udp_mode_config(this.max_clients(), false) {
        Ok(config) => config,
        Err(err) => {
            set_last_error(&err);
            return ConnectionStatus::ConnectionError;
        }
    };
    udp.load_mode(generate_udp_mode(udp_mode_id, &config));

    let auth = build_auth_packet(this.client_id(), &tokens);
    let mut ack = Packet::new();

    // The datagram is resent on a small period: it may be lost, and repeated sends keep NAT
    // mappings warm until the server observes one.
    loop {
        if let Some(interrupted) = gate(this, timer) {
            return interrupted;
        }
        if tcp.core().close_requested() {
            return ConnectionStatus::ConnectionError;
        }

        if mode.get_packet(&mut ack) > 0 {
            // Only the empty ack is acceptable here.
            if ack.used_size() == 0 {
                return ConnectionStatus::Connected;
            }

            set_last_error(&Error::UnexpectedHandshakePacket);
            return ConnectionStatus::ConnectionError;
        }

        if udp.raw_send(&auth, false, 0).is_err() {
            return ConnectionStatus::ConnectionError;
        }

        thread::sleep(Duration::from_millis(HANDSHAKE_RESEND_MS));
    }
}

fn gate(this: &Arc<ClientInstance>, timer: &Timer) -> Option<ConnectionStatus> {
    if this.cancel.load(Ordering::Acquire) || timer.expired() {
        Some(ConnectionStatus::TimedOut)
    } else {
        None
    }
}

type WelcomeFields = (Option<UdpModeId>, [i32; AUTH_STRENGTH]);

fn parse_welcome(this: &Arc<ClientInstance>, welcome: &mut Packet) -> NetResult<WelcomeFields> {
    welcome.set_cursor(0);

    let max_clients = welcome.get_size().map_err(|_| Error::UnexpectedHandshakePacket)?;

    let udp_mode_id = if this.profile.udp_enabled {
        let operations = welcome.get_size().map_err(|_| Error::UnexpectedHandshakePacket)?;
        let discriminant = welcome.get_u8().map_err(|_| Error::UnexpectedHandshakePacket)?;

        this.num_operations.store(operations, Ordering::Release);
        Some(UdpModeId::from_wire(discriminant).map_err(|_| Error::UnexpectedHandshakePacket)?)
    } else {
        None
    };

    let client_id = welcome.get_size().map_err(|_| Error::UnexpectedHandshakePacket)?;

    let mut tokens = [0i32; AUTH_STRENGTH];
    if this.profile.udp_enabled {
        for token in tokens.iter_mut() {
            *token = welcome.get_i32().map_err(|_| Error::UnexpectedHandshakePacket)?;
        }
    }

    this.max_clients.store(max_clients, Ordering::Release);
    this.client_id.store(client_id, Ordering::Release);

    logging::debug!(this.log, "welcome received";
                    "context" => "handshake",
                    "client_id" => client_id,
                    "max_clients" => max_clients,
                    "udp_mode" => ?udp_mode_id);

    Ok((udp_mode_id, tokens))
}
