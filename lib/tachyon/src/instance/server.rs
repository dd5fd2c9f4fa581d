use crate::address::Address;
use crate::error::{set_last_error, ConnectionStatus, Error, InstanceState, NetResult, SendStatus};
use crate::instance::profile::InstanceProfile;
use crate::instance::HANDSHAKE_POLL_MS;
use crate::mode::udp::generate_udp_mode;
use crate::mode::RecvCallback;
use crate::packet::Packet;
use crate::socket::{DatagramRouter, Disposition, ListeningSocket, TcpSocket, UdpSocket};
use crate::{ClientId, InstanceId, OperationId, AUTH_STRENGTH};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use indexmap::IndexSet;
use quark::logging;
use quark::time::Timer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wire size of the UDP authentication datagram: `[u32 0][u32 client][i32 tokens[4]]`.
const AUTH_DATAGRAM_SIZE: usize = 8 + 4 * AUTH_STRENGTH;

/// Per-connection record inside a server. Reuses the client code path's status vocabulary;
/// `state` is SERVER_CLIENT while the slot is occupied.
struct ClientRecord {
    state: InstanceState,
    status: ConnectionStatus,
    tcp: Option<Arc<TcpSocket>>,
    udp_addr: Address,
    tokens: [i32; AUTH_STRENGTH],
    deadline: Option<Timer>,
}

impl ClientRecord {
    fn empty() -> ClientRecord {
        ClientRecord {
            state: InstanceState::Inactive,
            status: ConnectionStatus::NotConnected,
            tcp: None,
            udp_addr: Address::unspecified(),
            tokens: [0; AUTH_STRENGTH],
            deadline: None,
        }
    }

    fn is_joined(&self) -> bool {
        match self.status {
            ConnectionStatus::Connected
            | ConnectionStatus::NoSend
            | ConnectionStatus::NoRecv
            | ConnectionStatus::NoSendRecv => true,
            _ => false,
        }
    }
}

struct ServerShared {
    instance_id: InstanceId,
    profile: InstanceProfile,
    max_clients: usize,

    tcp_local: Address,
    udp: Option<Arc<UdpSocket>>,

    clients: Vec<Mutex<ClientRecord>>,
    /// Occupied slots in accept order; iterated by housekeeping and the send-all paths.
    active: Mutex<IndexSet<ClientId>>,
    addr_map: Mutex<HashMap<Address, ClientId>>,

    joined: Mutex<VecDeque<ClientId>>,
    left: Mutex<VecDeque<ClientId>>,

    recv_tcp_fn: Mutex<Option<RecvCallback>>,

    terminate: AtomicBool,
    destroy_requested: AtomicBool,

    log: logging::Logger,
}

/// Multi-client server: a listening socket, an accept thread owning client-id allocation, one
/// shared UDP socket, and an array of per-connection records.
pub struct ServerInstance {
    shared: Arc<ServerShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    /// Binds the listening socket (and the shared UDP socket when enabled) and starts the
    /// accept thread.
    pub fn new(
        instance_id: InstanceId,
        tcp_addr: Address,
        udp_addr: Option<Address>,
        max_clients: usize,
        profile: InstanceProfile,
        log: logging::Logger,
    ) -> NetResult<ServerInstance> {
        profile.validate()?;
        assert!(max_clients > 0, "A server needs at least one client slot");

        if profile.udp_enabled && udp_addr.is_none() {
            return Err(Error::AddrParse);
        }

        let listener = ListeningSocket::bind(tcp_addr)?;
        let tcp_local = listener.local_addr()?;

        let udp = if profile.udp_enabled {
            let socket = UdpSocket::bind(
                udp_addr.expect("Validated above"),
                profile.udp_socket_config(),
                profile.reusable_udp,
                false,
                instance_id,
                0,
                log.new(logging::o!("socket" => "udp")),
            )?;

            let config = profile.udp_mode_config(max_clients, true)?;
            socket.load_mode(generate_udp_mode(profile.mode_udp.mode_id(), &config));
            Some(socket)
        } else {
            None
        };

        let shared = Arc::new(ServerShared {
            instance_id,
            profile,
            max_clients,
            tcp_local,
            udp,
            clients: (0..=max_clients).map(|_| Mutex::new(ClientRecord::empty())).collect(),
            active: Mutex::new(IndexSet::new()),
            addr_map: Mutex::new(HashMap::new()),
            joined: Mutex::new(VecDeque::new()),
            left: Mutex::new(VecDeque::new()),
            recv_tcp_fn: Mutex::new(None),
            terminate: AtomicBool::new(false),
            destroy_requested: AtomicBool::new(false),
            log,
        });

        if let Some(udp) = &shared.udp {
            udp.set_router(Some(Arc::new(ServerRouter {
                shared: Arc::downgrade(&shared),
            })));
            udp.recv()?;
        }

        let accept_task = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("server-accept".into())
                .spawn(move || accept_loop(shared, listener))
                .expect("Accept thread spawn failed")
        };

        Ok(ServerInstance {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Oldest not-yet-consumed connect notification.
    pub fn next_joined(&self) -> Option<ClientId> {
        self.shared.joined.lock().expect("Joined queue poisoned").pop_front()
    }

    /// Oldest not-yet-consumed disconnect notification.
    pub fn next_left(&self) -> Option<ClientId> {
        self.shared.left.lock().expect("Left queue poisoned").pop_front()
    }

    pub fn client_status(&self, client_id: ClientId) -> NetResult<ConnectionStatus> {
        Ok(self.shared.lock_client(client_id)?.status)
    }

    pub fn client_connected(&self, client_id: ClientId) -> NetResult<bool> {
        Ok(self.shared.lock_client(client_id)?.is_joined())
    }

    /// Clients currently occupying a slot (connected or mid-handshake).
    pub fn connected_count(&self) -> usize {
        self.shared.active.lock().expect("Active set poisoned").len()
    }

    pub fn max_clients(&self) -> usize {
        self.shared.max_clients
    }

    /// Bound listening address; useful when the profile asked for an ephemeral port.
    pub fn tcp_addr(&self) -> Address {
        self.shared.tcp_local
    }

    /// Bound UDP address, when UDP is enabled.
    pub fn udp_addr(&self) -> Option<Address> {
        self.shared.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    /// The UDP return address bound to a client during its handshake.
    pub fn client_udp_addr(&self, client_id: ClientId) -> NetResult<Address> {
        Ok(self.shared.lock_client(client_id)?.udp_addr)
    }

    /// Sends over one client's stream. Kill-level failures disconnect that client only.
    pub fn send_tcp(&self, client_id: ClientId, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        let tcp = {
            let record = self.shared.lock_client(client_id)?;
            record.tcp.clone().ok_or(Error::InvalidClientId)?
        };

        let status = tcp.send(packet, block, self.shared.profile.send_timeout_ms)?;

        if status == SendStatus::FailedKill {
            set_last_error(&Error::SendTimeout);
            self.disconnect_client(client_id)?;
        }

        Ok(status)
    }

    /// Sends a datagram to one client's bound UDP address.
    pub fn send_udp(&self, client_id: ClientId, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        let udp = self.shared.udp.as_ref().ok_or(Error::ModeNotLoaded)?;

        let target = {
            let record = self.shared.lock_client(client_id)?;
            if !record.is_joined() || !record.udp_addr.is_specified() {
                return Err(Error::InvalidClientId);
            }
            record.udp_addr
        };

        let mut outbound = packet.clone();
        outbound.set_client_from(client_id);

        udp.send_to(target, &outbound, block, self.shared.profile.send_timeout_ms)
    }

    /// Sends to every joined client's stream, optionally excluding one. Returns how many
    /// clients were addressed.
    pub fn send_all_tcp(&self, packet: &Packet, exclude: Option<ClientId>) -> usize {
        let mut sent = 0;

        for client_id in self.shared.active_snapshot() {
            if Some(client_id) == exclude {
                continue;
            }

            let joined = self
                .shared
                .lock_client(client_id)
                .map(|record| record.is_joined())
                .unwrap_or(false);

            if joined && self.send_tcp(client_id, packet, false).is_ok() {
                sent += 1;
            }
        }

        sent
    }

    pub fn send_all_udp(&self, packet: &Packet, exclude: Option<ClientId>) -> usize {
        let mut sent = 0;

        for client_id in self.shared.active_snapshot() {
            if Some(client_id) == exclude {
                continue;
            }

            let joined = self
                .shared
                .lock_client(client_id)
                .map(|record| record.is_joined() && record.udp_addr.is_specified())
                .unwrap_or(false);

            if joined && self.send_udp(client_id, packet, false).is_ok() {
                sent += 1;
            }
        }

        sent
    }

    /// Pulls the oldest queued stream packet from one client.
    pub fn recv_tcp(&self, client_id: ClientId, destination: &mut Packet) -> NetResult<usize> {
        let tcp = {
            let record = self.shared.lock_client(client_id)?;
            record.tcp.clone().ok_or(Error::InvalidClientId)?
        };

        let mode = tcp.mode().ok_or(Error::ModeNotLoaded)?;
        Ok(mode.get_packet(destination))
    }

    /// Pulls a framed datagram packet for one client (and operation, in per-operation modes).
    pub fn recv_udp(
        &self,
        destination: &mut Packet,
        client_id: ClientId,
        operation_id: OperationId,
    ) -> NetResult<usize> {
        let udp = self.shared.udp.as_ref().ok_or(Error::ModeNotLoaded)?;
        let mode = udp.mode().ok_or(Error::ModeNotLoaded)?;
        mode.get_packet(destination, client_id, operation_id)
    }

    /// Synchronous receive callback applied to every accepted stream.
    pub fn set_recv_fn_tcp(&self, recv_fn: Option<RecvCallback>) {
        *self.shared.recv_tcp_fn.lock().expect("Callback slot poisoned") = recv_fn.clone();

        for client_id in 1..=self.shared.max_clients {
            if let Ok(record) = self.shared.lock_client(client_id) {
                if let Some(tcp) = &record.tcp {
                    tcp.core().set_recv_fn(recv_fn.clone());
                }
            }
        }
    }

    pub fn set_recv_fn_udp(&self, recv_fn: Option<RecvCallback>) {
        if let Some(udp) = &self.shared.udp {
            udp.core().set_recv_fn(recv_fn);
        }
    }

    /// Drops one client: closes its stream, clears its UDP binding and mode state, frees the
    /// slot and queues a left notification if the client had joined.
    pub fn disconnect_client(&self, client_id: ClientId) -> NetResult<()> {
        let mut record = self.shared.lock_client(client_id)?;
        self.shared.release_record(client_id, &mut record);
        Ok(())
    }

    /// Stops the accept thread and closes every socket.
    pub fn shutdown(&self) {
        self.shared.terminate.store(true, Ordering::Release);

        let task = self.accept_task.lock().expect("Accept task poisoned").take();
        if let Some(task) = task {
            drop(task.join());
        }

        for client_id in 1..=self.shared.max_clients {
            drop(self.disconnect_client(client_id));
        }

        if let Some(udp) = &self.shared.udp {
            udp.set_router(None);
            udp.close();
        }
    }

    pub fn should_destroy(&self) -> bool {
        self.shared.destroy_requested.load(Ordering::Acquire)
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerShared {
    fn lock_client(&self, client_id: ClientId) -> NetResult<MutexGuard<ClientRecord>> {
        if client_id == 0 || client_id > self.max_clients {
            return Err(Error::InvalidClientId);
        }

        Ok(self.clients[client_id].lock().expect("Client record poisoned"))
    }

    fn active_snapshot(&self) -> Vec<ClientId> {
        self.active
            .lock()
            .expect("Active set poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Smallest unused client id. Allocation is totally ordered: only the accept thread calls
    /// this.
    fn allocate_client(&self) -> Option<ClientId> {
        for client_id in 1..=self.max_clients {
            let mut record = self.clients[client_id].lock().expect("Client record poisoned");

            if record.state == InstanceState::Inactive {
                record.state = InstanceState::ServerClient;
                record.status = ConnectionStatus::ConnectedAc;
                self.active.lock().expect("Active set poisoned").insert(client_id);
                return Some(client_id);
            }
        }

        None
    }

    fn release_record(&self, client_id: ClientId, record: &mut ClientRecord) {
        if record.state == InstanceState::Inactive {
            return;
        }

        let had_joined = record.is_joined();

        if let Some(tcp) = record.tcp.take() {
            tcp.close();
        }

        if record.udp_addr.is_specified() {
            self.addr_map
                .lock()
                .expect("Address map poisoned")
                .remove(&record.udp_addr);
        }

        if let Some(udp) = &self.udp {
            if let Some(mode) = udp.mode() {
                drop(mode.reset(client_id));
            }
        }

        record.state = InstanceState::Inactive;
        record.status = ConnectionStatus::NotConnected;
        record.udp_addr.clear();
        record.tokens = [0; AUTH_STRENGTH];
        record.deadline = None;

        self.active.lock().expect("Active set poisoned").shift_remove(&client_id);

        if had_joined {
            self.left.lock().expect("Left queue poisoned").push_back(client_id);
        }

        logging::debug!(self.log, "client slot released";
                        "context" => "disconnect", "client_id" => client_id, "joined" => had_joined);
    }

    /// Validates an authentication datagram from an unknown source and binds the client's UDP
    /// endpoint on success. Duplicate or forged attempts are silently dropped.
    fn try_authenticate(&self, datagram: &[u8], from: Address) -> bool {
        if datagram.len() != AUTH_DATAGRAM_SIZE {
            return false;
        }

        if LittleEndian::read_u32(&datagram[..4]) != 0 {
            return false;
        }

        let client_id = LittleEndian::read_u32(&datagram[4..8]) as ClientId;
        if client_id == 0 || client_id > self.max_clients {
            return false;
        }

        let mut record = self.clients[client_id].lock().expect("Client record poisoned");

        if record.state != InstanceState::ServerClient || record.status != ConnectionStatus::ConnectedAc {
            return false;
        }

        for (index, token) in record.tokens.iter().enumerate() {
            let offered = LittleEndian::read_i32(&datagram[8 + index * 4..12 + index * 4]);
            if offered != *token {
                logging::warn!(self.log, "authentication token mismatch";
                               "context" => "handshake", "client_id" => client_id, "from" => %from);
                return false;
            }
        }

        record.udp_addr = from;
        record.status = ConnectionStatus::Connected;
        record.deadline = None;

        self.addr_map
            .lock()
            .expect("Address map poisoned")
            .insert(from, client_id);

        // The empty TCP packet is the handshake ack.
        if let Some(tcp) = &record.tcp {
            drop(tcp.send(&Packet::new(), false, 0));
        }

        self.joined.lock().expect("Joined queue poisoned").push_back(client_id);

        logging::debug!(self.log, "client authenticated";
                        "context" => "handshake", "client_id" => client_id, "udp_addr" => %from);

        true
    }
}

struct ServerRouter {
    shared: Weak<ServerShared>,
}

impl DatagramRouter for ServerRouter {
    fn route(&self, datagram: &[u8], from: Address) -> Disposition {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Disposition::Drop,
        };

        let known = shared
            .addr_map
            .lock()
            .expect("Address map poisoned")
            .get(&from)
            .copied();

        if let Some(client_id) = known {
            return Disposition::Deliver(client_id);
        }

        if shared.try_authenticate(datagram, from) {
            Disposition::Consumed
        } else {
            Disposition::Drop
        }
    }
}

fn accept_loop(shared: Arc<ServerShared>, mut listener: ListeningSocket) {
    logging::debug!(shared.log, "accept loop started";
                    "context" => "accept",
                    "address" => %listener.local_addr().map(|a| a.to_string()).unwrap_or_default());

    while !shared.terminate.load(Ordering::Acquire) {
        housekeeping(&shared);

        match listener.accept(Duration::from_millis(100)) {
            Ok(Some((stream, from))) => {
                if let Err(err) = handle_accept(&shared, stream, from) {
                    set_last_error(&err);
                    logging::warn!(shared.log, "accept handling failed";
                                   "context" => "accept", "error" => ?err);
                }
            }
            Ok(None) => {}
            Err(err) => {
                set_last_error(&err);
                logging::error!(shared.log, "accept failed"; "context" => "accept", "error" => ?err);
                thread::sleep(Duration::from_millis(HANDSHAKE_POLL_MS));
            }
        }
    }

    logging::debug!(shared.log, "accept loop stopped"; "context" => "accept");
}

fn handle_accept(shared: &Arc<ServerShared>, stream: mio::net::TcpStream, from: Address) -> NetResult<()> {
    let client_id = match shared.allocate_client() {
        Some(client_id) => client_id,
        None => {
            // Server full: the connection is dropped outright.
            logging::warn!(shared.log, "connection refused, no free client slot";
                           "context" => "accept", "from" => %from);
            return Ok(());
        }
    };

    let result = install_client(shared, client_id, stream, from);

    if result.is_err() {
        let mut record = shared.clients[client_id].lock().expect("Client record poisoned");
        shared.release_record(client_id, &mut record);
    }

    result
}

fn install_client(
    shared: &Arc<ServerShared>,
    client_id: ClientId,
    stream: mio::net::TcpStream,
    from: Address,
) -> NetResult<()> {
    let tcp = TcpSocket::from_stream(
        stream,
        shared.profile.tcp_socket_config(),
        Some(shared.profile.build_tcp_mode()),
        shared.instance_id,
        client_id,
        shared.log.new(logging::o!("socket" => "tcp", "client_id" => client_id)),
    )?;

    tcp.core().set_recv_fn(shared.recv_tcp_fn.lock().expect("Callback slot poisoned").clone());

    let mut tokens = [0i32; AUTH_STRENGTH];
    for token in tokens.iter_mut() {
        *token = quark::crypto::random_u32() as i32;
    }

    // Welcome: capacity, UDP negotiation fields, the allocated id and the authentication
    // tokens the client must echo over UDP.
    let mut welcome = Packet::new();
    welcome.add_size(shared.max_clients);
    if shared.profile.udp_enabled {
        welcome.add_size(shared.profile.num_operations);
        welcome.add_u8(shared.profile.mode_udp.mode_id().to_wire());
    }
    welcome.add_size(client_id);
    if shared.profile.udp_enabled {
        for token in &tokens {
            welcome.add_i32(*token);
        }
    }

    match tcp.send(&welcome, false, 0)? {
        SendStatus::Completed | SendStatus::InProgress => {}
        _ => return Err(Error::Closed),
    }

    tcp.recv()?;

    {
        let mut record = shared.clients[client_id].lock().expect("Client record poisoned");
        record.tcp = Some(tcp);
        record.tokens = tokens;
        record.deadline = Some(Timer::new(shared.profile.connection_to_server_timeout_ms));

        if !shared.profile.udp_enabled {
            record.status = ConnectionStatus::Connected;
            record.deadline = None;
            shared.joined.lock().expect("Joined queue poisoned").push_back(client_id);
        }
    }

    logging::debug!(shared.log, "client accepted";
                    "context" => "accept", "client_id" => client_id, "from" => %from);

    Ok(())
}

/// Periodic pass over the occupied client records: handshake deadlines, worker-reported
/// failures and graceful disconnect draining. Runs on the accept thread between waits.
fn housekeeping(shared: &Arc<ServerShared>) {
    for client_id in shared.active_snapshot() {
        let mut record = shared.clients[client_id].lock().expect("Client record poisoned");

        if record.state == InstanceState::Inactive {
            continue;
        }

        let tcp = match &record.tcp {
            Some(tcp) => tcp.clone(),
            None => continue,
        };

        let mut close = tcp.core().close_requested();

        // UDP authentication never arrived in time.
        if !close && record.status == ConnectionStatus::ConnectedAc {
            if let Some(deadline) = &record.deadline {
                if deadline.expired() {
                    logging::debug!(shared.log, "handshake timed out";
                                    "context" => "housekeeping", "client_id" => client_id);
                    close = true;
                }
            }
        }

        // Peer half-closed: drain what is queued, then close.
        if !close && tcp.fin_received() {
            if record.status == ConnectionStatus::Connected {
                record.status = ConnectionStatus::NoRecv;
            }

            let drained = tcp.mode().map(|mode| mode.packet_amount() == 0).unwrap_or(true);

            if !shared.profile.graceful_disconnect_enabled || drained {
                close = true;
            }
        }

        if close {
            shared.release_record(client_id, &mut record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::client::ClientInstance;
    use crate::instance::profile::UdpModeChoice;
    use std::time::Instant;

    fn start_engine() {
        crate::engine::start(2, logging::discard()).unwrap();
    }

    fn test_profile() -> InstanceProfile {
        let mut profile = InstanceProfile::default();
        profile.mode_udp = UdpModeChoice::CatchAllNo;
        profile.connection_to_server_timeout_ms = 5_000;
        profile
    }

    fn localhost_any() -> Address {
        Address::parse("127.0.0.1:0").unwrap()
    }

    fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_handshake_happy_path_and_data_exchange() {
        start_engine();

        let profile = test_profile();
        let server = ServerInstance::new(
            1,
            localhost_any(),
            Some(localhost_any()),
            4,
            profile.clone(),
            logging::discard(),
        )
        .unwrap();

        let client = ClientInstance::new(2, profile, logging::discard()).unwrap();
        let status = client
            .connect(server.tcp_addr(), server.udp_addr(), 5_000, true)
            .unwrap();

        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(client.client_id(), 1);
        assert_eq!(client.max_clients(), 4);
        assert!(client.client_connected());

        wait_until("join notification", || server.next_joined() == Some(1));
        assert!(server.client_connected(1).unwrap());

        // Client to server over the stream.
        client.send_tcp(&Packet::from_str("hello server"), false).unwrap();

        let mut received = Packet::new();
        wait_until("tcp packet at server", || server.recv_tcp(1, &mut received).unwrap() == 1);
        assert_eq!(received, "hello server");
        assert_eq!(received.client_from(), 1);

        // Server to client over the stream.
        server.send_tcp(1, &Packet::from_str("hello client"), false).unwrap();
        wait_until("tcp packet at client", || client.recv_tcp(&mut received).unwrap() == 1);
        assert_eq!(received, "hello client");

        // Client to server over datagrams; the counter gate delivers the first data counter.
        client.send_udp(&Packet::from_str("dgram up"), false).unwrap();
        wait_until("udp packet at server", || {
            server.recv_udp(&mut received, 1, 0).unwrap() == 1
        });
        assert_eq!(received, "dgram up");

        // Server to client.
        server.send_udp(1, &Packet::from_str("dgram down"), false).unwrap();
        wait_until("udp packet at client", || {
            client.recv_udp(&mut received, 0, 0).unwrap() == 1
        });
        assert_eq!(received, "dgram down");

        // A second client receives the next free id.
        let second = ClientInstance::new(3, test_profile(), logging::discard()).unwrap();
        let status = second
            .connect(server.tcp_addr(), server.udp_addr(), 5_000, true)
            .unwrap();

        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(second.client_id(), 2);
        wait_until("second join", || server.next_joined() == Some(2));

        client.disconnect();
        second.disconnect();
        server.shutdown();
    }

    #[test]
    fn test_handshake_timeout_when_server_never_responds() {
        start_engine();

        // A bare listener accepts the stream but never sends a welcome.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target: Address = silent.local_addr().unwrap().into();

        let client = ClientInstance::new(7, test_profile(), logging::discard()).unwrap();
        let status = client
            .connect(target, Some(Address::parse("127.0.0.1:9").unwrap()), 200, true)
            .unwrap();

        assert_eq!(status, ConnectionStatus::TimedOut);
        assert_eq!(client.poll_connect(), ConnectionStatus::TimedOut);

        // The underlying sockets were torn down and nothing is left in flight.
        let tcp = client.tcp_socket().unwrap();
        assert!(tcp.core().is_closed());
        assert_eq!(tcp.core().send_memory_size(), 0);
    }

    #[test]
    fn test_connect_refused() {
        start_engine();

        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = Address::parse(&format!("127.0.0.1:{}", port)).unwrap();

        let client = ClientInstance::new(8, test_profile(), logging::discard()).unwrap();
        let status = client
            .connect(target, Some(Address::parse("127.0.0.1:9").unwrap()), 5_000, true)
            .unwrap();

        assert_eq!(status, ConnectionStatus::Refused);
    }

    #[test]
    fn test_handshake_without_udp() {
        start_engine();

        let mut profile = test_profile();
        profile.udp_enabled = false;

        let server =
            ServerInstance::new(4, localhost_any(), None, 2, profile.clone(), logging::discard()).unwrap();

        let client = ClientInstance::new(5, profile, logging::discard()).unwrap();
        let status = client.connect(server.tcp_addr(), None, 5_000, true).unwrap();

        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(client.client_id(), 1);

        wait_until("join notification", || server.next_joined() == Some(1));

        client.send_tcp(&Packet::from_str("tcp only"), false).unwrap();

        let mut received = Packet::new();
        wait_until("tcp packet at server", || server.recv_tcp(1, &mut received).unwrap() == 1);
        assert_eq!(received, "tcp only");

        client.disconnect();
        server.shutdown();
    }

    #[test]
    fn test_server_full_keeps_capacity_invariant() {
        start_engine();

        let profile = test_profile();
        let server = ServerInstance::new(
            6,
            localhost_any(),
            Some(localhost_any()),
            1,
            profile.clone(),
            logging::discard(),
        )
        .unwrap();

        let first = ClientInstance::new(9, profile.clone(), logging::discard()).unwrap();
        assert_eq!(
            first.connect(server.tcp_addr(), server.udp_addr(), 5_000, true).unwrap(),
            ConnectionStatus::Connected
        );

        // No free slot: the second connection is dropped and its handshake starves out.
        let second = ClientInstance::new(10, profile, logging::discard()).unwrap();
        let status = second
            .connect(server.tcp_addr(), server.udp_addr(), 300, true)
            .unwrap();

        assert_ne!(status, ConnectionStatus::Connected);
        assert_eq!(server.connected_count(), 1);

        first.disconnect();
        server.shutdown();
    }

    #[test]
    fn test_disconnect_client_queues_left_notification() {
        start_engine();

        let profile = test_profile();
        let server = ServerInstance::new(
            11,
            localhost_any(),
            Some(localhost_any()),
            2,
            profile.clone(),
            logging::discard(),
        )
        .unwrap();

        let client = ClientInstance::new(12, profile, logging::discard()).unwrap();
        client.connect(server.tcp_addr(), server.udp_addr(), 5_000, true).unwrap();

        wait_until("join notification", || server.next_joined() == Some(1));

        server.disconnect_client(1).unwrap();
        assert_eq!(server.next_left(), Some(1));
        assert!(!server.client_connected(1).unwrap());

        // The slot is reusable afterwards.
        let again = ClientInstance::new(13, test_profile(), logging::discard()).unwrap();
        let status = again
            .connect(server.tcp_addr(), server.udp_addr(), 5_000, true)
            .unwrap();
        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(again.client_id(), 1);

        again.disconnect();
        server.shutdown();
    }
}
