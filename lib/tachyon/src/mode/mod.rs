//! Framing modes: the pluggable codecs that turn a raw TCP byte stream or UDP datagram stream
//! into discrete application packets, and wrap outbound packets into their wire form.

pub mod tcp;
pub mod udp;

use crate::error::{Error, NetResult};
use crate::packet::Packet;
use crate::{ClientId, InstanceId, OperationId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Callback invoked synchronously with each completed packet instead of queueing it.
pub type RecvCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

/// TCP framing strategy discriminants.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TcpModeId {
    /// `[u32 length][payload]`
    Prefix = 1,
    /// `[payload][postfix bytes]`
    Postfix = 2,
    /// Every received chunk is one packet.
    Raw = 3,
}

impl TcpModeId {
    pub fn from_wire(value: u8) -> NetResult<TcpModeId> {
        match value {
            1 => Ok(TcpModeId::Prefix),
            2 => Ok(TcpModeId::Postfix),
            3 => Ok(TcpModeId::Raw),
            _ => Err(Error::ModeNotLoaded),
        }
    }
}

/// UDP framing strategy discriminants; the numeric values travel in the welcome packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UdpModeId {
    CatchAll = 1,
    CatchAllNo = 2,
    PerClient = 3,
    PerClientPerOperation = 4,
}

impl UdpModeId {
    pub fn from_wire(value: u8) -> NetResult<UdpModeId> {
        match value {
            1 => Ok(UdpModeId::CatchAll),
            2 => Ok(UdpModeId::CatchAllNo),
            3 => Ok(UdpModeId::PerClient),
            4 => Ok(UdpModeId::PerClientPerOperation),
            _ => Err(Error::ModeNotLoaded),
        }
    }

    #[inline]
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// Framing policy attached to a TCP socket.
///
/// `deal_with_data` appends the received chunk to the mode's partial packet and extracts zero or
/// more complete packets; each one is either passed to `recv_fn` synchronously or pushed to the
/// mode's packet store for later pull.
pub trait TcpMode: Send + Sync {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()>;

    /// Wraps an outbound packet into its composite wire form (prefix + payload +/- postfix).
    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet>;

    /// Drops partial data and queued packets.
    fn reset(&self);

    /// Number of complete packets awaiting pull.
    fn packet_amount(&self) -> usize;

    /// Moves the oldest queued packet into `destination`. Returns the number of packets copied.
    fn get_packet(&self, destination: &mut Packet) -> usize;

    /// Fraction of the current partial packet already received, where the mode can know it.
    fn partial_percentage(&self) -> NetResult<f64>;

    /// Bytes currently held in the partial packet.
    fn partial_used(&self) -> usize;

    /// Bytes of completed packets charged against the receive ceiling.
    fn memory_size(&self) -> usize;

    fn memory_limit(&self) -> usize;

    fn mode_id(&self) -> TcpModeId;
}

/// Framing policy attached to a UDP socket. Stores are per-client; `client_id` 0 denotes the
/// local/server entity on a client instance.
pub trait UdpMode: Send + Sync {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()>;

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet>;

    /// Empties the client's store and resets its counters to initial values.
    fn reset(&self, client_id: ClientId) -> NetResult<()>;

    fn reset_all(&self);

    fn packet_amount(&self, client_id: ClientId, operation_id: OperationId) -> NetResult<usize>;

    fn get_packet(
        &self,
        destination: &mut Packet,
        client_id: ClientId,
        operation_id: OperationId,
    ) -> NetResult<usize>;

    fn memory_size(&self, client_id: ClientId) -> NetResult<usize>;

    fn memory_limit(&self, client_id: ClientId) -> NetResult<usize>;

    fn set_memory_limit(&self, client_id: ClientId, limit: usize) -> NetResult<()>;

    fn num_clients(&self) -> usize;

    fn num_operations(&self) -> usize;

    fn mode_id(&self) -> UdpModeId;
}

/// FIFO of complete packets awaiting application pull. Accounting lives with the recycler that
/// produced the packets, not here.
pub(crate) struct PacketStore {
    queue: Mutex<VecDeque<Packet>>,
}

impl PacketStore {
    pub fn new() -> PacketStore {
        PacketStore {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn push(&self, packet: Packet) {
        self.lock().push_back(packet);
    }

    #[inline]
    pub fn pull(&self) -> Option<Packet> {
        self.lock().pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn drain(&self) -> Vec<Packet> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<VecDeque<Packet>> {
        self.queue.lock().expect("Packet store poisoned")
    }
}
