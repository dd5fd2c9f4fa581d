//! UDP framing strategies. Stores are per-client; variants differ in how arrivals are gated
//! (kernel order, monotonic counter, newest-wins freshness) and in the routing prefixes they
//! put on the wire.

use crate::error::{Error, NetResult};
use crate::memory::{BoundedPacketRecycler, MemoryTracker};
use crate::mode::{PacketStore, RecvCallback, UdpMode, UdpModeId};
use crate::packet::Packet;
use crate::{ClientId, InstanceId, OperationId};
use byteorder::{ByteOrder, LittleEndian};
use quark::crypto::EncryptKey;
use quark::time::clock_ms;
use std::sync::{Arc, Mutex};

/// Counter value reserved for connection/handshake datagrams; data consumers drop it.
pub const CONNECTION_COUNTER: u32 = 0;

/// First counter a sender uses.
const INITIAL_SEND_COUNTER: u32 = 1;

/// Recorded value that accepts any first data counter.
const INITIAL_RECV_COUNTER: u32 = 0;

/// Shape shared by the mode constructors.
#[derive(Clone)]
pub struct UdpModeConfig {
    pub num_clients: usize,
    pub num_operations: usize,
    /// Server side: outbound datagrams carry the client routing prefix, inbound ones do not.
    pub server: bool,
    pub decrypt_key: Option<Arc<EncryptKey>>,
    pub recycle_packets: usize,
    pub recycle_packet_bytes: usize,
    pub recv_memory_limit: usize,
}

/// Builds the mode named by a discriminant. Servers use the profile's choice, clients the
/// discriminant delivered in the welcome packet.
pub fn generate_udp_mode(id: UdpModeId, config: &UdpModeConfig) -> Arc<dyn UdpMode> {
    match id {
        UdpModeId::CatchAll => Arc::new(UdpCatchAllMode::new(config)),
        UdpModeId::CatchAllNo => Arc::new(UdpCatchAllNoMode::new(config)),
        UdpModeId::PerClient => Arc::new(UdpPerClientMode::new(config, false)),
        UdpModeId::PerClientPerOperation => Arc::new(UdpPerClientMode::new(config, true)),
    }
}

fn read_prefix(data: &[u8], offset: &mut usize) -> NetResult<u32> {
    if data.len() - *offset < 4 {
        return Err(Error::ShortRead);
    }

    let value = LittleEndian::read_u32(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(value)
}

struct ClientQueue {
    store: PacketStore,
    recycler: BoundedPacketRecycler,
}

impl ClientQueue {
    fn new(config: &UdpModeConfig) -> ClientQueue {
        ClientQueue {
            store: PacketStore::new(),
            recycler: BoundedPacketRecycler::new(
                config.recycle_packets,
                config.recycle_packet_bytes,
                config.recv_memory_limit,
            ),
        }
    }

    fn dispatch(&self, shell: Packet, recv_fn: Option<&RecvCallback>) {
        match recv_fn {
            Some(recv_fn) => {
                recv_fn(&shell);
                self.recycler.recycle(shell);
            }
            None => self.store.push(shell),
        }
    }

    fn pull(&self, destination: &mut Packet) -> usize {
        match self.store.pull() {
            Some(shell) => {
                destination.load(
                    shell.as_slice(),
                    shell.client_from(),
                    shell.operation(),
                    shell.instance(),
                    shell.age(),
                );
                self.recycler.recycle(shell);
                1
            }
            None => 0,
        }
    }

    fn clear(&self) {
        for shell in self.store.drain() {
            self.recycler.recycle(shell);
        }
    }
}

/// Every datagram is enqueued into the recipient client's FIFO exactly as the kernel delivered
/// it; ordering and duplicates are preserved.
pub struct UdpCatchAllMode {
    clients: Vec<ClientQueue>,
}

impl UdpCatchAllMode {
    pub fn new(config: &UdpModeConfig) -> UdpCatchAllMode {
        UdpCatchAllMode {
            // Slot 0 is the local/server entity.
            clients: (0..=config.num_clients).map(|_| ClientQueue::new(config)).collect(),
        }
    }

    fn queue(&self, client_id: ClientId) -> NetResult<&ClientQueue> {
        self.clients.get(client_id).ok_or(Error::InvalidClientId)
    }
}

impl UdpMode for UdpCatchAllMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let queue = self.queue(client_id)?;

        let mut shell = queue.recycler.get(data.len())?;
        shell.load(data, client_id, 0, instance_id, 0);
        queue.dispatch(shell, recv_fn);
        Ok(())
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        let mut composite = Packet::with_memory(packet.used_size());
        composite.add_bytes(packet.as_slice());
        Ok(composite)
    }

    fn reset(&self, client_id: ClientId) -> NetResult<()> {
        self.queue(client_id)?.clear();
        Ok(())
    }

    fn reset_all(&self) {
        for queue in &self.clients {
            queue.clear();
        }
    }

    fn packet_amount(&self, client_id: ClientId, _operation_id: OperationId) -> NetResult<usize> {
        Ok(self.queue(client_id)?.store.len())
    }

    fn get_packet(
        &self,
        destination: &mut Packet,
        client_id: ClientId,
        _operation_id: OperationId,
    ) -> NetResult<usize> {
        Ok(self.queue(client_id)?.pull(destination))
    }

    fn memory_size(&self, client_id: ClientId) -> NetResult<usize> {
        Ok(self.queue(client_id)?.recycler.memory_size())
    }

    fn memory_limit(&self, client_id: ClientId) -> NetResult<usize> {
        Ok(self.queue(client_id)?.recycler.memory_limit())
    }

    fn set_memory_limit(&self, client_id: ClientId, limit: usize) -> NetResult<()> {
        self.queue(client_id)?.recycler.set_memory_limit(limit);
        Ok(())
    }

    fn num_clients(&self) -> usize {
        self.clients.len() - 1
    }

    fn num_operations(&self) -> usize {
        1
    }

    fn mode_id(&self) -> UdpModeId {
        UdpModeId::CatchAll
    }
}

/// Catch-all with a monotonic counter gate: a `u32` counter is prefixed to every sent datagram
/// and receivers drop anything not strictly newer than the last delivery, so the delivered
/// counter sequence is strictly increasing modulo a single wrap.
pub struct UdpCatchAllNoMode {
    base: UdpCatchAllMode,
    send_counters: Vec<Mutex<u32>>,
    recv_counters: Vec<Mutex<u32>>,
}

impl UdpCatchAllNoMode {
    pub fn new(config: &UdpModeConfig) -> UdpCatchAllNoMode {
        UdpCatchAllNoMode {
            base: UdpCatchAllMode::new(config),
            send_counters: (0..=config.num_clients)
                .map(|_| Mutex::new(INITIAL_SEND_COUNTER))
                .collect(),
            recv_counters: (0..=config.num_clients)
                .map(|_| Mutex::new(INITIAL_RECV_COUNTER))
                .collect(),
        }
    }

    pub fn recv_counter(&self, client_id: ClientId) -> NetResult<u32> {
        Ok(*self
            .recv_counters
            .get(client_id)
            .ok_or(Error::InvalidClientId)?
            .lock()
            .expect("Counter poisoned"))
    }

    pub fn set_recv_counter(&self, client_id: ClientId, value: u32) -> NetResult<()> {
        *self
            .recv_counters
            .get(client_id)
            .ok_or(Error::InvalidClientId)?
            .lock()
            .expect("Counter poisoned") = value;
        Ok(())
    }
}

impl UdpMode for UdpCatchAllNoMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let queue = self.base.queue(client_id)?;

        let mut offset = 0;
        let counter = read_prefix(data, &mut offset)?;

        // Handshake datagrams never reach data consumers.
        if counter == CONNECTION_COUNTER {
            return Ok(());
        }

        let mut recorded = self.recv_counters[client_id].lock().expect("Counter poisoned");

        if counter <= *recorded {
            // An observed counter far below the record means the sender wrapped; reset and
            // re-evaluate so the stream keeps flowing forever.
            if *recorded - counter > u32::max_value() / 2 {
                *recorded = INITIAL_RECV_COUNTER;
            } else {
                return Ok(());
            }
        }

        let payload = &data[offset..];
        let mut shell = queue.recycler.get(payload.len())?;
        shell.load(payload, client_id, 0, instance_id, counter);

        *recorded = counter;
        drop(recorded);

        queue.dispatch(shell, recv_fn);
        Ok(())
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        let counters = self
            .send_counters
            .get(packet.client_from())
            .ok_or(Error::InvalidClientId)?;

        let mut counter = counters.lock().expect("Counter poisoned");

        let mut composite = Packet::with_memory(4 + packet.used_size());
        composite.add_u32(*counter);
        composite.add_bytes(packet.as_slice());

        // Post-increment, skipping the reserved handshake value on wrap.
        *counter = match counter.wrapping_add(1) {
            CONNECTION_COUNTER => INITIAL_SEND_COUNTER,
            next => next,
        };

        Ok(composite)
    }

    fn reset(&self, client_id: ClientId) -> NetResult<()> {
        self.base.reset(client_id)?;

        *self.send_counters[client_id].lock().expect("Counter poisoned") = INITIAL_SEND_COUNTER;
        *self.recv_counters[client_id].lock().expect("Counter poisoned") = INITIAL_RECV_COUNTER;
        Ok(())
    }

    fn reset_all(&self) {
        for client_id in 0..self.send_counters.len() {
            drop(self.reset(client_id));
        }
    }

    fn packet_amount(&self, client_id: ClientId, operation_id: OperationId) -> NetResult<usize> {
        self.base.packet_amount(client_id, operation_id)
    }

    fn get_packet(
        &self,
        destination: &mut Packet,
        client_id: ClientId,
        operation_id: OperationId,
    ) -> NetResult<usize> {
        self.base.get_packet(destination, client_id, operation_id)
    }

    fn memory_size(&self, client_id: ClientId) -> NetResult<usize> {
        self.base.memory_size(client_id)
    }

    fn memory_limit(&self, client_id: ClientId) -> NetResult<usize> {
        self.base.memory_limit(client_id)
    }

    fn set_memory_limit(&self, client_id: ClientId, limit: usize) -> NetResult<()> {
        self.base.set_memory_limit(client_id, limit)
    }

    fn num_clients(&self) -> usize {
        self.base.num_clients()
    }

    fn num_operations(&self) -> usize {
        1
    }

    fn mode_id(&self) -> UdpModeId {
        UdpModeId::CatchAllNo
    }
}

struct FreshnessSlot {
    packet: Option<Packet>,
    age: u32,
}

/// Per-client (optionally per-operation) freshness store. Each slot keeps only the newest
/// packet by age stamp; an unread older packet is overwritten outright, out-of-date arrivals
/// are discarded. Optional decryption is applied before framing.
pub struct UdpPerClientMode {
    slots: Vec<Vec<Mutex<FreshnessSlot>>>,
    trackers: Vec<MemoryTracker>,
    num_operations: usize,
    per_operation: bool,
    server: bool,
    decrypt_key: Option<Arc<EncryptKey>>,
}

impl UdpPerClientMode {
    pub fn new(config: &UdpModeConfig, per_operation: bool) -> UdpPerClientMode {
        let num_operations = if per_operation { config.num_operations.max(1) } else { 1 };

        UdpPerClientMode {
            slots: (0..=config.num_clients)
                .map(|_| {
                    (0..num_operations)
                        .map(|_| Mutex::new(FreshnessSlot { packet: None, age: 0 }))
                        .collect()
                })
                .collect(),
            trackers: (0..=config.num_clients)
                .map(|_| MemoryTracker::bounded(config.recv_memory_limit))
                .collect(),
            num_operations,
            per_operation,
            server: config.server,
            decrypt_key: config.decrypt_key.clone(),
        }
    }

    fn slot(&self, client_id: ClientId, operation_id: OperationId) -> NetResult<&Mutex<FreshnessSlot>> {
        self.slots
            .get(client_id)
            .ok_or(Error::InvalidClientId)?
            .get(operation_id)
            .ok_or(Error::InvalidOperationId)
    }
}

impl UdpMode for UdpPerClientMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let opened;
        let view: &[u8] = match &self.decrypt_key {
            Some(key) => {
                opened = quark::crypto::open(data, key).ok_or(Error::UdpDecryptFailed)?;
                &opened
            }
            None => data,
        };

        let mut offset = 0;

        // The server resolves the client from the source address; the client reads the routing
        // prefix the server put on the wire.
        let client_id = if self.server {
            client_id
        } else {
            read_prefix(view, &mut offset)? as ClientId
        };

        let operation_id = if self.per_operation {
            read_prefix(view, &mut offset)? as OperationId
        } else {
            0
        };

        let age = read_prefix(view, &mut offset)?;
        let payload = &view[offset..];

        let slot = self.slot(client_id, operation_id)?;
        let mut slot = slot.lock().expect("Freshness slot poisoned");

        if age < slot.age {
            if slot.age - age > u32::max_value() / 2 {
                // The peer's clock wrapped; accept and restart the record.
                slot.age = 0;
            } else {
                return Ok(());
            }
        }

        if let Some(recv_fn) = recv_fn {
            let mut packet = Packet::with_memory(payload.len());
            packet.load(payload, client_id, operation_id, instance_id, age);
            slot.age = age;
            recv_fn(&packet);
            return Ok(());
        }

        // Newest wins: replace whatever is in the slot, charging only the size difference.
        let tracker = &self.trackers[client_id];
        let old_size = slot.packet.as_ref().map(|packet| packet.used_size()).unwrap_or(0);

        if payload.len() > old_size {
            tracker.increase(payload.len() - old_size)?;
        } else {
            tracker.decrease(old_size - payload.len())?;
        }

        let mut packet = match slot.packet.take() {
            Some(mut shell) => {
                shell.clear();
                shell
            }
            None => Packet::with_memory(payload.len()),
        };
        packet.load(payload, client_id, operation_id, instance_id, age);

        slot.packet = Some(packet);
        slot.age = age;
        Ok(())
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        let mut composite = Packet::with_memory(12 + packet.used_size());

        if self.server {
            if packet.client_from() > u32::max_value() as usize {
                return Err(Error::InvalidClientId);
            }
            composite.add_u32(packet.client_from() as u32);
        }

        if self.per_operation {
            if packet.operation() >= self.num_operations {
                return Err(Error::InvalidOperationId);
            }
            composite.add_u32(packet.operation() as u32);
        }

        composite.add_u32(clock_ms());
        composite.add_bytes(packet.as_slice());
        Ok(composite)
    }

    fn reset(&self, client_id: ClientId) -> NetResult<()> {
        let operations = self.slots.get(client_id).ok_or(Error::InvalidClientId)?;
        let tracker = &self.trackers[client_id];

        for slot in operations {
            let mut slot = slot.lock().expect("Freshness slot poisoned");

            if let Some(packet) = slot.packet.take() {
                tracker
                    .decrease(packet.used_size())
                    .expect("Receive accounting underflow");
            }
            slot.age = 0;
        }

        Ok(())
    }

    fn reset_all(&self) {
        for client_id in 0..self.slots.len() {
            drop(self.reset(client_id));
        }
    }

    fn packet_amount(&self, client_id: ClientId, operation_id: OperationId) -> NetResult<usize> {
        let slot = self.slot(client_id, operation_id)?.lock().expect("Freshness slot poisoned");
        Ok(slot.packet.is_some() as usize)
    }

    fn get_packet(
        &self,
        destination: &mut Packet,
        client_id: ClientId,
        operation_id: OperationId,
    ) -> NetResult<usize> {
        let mut slot = self.slot(client_id, operation_id)?.lock().expect("Freshness slot poisoned");

        match slot.packet.take() {
            Some(packet) => {
                self.trackers[client_id]
                    .decrease(packet.used_size())
                    .expect("Receive accounting underflow");

                destination.load(
                    packet.as_slice(),
                    packet.client_from(),
                    packet.operation(),
                    packet.instance(),
                    packet.age(),
                );
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn memory_size(&self, client_id: ClientId) -> NetResult<usize> {
        Ok(self.trackers.get(client_id).ok_or(Error::InvalidClientId)?.used())
    }

    fn memory_limit(&self, client_id: ClientId) -> NetResult<usize> {
        Ok(self.trackers.get(client_id).ok_or(Error::InvalidClientId)?.limit())
    }

    fn set_memory_limit(&self, client_id: ClientId, limit: usize) -> NetResult<()> {
        self.trackers
            .get(client_id)
            .ok_or(Error::InvalidClientId)?
            .set_limit(limit);
        Ok(())
    }

    fn num_clients(&self) -> usize {
        self.slots.len() - 1
    }

    fn num_operations(&self) -> usize {
        self.num_operations
    }

    fn mode_id(&self) -> UdpModeId {
        if self.per_operation {
            UdpModeId::PerClientPerOperation
        } else {
            UdpModeId::PerClient
        }
    }
}
