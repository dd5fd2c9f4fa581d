use crate::address::Address;
use crate::error::{Error, NetResult, SendStatus};
use crate::instance::profile::InstanceProfile;
use crate::mode::udp::generate_udp_mode;
use crate::mode::{RecvCallback, UdpModeId};
use crate::packet::Packet;
use crate::socket::UdpSocket;
use crate::InstanceId;
use quark::logging;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connectionless broadcast instance: a single UDP socket constructed with the reuse and
/// broadcast flags set and a catch-all mode. No handshake, no remote records; receive tolerates
/// a configured number of consecutive failures before reporting fatal.
pub struct BroadcastInstance {
    instance_id: InstanceId,
    profile: InstanceProfile,
    udp: Arc<UdpSocket>,
    destroy_requested: AtomicBool,
    log: logging::Logger,
}

impl BroadcastInstance {
    /// Binds `local` and targets `broadcast_addr` for plain sends. With `recv_enabled` the
    /// socket starts receiving immediately.
    pub fn new(
        instance_id: InstanceId,
        broadcast_addr: Address,
        local: Address,
        recv_enabled: bool,
        profile: InstanceProfile,
        log: logging::Logger,
    ) -> NetResult<BroadcastInstance> {
        let udp = UdpSocket::bind(
            local,
            profile.udp_socket_config(),
            true,
            true,
            instance_id,
            0,
            log.new(logging::o!("socket" => "udp")),
        )?;

        udp.set_remote(broadcast_addr);

        // Broadcast traffic is unaddressed; everything lands in the catch-all store.
        let config = profile.udp_mode_config(0, false)?;
        udp.load_mode(generate_udp_mode(UdpModeId::CatchAll, &config));

        if recv_enabled {
            udp.recv()?;
        }

        logging::debug!(log, "broadcast instance ready";
                        "context" => "broadcast", "target" => %broadcast_addr, "recv" => recv_enabled);

        Ok(BroadcastInstance {
            instance_id,
            profile,
            udp,
            destroy_requested: AtomicBool::new(false),
            log,
        })
    }

    #[inline]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Sends to the configured broadcast address.
    pub fn send_udp(&self, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        self.udp.send(packet, block, self.profile.send_timeout_ms)
    }

    /// Sends to an arbitrary remote.
    pub fn send_to_udp(&self, target: Address, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        self.udp.send_to(target, packet, block, self.profile.send_timeout_ms)
    }

    /// Pulls the oldest received datagram packet.
    pub fn recv_udp(&self, destination: &mut Packet) -> NetResult<usize> {
        let mode = self.udp.mode().ok_or(Error::ModeNotLoaded)?;
        mode.get_packet(destination, 0, 0)
    }

    /// Source address of the most recently received datagram.
    pub fn last_from(&self) -> Address {
        self.udp.last_from()
    }

    pub fn set_recv_fn(&self, recv_fn: Option<RecvCallback>) {
        self.udp.core().set_recv_fn(recv_fn);
    }

    /// Polls the failure flags workers have recorded. True once the consecutive receive failure
    /// tolerance was exhausted or a fatal send error occurred.
    pub fn should_destroy(&self) -> bool {
        if self.udp.core().close_requested() {
            self.destroy_requested.store(true, Ordering::Release);
        }

        self.destroy_requested.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.udp.close();
        logging::debug!(self.log, "broadcast instance closed"; "context" => "broadcast");
    }
}

impl Drop for BroadcastInstance {
    fn drop(&mut self) {
        self.close();
    }
}
