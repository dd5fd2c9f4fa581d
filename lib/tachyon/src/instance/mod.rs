//! Instance orchestrators: client, server and broadcast, each combining sockets, modes and a
//! role over the shared completion engine.

pub mod broadcast;
pub mod client;
pub mod profile;
pub mod server;

pub use self::broadcast::BroadcastInstance;
pub use self::client::ClientInstance;
pub use self::profile::{InstanceProfile, TcpModeChoice, UdpModeChoice};
pub use self::server::ServerInstance;

use crate::packet::Packet;
use crate::{ClientId, AUTH_STRENGTH};

/// Sleep between handshake poll steps.
pub(crate) const HANDSHAKE_POLL_MS: u64 = 1;

/// Period of the repeated UDP authentication datagram.
pub(crate) const HANDSHAKE_RESEND_MS: u64 = 10;

/// Builds the UDP authentication datagram: `[0][client_id][tokens]`. The leading zero marks a
/// connection packet so data consumers drop it.
pub(crate) fn build_auth_packet(client_id: ClientId, tokens: &[i32; AUTH_STRENGTH]) -> Packet {
    let mut packet = Packet::with_memory(8 + 4 * AUTH_STRENGTH);

    packet.add_size(0);
    packet.add_size(client_id);
    for token in tokens {
        packet.add_i32(*token);
    }

    packet
}
