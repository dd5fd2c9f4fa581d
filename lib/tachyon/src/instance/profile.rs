use crate::error::{Error, NetResult};
use crate::memory::{BoundedPacketRecycler, NO_LIMIT};
use crate::mode::tcp::{TcpPostfixMode, TcpPrefixMode, TcpRawMode};
use crate::mode::udp::UdpModeConfig;
use crate::mode::{TcpMode, UdpModeId};
use crate::socket::SocketConfig;
use quark::crypto::EncryptKey;
use serde_derive::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;

/// TCP framing choice as it appears in profiles.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcpModeChoice {
    LengthPrefix,
    Delimiter,
    Raw,
}

/// UDP framing choice as it appears in profiles.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UdpModeChoice {
    CatchAll,
    CatchAllNo,
    PerClient,
    PerClientPerOperation,
}

impl UdpModeChoice {
    pub fn mode_id(self) -> UdpModeId {
        match self {
            UdpModeChoice::CatchAll => UdpModeId::CatchAll,
            UdpModeChoice::CatchAllNo => UdpModeId::CatchAllNo,
            UdpModeChoice::PerClient => UdpModeId::PerClient,
            UdpModeChoice::PerClientPerOperation => UdpModeId::PerClientPerOperation,
        }
    }
}

/// Everything an instance needs to configure its sockets, modes and limits. Deserialized from
/// TOML; every field falls back to its default when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InstanceProfile {
    /// Max size of a single incoming TCP chunk and the partial packet ceiling.
    pub recv_buffer_size_tcp: usize,
    /// Max size of an incoming UDP datagram.
    pub recv_buffer_size_udp: usize,
    pub udp_enabled: bool,
    /// Base64 seed; when set, per-client UDP modes decrypt inbound datagrams.
    pub decrypt_key_udp: Option<String>,
    /// When disabled, TCP connect completes the connection and UDP must be disabled.
    pub handshake_enabled: bool,
    pub mode_tcp: TcpModeChoice,
    pub mode_udp: UdpModeChoice,
    /// Whether the partial buffer may grow past its ceiling.
    pub auto_resize_tcp: bool,
    /// Per-send wait before the entity is disconnected.
    pub send_timeout_ms: u64,
    pub graceful_disconnect_enabled: bool,
    pub nagle_enabled: bool,
    /// Delimiter bytes for delimiter framing.
    pub postfix_tcp: String,
    /// OS-level SO_REUSEADDR on the UDP socket.
    pub reusable_udp: bool,
    /// Overall handshake deadline.
    pub connection_to_server_timeout_ms: u64,
    /// Per-client operation count for the per-operation mode.
    pub num_operations: usize,
    pub send_memory_limit_tcp: usize,
    pub send_memory_limit_udp: usize,
    pub recv_memory_limit_tcp: usize,
    pub recv_memory_limit_udp: usize,
    pub recycle_tcp_packets: usize,
    pub recycle_tcp_packet_bytes: usize,
    pub recycle_udp_packets: usize,
    pub recycle_udp_packet_bytes: usize,
    /// Consecutive UDP receive failures tolerated before the instance reports fatal.
    pub max_recv_failures_udp: usize,
}

impl Default for InstanceProfile {
    fn default() -> InstanceProfile {
        InstanceProfile {
            recv_buffer_size_tcp: 65536,
            recv_buffer_size_udp: 8192,
            udp_enabled: true,
            decrypt_key_udp: None,
            handshake_enabled: true,
            mode_tcp: TcpModeChoice::LengthPrefix,
            mode_udp: UdpModeChoice::CatchAll,
            auto_resize_tcp: false,
            send_timeout_ms: 10_000,
            graceful_disconnect_enabled: true,
            nagle_enabled: true,
            postfix_tcp: "\r\n".into(),
            reusable_udp: false,
            connection_to_server_timeout_ms: 15_000,
            num_operations: 1,
            send_memory_limit_tcp: NO_LIMIT,
            send_memory_limit_udp: NO_LIMIT,
            recv_memory_limit_tcp: NO_LIMIT,
            recv_memory_limit_udp: NO_LIMIT,
            recycle_tcp_packets: 32,
            recycle_tcp_packet_bytes: 8192,
            recycle_udp_packets: 32,
            recycle_udp_packet_bytes: 8192,
            max_recv_failures_udp: 10,
        }
    }
}

impl InstanceProfile {
    pub fn from_toml(text: &str) -> NetResult<InstanceProfile> {
        let profile: InstanceProfile =
            serdeconv::from_toml_str(text).map_err(|_| Error::Io(io::ErrorKind::InvalidData))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> NetResult<()> {
        // A handshake-free instance has no way to negotiate the UDP mode.
        if !self.handshake_enabled && self.udp_enabled {
            return Err(Error::ModeNotLoaded);
        }

        if self.postfix_tcp.is_empty() && self.mode_tcp == TcpModeChoice::Delimiter {
            return Err(Error::TcpPostfixNotFound);
        }

        Ok(())
    }

    pub fn tcp_socket_config(&self) -> SocketConfig {
        SocketConfig {
            recv_buffer_size: self.recv_buffer_size_tcp,
            send_memory_limit: self.send_memory_limit_tcp,
            max_recv_failures: 1,
            nagle: self.nagle_enabled,
            graceful_disconnect: self.graceful_disconnect_enabled,
        }
    }

    pub fn udp_socket_config(&self) -> SocketConfig {
        SocketConfig {
            recv_buffer_size: self.recv_buffer_size_udp,
            send_memory_limit: self.send_memory_limit_udp,
            max_recv_failures: self.max_recv_failures_udp,
            nagle: true,
            graceful_disconnect: false,
        }
    }

    /// Builds a fresh TCP framing mode per the profile. Each stream socket gets its own.
    pub fn build_tcp_mode(&self) -> Arc<dyn TcpMode> {
        let recycler = BoundedPacketRecycler::new(
            self.recycle_tcp_packets,
            self.recycle_tcp_packet_bytes,
            self.recv_memory_limit_tcp,
        );

        match self.mode_tcp {
            TcpModeChoice::LengthPrefix => Arc::new(TcpPrefixMode::new(
                self.recv_buffer_size_tcp,
                self.auto_resize_tcp,
                recycler,
            )),
            TcpModeChoice::Delimiter => Arc::new(TcpPostfixMode::new(
                self.recv_buffer_size_tcp,
                self.auto_resize_tcp,
                self.postfix_tcp.as_bytes().to_vec(),
                recycler,
            )),
            TcpModeChoice::Raw => Arc::new(TcpRawMode::new(recycler)),
        }
    }

    /// Decodes the profile's decrypt key, if any.
    pub fn decrypt_key(&self) -> NetResult<Option<Arc<EncryptKey>>> {
        match &self.decrypt_key_udp {
            None => Ok(None),
            Some(encoded) => {
                let seed = quark::encoding::base64::decode(encoded).map_err(|_| Error::UdpDecryptFailed)?;
                let key = EncryptKey::new(&seed).ok_or(Error::UdpDecryptFailed)?;
                Ok(Some(Arc::new(key)))
            }
        }
    }

    /// The UDP mode constructor shape for an instance with `num_clients` remote entities.
    pub fn udp_mode_config(&self, num_clients: usize, server: bool) -> NetResult<UdpModeConfig> {
        Ok(UdpModeConfig {
            num_clients,
            num_operations: self.num_operations,
            server,
            decrypt_key: self.decrypt_key()?,
            recycle_packets: self.recycle_udp_packets,
            recycle_packet_bytes: self.recycle_udp_packet_bytes,
            recv_memory_limit: self.recv_memory_limit_udp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let profile = InstanceProfile::default();

        assert_eq!(profile.mode_tcp, TcpModeChoice::LengthPrefix);
        assert_eq!(profile.mode_udp, UdpModeChoice::CatchAll);
        assert!(profile.handshake_enabled);
        assert_eq!(profile.postfix_tcp, "\r\n");
        profile.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let profile = InstanceProfile::from_toml(
            r#"
mode-tcp = "delimiter"
mode-udp = "per-client-per-operation"
num-operations = 4
recv-buffer-size-tcp = 1024
auto-resize-tcp = true
send-timeout-ms = 500
nagle-enabled = false
"#,
        )
        .unwrap();

        assert_eq!(profile.mode_tcp, TcpModeChoice::Delimiter);
        assert_eq!(profile.mode_udp, UdpModeChoice::PerClientPerOperation);
        assert_eq!(profile.num_operations, 4);
        assert_eq!(profile.recv_buffer_size_tcp, 1024);
        assert!(profile.auto_resize_tcp);
        assert_eq!(profile.send_timeout_ms, 500);
        assert!(!profile.nagle_enabled);

        // Untouched fields keep their defaults.
        assert!(profile.udp_enabled);
        assert_eq!(profile.recv_buffer_size_udp, 8192);
    }

    #[test]
    fn test_handshake_disabled_requires_udp_disabled() {
        let result = InstanceProfile::from_toml(
            r#"
handshake-enabled = false
udp-enabled = true
"#,
        );
        assert!(result.is_err());

        InstanceProfile::from_toml(
            r#"
handshake-enabled = false
udp-enabled = false
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_built_tcp_mode_matches_choice() {
        use crate::mode::TcpModeId;

        let mut profile = InstanceProfile::default();
        assert_eq!(profile.build_tcp_mode().mode_id(), TcpModeId::Prefix);

        profile.mode_tcp = TcpModeChoice::Delimiter;
        assert_eq!(profile.build_tcp_mode().mode_id(), TcpModeId::Postfix);

        profile.mode_tcp = TcpModeChoice::Raw;
        assert_eq!(profile.build_tcp_mode().mode_id(), TcpModeId::Raw);
    }

    #[test]
    fn test_decrypt_key_roundtrip() {
        let mut profile = InstanceProfile::default();
        assert!(profile.decrypt_key().unwrap().is_none());

        profile.decrypt_key_udp = Some(quark::encoding::base64::encode(&[7u8; 16]));
        assert!(profile.decrypt_key().unwrap().is_some());

        profile.decrypt_key_udp = Some("not base64!!!".into());
        assert!(profile.decrypt_key().is_err());
    }
}
