//! Protocol-agnostic send/receive machinery plus the TCP and UDP specializations.

pub mod core;
pub mod listener;
pub mod send;
pub mod tcp;
pub mod udp;

pub use self::core::{SocketConfig, SocketCore};
pub use self::listener::ListeningSocket;
pub use self::send::{SendRecord, SendSignal};
pub use self::tcp::{ConnectPoll, TcpSocket};
pub use self::udp::{DatagramRouter, Disposition, UdpSocket};
pub use crate::mode::RecvCallback;
