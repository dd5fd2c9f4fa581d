use crate::error::NetResult;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;

/// IP and port value type. Clearable to the unspecified sentinel (`0.0.0.0:0`); equality is by
/// (ip, port).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Address {
    addr: SocketAddr,
}

impl Address {
    /// The unspecified sentinel.
    #[inline]
    pub fn unspecified() -> Address {
        Address {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    #[inline]
    pub fn new(ip: IpAddr, port: u16) -> Address {
        Address {
            addr: SocketAddr::new(ip, port),
        }
    }

    /// Parses `<ip>:<port>` notation.
    #[inline]
    pub fn parse(text: &str) -> NetResult<Address> {
        let addr = text.parse::<SocketAddr>()?;
        Ok(Address { addr })
    }

    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// False once cleared or when never bound.
    #[inline]
    pub fn is_specified(&self) -> bool {
        *self != Address::unspecified()
    }

    /// Resets to the unspecified sentinel.
    #[inline]
    pub fn clear(&mut self) {
        *self = Address::unspecified();
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Address {
        Address { addr }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// An address mutated after binding, readable from any thread. Covers the per-client UDP return
/// address on a server, which a worker writes during the handshake while other threads route
/// outbound datagrams through it.
pub struct SharedAddress {
    inner: RwLock<Address>,
}

impl SharedAddress {
    #[inline]
    pub fn unspecified() -> SharedAddress {
        SharedAddress {
            inner: RwLock::new(Address::unspecified()),
        }
    }

    #[inline]
    pub fn get(&self) -> Address {
        *self.inner.read().expect("Address lock poisoned")
    }

    #[inline]
    pub fn set(&self, address: Address) {
        *self.inner.write().expect("Address lock poisoned") = address;
    }

    #[inline]
    pub fn clear(&self) {
        self.set(Address::unspecified());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_accessors() {
        let address = Address::parse("127.0.0.1:28008").unwrap();

        assert_eq!(address.ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(address.port(), 28008);
        assert!(address.is_specified());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse("not an address").is_err());
        assert!(Address::parse("127.0.0.1").is_err());
    }

    #[test]
    fn test_clear_resets_to_sentinel() {
        let mut address = Address::parse("10.0.0.1:99").unwrap();
        address.clear();

        assert!(!address.is_specified());
        assert_eq!(address, Address::unspecified());
    }

    #[test]
    fn test_shared_address() {
        let shared = SharedAddress::unspecified();
        assert!(!shared.get().is_specified());

        shared.set(Address::parse("10.0.0.1:99").unwrap());
        assert_eq!(shared.get().port(), 99);

        shared.clear();
        assert!(!shared.get().is_specified());
    }
}
