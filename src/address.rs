use std::fmt;
use std::net;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Opaque, backend-defined endpoint identifier compared by value.
///
/// An empty address is valid and is used by backends that do not distinguish endpoints.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct Address {
    bytes: Box<[u8]>,
}

impl Address {
    /// # Panics
    ///
    /// Panics if `bytes` is longer than 255 bytes.
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= u8::MAX as usize, "address too long");
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn unspecified() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_unspecified(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes an address produced by `From<SocketAddr>`.
    pub fn to_socket_addr(&self) -> Option<net::SocketAddr> {
        match self.bytes.split_first() {
            Some((&FAMILY_V4, rest)) if rest.len() == 6 => {
                let ip = net::Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Some(net::SocketAddr::new(ip.into(), port))
            }
            Some((&FAMILY_V6, rest)) if rest.len() == 18 => {
                let mut octets = [0; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Some(net::SocketAddr::new(net::Ipv6Addr::from(octets).into(), port))
            }
            _ => None,
        }
    }
}

impl From<net::SocketAddr> for Address {
    fn from(addr: net::SocketAddr) -> Self {
        let mut bytes = Vec::with_capacity(19);

        match addr.ip() {
            net::IpAddr::V4(ip) => {
                bytes.push(FAMILY_V4);
                bytes.extend_from_slice(&ip.octets());
            }
            net::IpAddr::V6(ip) => {
                bytes.push(FAMILY_V6);
                bytes.extend_from_slice(&ip.octets());
            }
        }

        bytes.extend_from_slice(&addr.port().to_be_bytes());

        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "Address({})", addr),
            None => write!(f, "Address({:02X?})", self.bytes),
        }
    }
}
