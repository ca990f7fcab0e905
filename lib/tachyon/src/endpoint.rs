use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const FAMILY_IPV4: u8 = 1;
const FAMILY_IPV6: u8 = 2;
const FAMILY_IPC: u8 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressFamily {
    None,
    Ipv4,
    Ipv6,
    Ipc,
}

/// An opaque transport address: a fixed-size byte blob tagged with the
/// valid length. UDP endpoints encode a family byte, a big-endian port and
/// the address octets; IPC endpoints encode either a 2-byte port (the
/// generic form users address) or a 4-byte channel id (the interface form).
///
/// Equality and hashing cover the valid prefix only.
#[derive(Debug, Copy, Clone)]
pub struct EndPoint {
    data: [u8; Self::CAPACITY],
    length: u8,
}

impl EndPoint {
    pub const CAPACITY: usize = 32;

    const IPV4_LENGTH: u8 = 7;
    const IPV6_LENGTH: u8 = 19;
    const IPC_PORT_LENGTH: u8 = 3;
    const IPC_CHANNEL_LENGTH: u8 = 5;

    /// Encodes a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> EndPoint {
        let mut data = [0u8; Self::CAPACITY];

        let length = match addr.ip() {
            IpAddr::V4(ip) => {
                data[0] = FAMILY_IPV4;
                BigEndian::write_u16(&mut data[1..3], addr.port());
                data[3..7].copy_from_slice(&ip.octets());
                Self::IPV4_LENGTH
            }
            IpAddr::V6(ip) => {
                data[0] = FAMILY_IPV6;
                BigEndian::write_u16(&mut data[1..3], addr.port());
                data[3..19].copy_from_slice(&ip.octets());
                Self::IPV6_LENGTH
            }
        };

        EndPoint { data, length }
    }

    /// Parses an `<ip>:<port>` string into a UDP endpoint.
    pub fn parse(address: &str) -> NetworkResult<EndPoint> {
        let addr = address.parse::<SocketAddr>()?;
        Ok(Self::from_socket_addr(addr))
    }

    /// The generic IPC form addressed by port.
    pub fn ipc_port(port: u16) -> EndPoint {
        let mut data = [0u8; Self::CAPACITY];
        data[0] = FAMILY_IPC;
        BigEndian::write_u16(&mut data[1..3], port);

        EndPoint {
            data,
            length: Self::IPC_PORT_LENGTH,
        }
    }

    /// The interface IPC form addressed by channel id.
    pub fn ipc_channel(channel: u32) -> EndPoint {
        let mut data = [0u8; Self::CAPACITY];
        data[0] = FAMILY_IPC;
        BigEndian::write_u32(&mut data[1..5], channel);

        EndPoint {
            data,
            length: Self::IPC_CHANNEL_LENGTH,
        }
    }

    #[inline]
    pub fn family(&self) -> AddressFamily {
        if self.length == 0 {
            return AddressFamily::None;
        }

        match self.data[0] {
            FAMILY_IPV4 => AddressFamily::Ipv4,
            FAMILY_IPV6 => AddressFamily::Ipv6,
            FAMILY_IPC => AddressFamily::Ipc,
            _ => AddressFamily::None,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.family() != AddressFamily::None
    }

    /// Decodes the socket address of a UDP endpoint.
    pub fn socket_addr(&self) -> NetworkResult<SocketAddr> {
        match (self.family(), self.length) {
            (AddressFamily::Ipv4, Self::IPV4_LENGTH) => {
                let port = BigEndian::read_u16(&self.data[1..3]);
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.data[3..7]);
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            (AddressFamily::Ipv6, Self::IPV6_LENGTH) => {
                let port = BigEndian::read_u16(&self.data[1..3]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data[3..19]);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(NetworkError::Fatal(ErrorType::WrongFamily)),
        }
    }

    /// The port of a generic IPC endpoint.
    pub fn ipc_port_value(&self) -> NetworkResult<u16> {
        match (self.family(), self.length) {
            (AddressFamily::Ipc, Self::IPC_PORT_LENGTH) => Ok(BigEndian::read_u16(&self.data[1..3])),
            _ => Err(NetworkError::Fatal(ErrorType::WrongFamily)),
        }
    }

    /// The channel id of an interface IPC endpoint.
    pub fn channel(&self) -> NetworkResult<u32> {
        match (self.family(), self.length) {
            (AddressFamily::Ipc, Self::IPC_CHANNEL_LENGTH) => Ok(BigEndian::read_u32(&self.data[1..5])),
            _ => Err(NetworkError::Fatal(ErrorType::WrongFamily)),
        }
    }

    #[inline]
    fn valid(&self) -> &[u8] {
        &self.data[..usize::from(self.length)]
    }
}

impl Default for EndPoint {
    #[inline]
    fn default() -> EndPoint {
        EndPoint {
            data: [0u8; Self::CAPACITY],
            length: 0,
        }
    }
}

impl PartialEq for EndPoint {
    #[inline]
    fn eq(&self, other: &EndPoint) -> bool {
        self.valid() == other.valid()
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.valid().hash(state);
    }
}
