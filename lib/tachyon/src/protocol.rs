use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};

/// Datagram categories carried in the first header byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    ConnectionRequest = 1,
    ConnectionAccept = 2,
    Disconnect = 3,
    Data = 4,
    Ping = 5,
}

impl From<PacketType> for u8 {
    #[inline]
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

impl PacketType {
    #[inline]
    pub fn parse(value: u8) -> NetworkResult<PacketType> {
        match value {
            1 => Ok(PacketType::ConnectionRequest),
            2 => Ok(PacketType::ConnectionAccept),
            3 => Ok(PacketType::Disconnect),
            4 => Ok(PacketType::Data),
            5 => Ok(PacketType::Ping),
            _ => Err(NetworkError::Fatal(ErrorType::Malformed)),
        }
    }
}

/// The fixed transport header prepended to every datagram, little-endian
/// on the wire. On `Data` packets the flags byte carries the pipeline id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UdpHeader {
    pub packet_type: PacketType,
    pub session_token: u16,
    pub flags: u8,
}

impl UdpHeader {
    pub const SIZE: usize = 4;

    #[inline]
    pub fn new(packet_type: PacketType, session_token: u16, flags: u8) -> UdpHeader {
        UdpHeader {
            packet_type,
            session_token,
            flags,
        }
    }

    /// Writes the header into the first `SIZE` bytes of the buffer.
    #[inline]
    pub fn write(&self, buffer: &mut [u8]) {
        buffer[0] = self.packet_type.into();
        LittleEndian::write_u16(&mut buffer[1..3], self.session_token);
        buffer[3] = self.flags;
    }

    /// Parses the header off the front of a datagram. Short or unknown
    /// headers are malformed.
    #[inline]
    pub fn read(buffer: &[u8]) -> NetworkResult<UdpHeader> {
        if buffer.len() < Self::SIZE {
            return Err(NetworkError::Fatal(ErrorType::Malformed));
        }

        Ok(UdpHeader {
            packet_type: PacketType::parse(buffer[0])?,
            session_token: LittleEndian::read_u16(&buffer[1..3]),
            flags: buffer[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = UdpHeader::new(PacketType::Data, 0xbeef, 2);

        let mut raw = [0u8; UdpHeader::SIZE];
        header.write(&mut raw);

        assert_eq!(UdpHeader::read(&raw).unwrap(), header);
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let header = UdpHeader::new(PacketType::ConnectionAccept, 0x0102, 7);

        let mut raw = [0u8; UdpHeader::SIZE];
        header.write(&mut raw);

        assert_eq!(raw, [2, 0x02, 0x01, 7]);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let raw = [9u8, 0, 0, 0];

        assert_eq!(
            UdpHeader::read(&raw).unwrap_err(),
            NetworkError::Fatal(ErrorType::Malformed)
        );
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let raw = [1u8, 0, 0];

        assert_eq!(
            UdpHeader::read(&raw).unwrap_err(),
            NetworkError::Fatal(ErrorType::Malformed)
        );
    }
}
