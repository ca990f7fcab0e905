use crate::endpoint::EndPoint;
use crate::interface::{NetworkInterface, PacketReceiver, SendQueue};
use crate::shared::{ErrorType, NetworkError, NetworkResult, MTU};
use mio::net::UdpSocket;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Nonblocking UDP transport. The socket is polled opportunistically once
/// per tick; both the receive and send loops run until the kernel reports
/// `WouldBlock`.
pub struct UdpInterface {
    socket: Option<UdpSocket>,
}

impl UdpInterface {
    #[inline]
    pub fn new() -> UdpInterface {
        UdpInterface { socket: None }
    }

    #[inline]
    fn socket(&self) -> NetworkResult<&UdpSocket> {
        self.socket.as_ref().ok_or(NetworkError::Fatal(ErrorType::NotBound))
    }
}

impl NetworkInterface for UdpInterface {
    fn any_endpoint(&self) -> EndPoint {
        EndPoint::from_socket_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    fn interface_endpoint(&mut self, generic: &EndPoint) -> NetworkResult<EndPoint> {
        // Socket addresses are used on the wire as-is.
        generic.socket_addr()?;
        Ok(*generic)
    }

    fn bind(&mut self, endpoint: &EndPoint) -> NetworkResult<()> {
        if self.socket.is_some() {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        let addr = endpoint.socket_addr()?;
        self.socket = Some(UdpSocket::bind(addr)?);

        Ok(())
    }

    fn local_endpoint(&self) -> NetworkResult<EndPoint> {
        let addr = self.socket()?.local_addr()?;
        Ok(EndPoint::from_socket_addr(addr))
    }

    fn schedule_receive(&mut self, receiver: &mut PacketReceiver) -> NetworkResult<usize> {
        let socket = self.socket()?;
        let mut scratch = [0u8; MTU];
        let mut count = 0;

        loop {
            match socket.recv_from(&mut scratch) {
                Ok((size, from)) => {
                    if !receiver.append_packet(EndPoint::from_socket_addr(from), &scratch[..size]) {
                        // Receiver full; the datagram is dropped and the
                        // pass ends for this tick.
                        break;
                    }
                    count += 1;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(count)
    }

    fn schedule_send(&mut self, queue: &mut SendQueue) -> NetworkResult<usize> {
        let socket = self.socket()?;
        let mut count = 0;

        while let Some(message) = queue.pop() {
            let addr = match message.dest.socket_addr() {
                Ok(addr) => addr,
                Err(_) => {
                    // Misaddressed message; drop it rather than wedging
                    // the queue.
                    queue.recycle(message);
                    continue;
                }
            };

            match socket.send_to(message.payload(), addr) {
                Ok(_) => {
                    queue.recycle(message);
                    count += 1;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    queue.requeue(message);
                    break;
                }
                Err(err) => {
                    queue.recycle(message);
                    return Err(err.into());
                }
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn localhost_pair() -> (UdpInterface, UdpInterface, EndPoint, EndPoint) {
        let mut first = UdpInterface::new();
        let mut second = UdpInterface::new();

        let any = EndPoint::parse("127.0.0.1:0").unwrap();
        first.bind(&any).unwrap();
        second.bind(&any).unwrap();

        let first_addr = first.local_endpoint().unwrap();
        let second_addr = second.local_endpoint().unwrap();

        (first, second, first_addr, second_addr)
    }

    #[test]
    fn test_bind_assigns_local_endpoint() {
        let (first, _, first_addr, _) = localhost_pair();

        assert!(first_addr.socket_addr().unwrap().port() != 0);
        drop(first);
    }

    #[test]
    fn test_unbound_socket_errors() {
        let mut interface = UdpInterface::new();
        let mut receiver = PacketReceiver::new(64, false, 64);

        assert_eq!(
            interface.schedule_receive(&mut receiver).unwrap_err(),
            NetworkError::Fatal(ErrorType::NotBound)
        );
    }

    #[test]
    fn test_loopback_roundtrip() {
        let (mut sender, mut listener, _, listener_addr) = localhost_pair();

        let mut queue = SendQueue::new();
        queue.push(listener_addr, &[1, 2, 3, 4, 5]);
        sender.schedule_send(&mut queue).unwrap();

        // The kernel delivers loopback datagrams promptly, but not
        // synchronously; poll with a deadline.
        let mut receiver = PacketReceiver::new(4096, false, 4096);
        for _ in 0..100 {
            listener.schedule_receive(&mut receiver).unwrap();
            if receiver.packet_count() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(receiver.packet_count(), 1);
        assert_eq!(receiver.payload_at(0), &[1, 2, 3, 4, 5]);
    }
}
