use crate::buffer::Buffer;
use crate::endpoint::EndPoint;
use crate::interface::{NetworkInterface, PacketReceiver, SendQueue};
use crate::shared::{ErrorType, NetworkError, NetworkResult, MTU};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Mutex, MutexGuard};

// Per-channel datagram FIFO capacity. Records are framed as a 4-byte
// source channel and a 2-byte length followed by the payload.
const CHANNEL_QUEUE_SIZE: usize = 64 * 1024;
const RECORD_HEADER_SIZE: usize = 6;

const EPHEMERAL_PORT_START: u16 = 49152;

struct ChannelQueue {
    port: u16,
    owned: bool,
    queue: Buffer,
}

/// The process-wide datagram bus backing the IPC interface: a registry of
/// 16-bit ports mapped to channel ids, each with its own bounded FIFO.
/// Reference counted by interface instances; the registry is torn down
/// when the last one goes away.
struct Exchange {
    ports: HashMap<u16, u32>,
    channels: Vec<Option<ChannelQueue>>,
    free: Vec<u32>,
    next_port: u16,
    refs: usize,
}

impl Exchange {
    fn new() -> Exchange {
        Exchange {
            ports: HashMap::new(),
            channels: Vec::new(),
            free: Vec::new(),
            next_port: EPHEMERAL_PORT_START,
            refs: 0,
        }
    }

    fn acquire_channel(&mut self, port: u16, owned: bool) -> NetworkResult<u32> {
        if port != 0 {
            if let Some(&channel) = self.ports.get(&port) {
                let queue = self.channels[channel as usize]
                    .as_mut()
                    .expect("Port map referenced a released channel");

                if owned {
                    if queue.owned {
                        return Err(NetworkError::Fatal(ErrorType::AddressInUse));
                    }
                    queue.owned = true;
                }

                return Ok(channel);
            }
        }

        let port = match port {
            0 => self.ephemeral_port(),
            port => port,
        };

        let channel = match self.free.pop() {
            Some(channel) => channel,
            None => {
                self.channels.push(None);
                (self.channels.len() - 1) as u32
            }
        };

        self.channels[channel as usize] = Some(ChannelQueue {
            port,
            owned,
            queue: Buffer::new(CHANNEL_QUEUE_SIZE),
        });
        self.ports.insert(port, channel);

        Ok(channel)
    }

    fn release_channel(&mut self, channel: u32) {
        if let Some(queue) = self.channels[channel as usize].take() {
            self.ports.remove(&queue.port);
            self.free.push(channel);
        }
    }

    fn ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = match port {
                u16::MAX => EPHEMERAL_PORT_START,
                port => port + 1,
            };

            if !self.ports.contains_key(&port) {
                return port;
            }
        }
    }

    /// Enqueues a datagram on the destination channel. Full or missing
    /// destinations drop the datagram; the bus is as unreliable as the
    /// wire it stands in for.
    fn push(&mut self, dest: u32, from: u32, data: &[u8]) -> bool {
        let queue = match self.channels.get_mut(dest as usize).and_then(Option::as_mut) {
            Some(queue) => queue,
            None => return false,
        };

        let total = RECORD_HEADER_SIZE + data.len();
        if queue.queue.free_capacity() < total {
            return false;
        }

        let slice = queue.queue.write_slice();
        LittleEndian::write_u32(&mut slice[0..4], from);
        LittleEndian::write_u16(&mut slice[4..6], data.len() as u16);
        slice[RECORD_HEADER_SIZE..total].copy_from_slice(data);
        queue.queue.move_tail(total);

        true
    }

    /// Drains the channel's queue into the receiver. A datagram that does
    /// not fit the receiver is dropped and the pass ends.
    fn drain(&mut self, channel: u32, receiver: &mut PacketReceiver) -> NetworkResult<usize> {
        let queue = match self.channels.get_mut(channel as usize).and_then(Option::as_mut) {
            Some(queue) => queue,
            None => return Err(NetworkError::Fatal(ErrorType::ChannelClosed)),
        };

        let mut count = 0;
        let mut scratch = [0u8; MTU];

        loop {
            let slice = queue.queue.read_slice();
            if slice.len() < RECORD_HEADER_SIZE {
                break;
            }

            let from = LittleEndian::read_u32(&slice[0..4]);
            let length = usize::from(LittleEndian::read_u16(&slice[4..6]));

            scratch[..length].copy_from_slice(&slice[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + length]);
            queue.queue.move_head(RECORD_HEADER_SIZE + length);

            if !receiver.append_packet(EndPoint::ipc_channel(from), &scratch[..length]) {
                break;
            }

            count += 1;
        }

        Ok(count)
    }

    fn reset(&mut self) {
        self.ports.clear();
        self.channels.clear();
        self.free.clear();
        self.next_port = EPHEMERAL_PORT_START;
    }
}

lazy_static! {
    static ref EXCHANGE: Mutex<Exchange> = Mutex::new(Exchange::new());
}

// The lock guards queue plumbing only, which is safe to take over from a
// paniced holder.
fn lock_exchange() -> MutexGuard<'static, Exchange> {
    match EXCHANGE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process datagram transport over the process-wide exchange. Generic
/// endpoints address 16-bit ports; on the wire the exchange routes by
/// channel id.
pub struct IpcInterface {
    channel: Option<u32>,
    port: Option<u16>,
}

impl IpcInterface {
    pub fn new() -> IpcInterface {
        lock_exchange().refs += 1;

        IpcInterface {
            channel: None,
            port: None,
        }
    }

    #[inline]
    fn channel(&self) -> NetworkResult<u32> {
        self.channel.ok_or(NetworkError::Fatal(ErrorType::NotBound))
    }
}

impl Drop for IpcInterface {
    fn drop(&mut self) {
        let mut exchange = lock_exchange();

        if let Some(channel) = self.channel {
            exchange.release_channel(channel);
        }

        exchange.refs -= 1;
        if exchange.refs == 0 {
            exchange.reset();
        }
    }
}

impl NetworkInterface for IpcInterface {
    fn any_endpoint(&self) -> EndPoint {
        EndPoint::ipc_port(0)
    }

    fn interface_endpoint(&mut self, generic: &EndPoint) -> NetworkResult<EndPoint> {
        if let Ok(port) = generic.ipc_port_value() {
            // Channels come into being when first addressed, so datagrams
            // sent ahead of the remote bind are queued rather than lost.
            let channel = lock_exchange().acquire_channel(port, false)?;
            return Ok(EndPoint::ipc_channel(channel));
        }

        generic.channel()?;
        Ok(*generic)
    }

    fn bind(&mut self, endpoint: &EndPoint) -> NetworkResult<()> {
        if self.channel.is_some() {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        let port = endpoint.ipc_port_value()?;

        let mut exchange = lock_exchange();
        let channel = exchange.acquire_channel(port, true)?;
        let port = exchange.channels[channel as usize]
            .as_ref()
            .expect("Freshly acquired channel must exist")
            .port;

        self.channel = Some(channel);
        self.port = Some(port);

        Ok(())
    }

    fn local_endpoint(&self) -> NetworkResult<EndPoint> {
        match self.port {
            Some(port) => Ok(EndPoint::ipc_port(port)),
            None => Err(NetworkError::Fatal(ErrorType::NotBound)),
        }
    }

    fn schedule_receive(&mut self, receiver: &mut PacketReceiver) -> NetworkResult<usize> {
        let channel = self.channel()?;
        lock_exchange().drain(channel, receiver)
    }

    fn schedule_send(&mut self, queue: &mut SendQueue) -> NetworkResult<usize> {
        let channel = self.channel()?;
        let mut exchange = lock_exchange();
        let mut count = 0;

        while let Some(message) = queue.pop() {
            if let Ok(dest) = message.dest.channel() {
                if exchange.push(dest, channel, message.payload()) {
                    count += 1;
                }
            }

            queue.recycle(message);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_roundtrip() {
        let mut server = IpcInterface::new();
        let mut client = IpcInterface::new();

        server.bind(&EndPoint::ipc_port(41001)).unwrap();
        client.bind(&EndPoint::ipc_port(0)).unwrap();

        let server_endpoint = client.interface_endpoint(&EndPoint::ipc_port(41001)).unwrap();

        let mut queue = SendQueue::new();
        queue.push(server_endpoint, &[10, 20, 30]);
        assert_eq!(client.schedule_send(&mut queue).unwrap(), 1);

        let mut receiver = PacketReceiver::new(4096, false, 4096);
        assert_eq!(server.schedule_receive(&mut receiver).unwrap(), 1);

        assert_eq!(receiver.payload_at(0), &[10, 20, 30]);
        // The source endpoint is the client's channel, so the server can
        // reply to it directly.
        let reply_to = receiver.packet(0).endpoint;

        let mut reply_queue = SendQueue::new();
        reply_queue.push(reply_to, &[42]);
        server.schedule_send(&mut reply_queue).unwrap();

        let mut client_receiver = PacketReceiver::new(4096, false, 4096);
        assert_eq!(client.schedule_receive(&mut client_receiver).unwrap(), 1);
        assert_eq!(client_receiver.payload_at(0), &[42]);
    }

    #[test]
    fn test_ephemeral_bind_assigns_port() {
        let mut interface = IpcInterface::new();

        interface.bind(&EndPoint::ipc_port(0)).unwrap();

        let local = interface.local_endpoint().unwrap();
        assert!(local.ipc_port_value().unwrap() >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn test_port_conflict() {
        let mut first = IpcInterface::new();
        let mut second = IpcInterface::new();

        first.bind(&EndPoint::ipc_port(41002)).unwrap();

        assert_eq!(
            second.bind(&EndPoint::ipc_port(41002)).unwrap_err(),
            NetworkError::Fatal(ErrorType::AddressInUse)
        );
    }

    #[test]
    fn test_port_released_on_drop() {
        {
            let mut interface = IpcInterface::new();
            interface.bind(&EndPoint::ipc_port(41003)).unwrap();
        }

        let mut interface = IpcInterface::new();
        interface.bind(&EndPoint::ipc_port(41003)).unwrap();
    }

    #[test]
    fn test_send_to_missing_channel_is_dropped() {
        let mut interface = IpcInterface::new();
        interface.bind(&EndPoint::ipc_port(41004)).unwrap();

        let mut queue = SendQueue::new();
        queue.push(EndPoint::ipc_channel(0xdead), &[1]);

        assert_eq!(interface.schedule_send(&mut queue).unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_channel_drops_datagrams() {
        let mut sender = IpcInterface::new();
        let mut listener = IpcInterface::new();

        listener.bind(&EndPoint::ipc_port(41005)).unwrap();
        sender.bind(&EndPoint::ipc_port(0)).unwrap();

        let dest = sender.interface_endpoint(&EndPoint::ipc_port(41005)).unwrap();

        // Each record costs MTU + 6 bytes; overfill the channel queue.
        let payload = [0u8; MTU];
        let capacity = CHANNEL_QUEUE_SIZE / (MTU + RECORD_HEADER_SIZE);

        let mut queue = SendQueue::new();
        for _ in 0..capacity + 5 {
            queue.push(dest, &payload);
        }

        let sent = sender.schedule_send(&mut queue).unwrap();
        assert_eq!(sent, capacity);

        let mut receiver = PacketReceiver::new(CHANNEL_QUEUE_SIZE * 2, false, CHANNEL_QUEUE_SIZE * 2);
        assert_eq!(listener.schedule_receive(&mut receiver).unwrap(), capacity);
    }

    #[test]
    fn test_queued_datagrams_survive_late_bind() {
        let mut sender = IpcInterface::new();
        sender.bind(&EndPoint::ipc_port(0)).unwrap();

        // Addressing the port creates the channel ahead of the bind.
        let dest = sender.interface_endpoint(&EndPoint::ipc_port(41006)).unwrap();

        let mut queue = SendQueue::new();
        queue.push(dest, &[7]);
        sender.schedule_send(&mut queue).unwrap();

        let mut listener = IpcInterface::new();
        listener.bind(&EndPoint::ipc_port(41006)).unwrap();

        let mut receiver = PacketReceiver::new(4096, false, 4096);
        assert_eq!(listener.schedule_receive(&mut receiver).unwrap(), 1);
        assert_eq!(receiver.payload_at(0), &[7]);
    }
}
