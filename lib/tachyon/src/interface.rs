use crate::buffer::Buffer;
use crate::endpoint::EndPoint;
use crate::shared::{NetworkResult, MTU};
use std::collections::VecDeque;

/// Error code surfaced when an inbound datagram does not fit the receive
/// buffer.
pub const RECEIVE_BUFFER_TOO_SMALL: i32 = 10040;

#[derive(Debug, Copy, Clone)]
pub struct PacketMetadata {
    pub endpoint: EndPoint,
    pub offset: usize,
    pub length: usize,
}

/// Collects a tick's inbound datagrams into a shared arena, recording a
/// metadata tuple per packet. The arena either has a fixed size or doubles
/// up to a configured maximum; a datagram that does not fit is dropped,
/// the error code is set and the receive pass ends for the tick.
pub struct PacketReceiver {
    stream: Buffer,
    packets: Vec<PacketMetadata>,
    dynamic: bool,
    max_size: usize,
    pub receive_error_code: i32,
}

impl PacketReceiver {
    pub fn new(size: usize, dynamic: bool, max_size: usize) -> PacketReceiver {
        PacketReceiver {
            stream: Buffer::new(size),
            packets: Vec::new(),
            dynamic,
            max_size: max_size.max(size),
            receive_error_code: 0,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.stream.clear();
        self.packets.clear();
        self.receive_error_code = 0;
    }

    /// Copies a datagram into the arena. Returns false when it does not
    /// fit even after growth, leaving the error code set.
    pub fn append_packet(&mut self, endpoint: EndPoint, data: &[u8]) -> bool {
        while data.len() > self.stream.free_capacity() {
            if !self.dynamic || !self.stream.grow(self.max_size) {
                self.receive_error_code = RECEIVE_BUFFER_TOO_SMALL;
                return false;
            }
        }

        let offset = self.stream.len();
        self.stream.append(data);

        self.packets.push(PacketMetadata {
            endpoint,
            offset,
            length: data.len(),
        });

        true
    }

    #[inline]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn packet(&self, index: usize) -> PacketMetadata {
        self.packets[index]
    }

    #[inline]
    pub fn payload_at(&self, index: usize) -> &[u8] {
        let meta = self.packets[index];
        &self.stream.read_slice()[meta.offset..meta.offset + meta.length]
    }
}

/// An outbound datagram staged for the interface flush.
pub struct QueuedSendMessage {
    pub dest: EndPoint,
    pub length: u16,
    pub data: [u8; MTU],
}

impl QueuedSendMessage {
    fn blank() -> Box<QueuedSendMessage> {
        Box::new(QueuedSendMessage {
            dest: EndPoint::default(),
            length: 0,
            data: [0u8; MTU],
        })
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.length)]
    }
}

/// FIFO of staged datagrams between the driver and the interface flush,
/// with a free list backing the begin/end/abort message contract.
pub struct SendQueue {
    queue: VecDeque<Box<QueuedSendMessage>>,
    pool: Vec<Box<QueuedSendMessage>>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queue: VecDeque::new(),
            pool: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Acquires a temporary MTU-sized message to fill in.
    #[inline]
    pub fn begin_message(&mut self) -> Box<QueuedSendMessage> {
        self.pool.pop().unwrap_or_else(QueuedSendMessage::blank)
    }

    /// Addresses and enqueues a message acquired with `begin_message`.
    #[inline]
    pub fn end_message(&mut self, mut message: Box<QueuedSendMessage>, dest: EndPoint, length: usize) {
        debug_assert!(length <= MTU);
        message.dest = dest;
        message.length = length as u16;
        self.queue.push_back(message);
    }

    /// Releases a message without enqueueing it.
    #[inline]
    pub fn abort_message(&mut self, message: Box<QueuedSendMessage>) {
        self.pool.push(message);
    }

    /// Convenience for small control datagrams. Returns false when the
    /// bytes exceed the MTU.
    pub fn push(&mut self, dest: EndPoint, bytes: &[u8]) -> bool {
        if bytes.len() > MTU {
            return false;
        }

        let mut message = self.begin_message();
        message.data[..bytes.len()].copy_from_slice(bytes);
        self.end_message(message, dest, bytes.len());

        true
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Box<QueuedSendMessage>> {
        self.queue.pop_front()
    }

    /// Returns an unsent message to the head of the queue.
    #[inline]
    pub fn requeue(&mut self, message: Box<QueuedSendMessage>) {
        self.queue.push_front(message);
    }

    /// Returns a flushed message to the free list.
    #[inline]
    pub fn recycle(&mut self, message: Box<QueuedSendMessage>) {
        self.pool.push(message);
    }
}

/// The unreliable datagram transport underneath a driver. Implemented by
/// the UDP socket interface and the in-process IPC exchange.
pub trait NetworkInterface {
    /// The wildcard endpoint used for automatic binds.
    fn any_endpoint(&self) -> EndPoint;

    /// Maps a generic endpoint to the interface-specific form datagrams
    /// are addressed with.
    fn interface_endpoint(&mut self, generic: &EndPoint) -> NetworkResult<EndPoint>;

    fn bind(&mut self, endpoint: &EndPoint) -> NetworkResult<()>;

    /// The bound local address, in the generic form peers can connect to.
    fn local_endpoint(&self) -> NetworkResult<EndPoint>;

    /// Drains inbound datagrams into the receiver. Returns the number of
    /// packets appended; capacity overflow is reported on the receiver.
    fn schedule_receive(&mut self, receiver: &mut PacketReceiver) -> NetworkResult<usize>;

    /// Flushes the send queue. Returns the number of datagrams sent.
    fn schedule_send(&mut self, queue: &mut SendQueue) -> NetworkResult<usize>;
}
