use crate::connection::{ConnectionId, ConnectionList, ConnectionState, DisconnectReason};
use crate::endpoint::EndPoint;
use crate::events::{EventKind, EventQueue};
use crate::interface::{NetworkInterface, PacketReceiver, SendQueue};
use crate::params::Params;
use crate::pipeline::{PipelineId, PipelineRegistry, PipelineStage, StageBuffer, StageRun, NULL_PIPELINE};
use crate::protocol::{PacketType, UdpHeader};
use crate::shared::{ErrorType, NetworkError, NetworkResult, MTU};
use crate::stream::{DataStream, Reader};
use hashbrown::HashMap;
use indexmap::IndexSet;
use quark::logging::{self, Logger};
use quark::time::TickClock;
use std::collections::VecDeque;
use std::mem;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default, Copy, Clone)]
pub struct DriverStats {
    pub malformed_packets: usize,
    pub dropped_datagrams: usize,
    pub receive_errors: usize,
}

/// An in-flight outbound message acquired with `begin_send`. Dereferences
/// to the payload stream; hand it back through `end_send` to transmit or
/// `abort_send` to discard.
pub struct SendBuffer {
    stream: DataStream,
    connection: ConnectionId,
    pipeline: PipelineId,
}

impl Deref for SendBuffer {
    type Target = DataStream;

    #[inline]
    fn deref(&self) -> &DataStream {
        &self.stream
    }
}

impl DerefMut for SendBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut DataStream {
        &mut self.stream
    }
}

/// The connection-oriented datagram driver: virtual connections with
/// handshake, liveness and retransmission timers layered over a
/// connectionless interface, plus the pipeline and event machinery
/// around them.
///
/// Single-threaded cooperative: the owner calls `schedule_update` once per
/// tick and every other method between ticks, on the same thread.
pub struct Driver<I: NetworkInterface> {
    interface: I,
    params: Params,
    clock: TickClock,
    bound: bool,
    listening: bool,

    connections: ConnectionList,
    by_address: HashMap<EndPoint, usize>,
    live: IndexSet<usize>,
    accept_queue: VecDeque<usize>,
    releases: Vec<usize>,

    pipelines: PipelineRegistry,
    pending_updates: Vec<(usize, PipelineId, usize)>,

    receiver: PacketReceiver,
    send_queue: SendQueue,
    events: EventQueue,

    stats: DriverStats,
    log: Logger,
}

impl<I: NetworkInterface> Driver<I> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(interface: I, params: Params, log: L) -> Driver<I> {
        let driver_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let clock = match params.fixed_frame_time_ms {
            0 => TickClock::wall(),
            step => TickClock::fixed(step),
        };

        let receiver = PacketReceiver::new(
            params.receive_buffer_size,
            params.dynamic_stream_size,
            params.max_receive_buffer_size,
        );
        let events = EventQueue::new(params.event_queue_capacity, &driver_log);

        Driver {
            interface,
            params,
            clock,
            bound: false,
            listening: false,
            connections: ConnectionList::new(),
            by_address: HashMap::new(),
            live: IndexSet::new(),
            accept_queue: VecDeque::new(),
            releases: Vec::new(),
            pipelines: PipelineRegistry::new(),
            pending_updates: Vec::new(),
            receiver,
            send_queue: SendQueue::new(),
            events,
            stats: DriverStats::default(),
            log: driver_log,
        }
    }

    #[inline]
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// The receive error reported by the interface this tick, zero when
    /// the pass was clean.
    #[inline]
    pub fn receive_error_code(&self) -> i32 {
        self.receiver.receive_error_code
    }

    #[inline]
    pub fn local_endpoint(&self) -> NetworkResult<EndPoint> {
        self.interface.local_endpoint()
    }

    /// The state a handle currently refers to; `Empty` when it went stale.
    pub fn connection_state(&self, handle: ConnectionId) -> ConnectionState {
        match self.connections.check(handle) {
            Ok(slot) => self.connections.slot(slot).state,
            Err(_) => ConnectionState::Empty,
        }
    }

    pub fn register_stage(&mut self, stage: Box<dyn PipelineStage>) -> usize {
        self.pipelines.register_stage(stage)
    }

    /// Defines a pipeline over registered stages. Pipelines are fixed
    /// before the first connection so records can size their scratch
    /// arenas at creation.
    pub fn create_pipeline(&mut self, stages: &[usize]) -> NetworkResult<PipelineId> {
        if self.connections.len() > 0 {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        self.pipelines.create_pipeline(stages)
    }

    pub fn bind(&mut self, endpoint: &EndPoint) -> NetworkResult<()> {
        if self.bound {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        self.interface.bind(endpoint)?;
        self.bound = true;

        logging::debug!(self.log, "interface bound"; "context" => "bind");

        Ok(())
    }

    /// Marks the driver as a passive side. Only a listening driver accepts
    /// inbound connection requests.
    pub fn listen(&mut self) -> NetworkResult<()> {
        if !self.bound {
            return Err(NetworkError::Fatal(ErrorType::NotBound));
        }

        self.listening = true;
        Ok(())
    }

    /// Opens an outgoing connection. The first request goes out on the
    /// next tick; an unbound driver is bound to the wildcard endpoint
    /// first.
    pub fn connect(&mut self, endpoint: &EndPoint) -> NetworkResult<ConnectionId> {
        self.ensure_bound()?;

        let address = self.interface.interface_endpoint(endpoint)?;

        if let Some(&slot) = self.by_address.get(&address) {
            return Ok(self.connections.handle(slot));
        }

        let handle = self.open_connection(address, ConnectionState::Connecting);

        logging::debug!(self.log, "connecting"; "context" => "connect", "connection_id" => handle.id);

        Ok(handle)
    }

    /// Claims the next pending incoming connection, transitioning it to
    /// `Connected` locally. Returns an uncreated handle when none is
    /// waiting. Each incoming record is returned exactly once.
    pub fn accept(&mut self) -> ConnectionId {
        while let Some(slot) = self.accept_queue.pop_front() {
            {
                let conn = self.connections.slot_mut(slot);

                if conn.state != ConnectionState::AwaitingResponse || !conn.accept_pending {
                    continue;
                }

                conn.state = ConnectionState::Connected;
                conn.accept_pending = false;
            }

            logging::debug!(self.log, "connection accepted"; "context" => "accept", "connection_id" => slot);

            return self.connections.handle(slot);
        }

        ConnectionId::default()
    }

    /// Closes a connection. The disconnect notice is sent best-effort and
    /// the local `Disconnect` event is enqueued immediately.
    pub fn disconnect(&mut self, handle: ConnectionId) -> NetworkResult<()> {
        let slot = self.connections.check(handle)?;

        match self.connections.slot(slot).state {
            ConnectionState::Disconnected | ConnectionState::Empty => Ok(()),
            _ => {
                self.send_control(slot, PacketType::Disconnect);
                self.close_connection(slot, DisconnectReason::ClosedByLocal, true);
                Ok(())
            }
        }
    }

    /// Acquires an MTU-sized payload writer for a connected handle, with
    /// the transport header and the pipeline's header reservation already
    /// accounted for.
    pub fn begin_send(&mut self, pipeline: PipelineId, handle: ConnectionId) -> NetworkResult<SendBuffer> {
        let slot = self.connections.check(handle)?;

        if self.connections.slot(slot).state != ConnectionState::Connected {
            return Err(NetworkError::Fatal(ErrorType::NotConnected));
        }

        let reserve = self.pipelines.get(pipeline)?.header_capacity();

        Ok(SendBuffer {
            stream: DataStream::new(MTU - UdpHeader::SIZE - reserve),
            connection: handle,
            pipeline,
        })
    }

    /// Routes a begun send through the pipeline chain, prepends the Data
    /// header and enqueues the datagram. Returns the payload bytes
    /// written, or zero when nothing was transmitted.
    pub fn end_send(&mut self, buffer: SendBuffer) -> usize {
        let SendBuffer {
            mut stream,
            connection,
            pipeline,
        } = buffer;

        if stream.has_failed_writes() {
            return 0;
        }

        let slot = match self.connections.check(connection) {
            Ok(slot) => slot,
            Err(_) => return 0,
        };

        if self.connections.slot(slot).state != ConnectionState::Connected {
            return 0;
        }

        let reserve = match self.pipelines.get(pipeline) {
            Ok(pipeline) => pipeline.header_capacity(),
            Err(_) => return 0,
        };

        stream.flush();
        let payload_length = stream.len();
        let start = UdpHeader::SIZE + reserve;

        let mut scratch = [0u8; MTU];
        scratch[start..start + payload_length].copy_from_slice(stream.as_slice());

        let run;
        let datagram_start;
        let datagram_end;
        {
            let arena = &mut self.connections.slot_mut(slot).scratch[usize::from(pipeline.0)];
            let mut staged = StageBuffer::new(&mut scratch[..start + payload_length], start, payload_length);

            run = match self.pipelines.run_send(pipeline, arena, &mut staged) {
                Ok(run) => run,
                Err(_) => return 0,
            };

            datagram_start = staged.offset() - UdpHeader::SIZE;
            datagram_end = staged.offset() + staged.len();
        }

        if run.error {
            self.stats.dropped_datagrams += 1;
            return 0;
        }

        let token = self.connections.slot(slot).token;
        UdpHeader::new(PacketType::Data, token, pipeline.0).write(&mut scratch[datagram_start..]);

        let address = self.connections.slot(slot).address;
        self.send_queue.push(address, &scratch[datagram_start..datagram_end]);
        self.connections.slot_mut(slot).last_send = self.clock.now();

        self.service_stage_requests(slot, pipeline, &run);

        payload_length
    }

    /// Releases a begun send without transmitting anything.
    pub fn abort_send(&self, buffer: SendBuffer) {
        drop(buffer);
    }

    /// Pops the next event from any connection, round-robin fair. The
    /// reader stays valid until the next `schedule_update`.
    pub fn pop_event(&mut self) -> (EventKind, ConnectionId, Reader<'_>) {
        match self.events.pop_any() {
            Some((slot, record)) => {
                let handle = self.connections.handle(slot);

                if record.kind == EventKind::Disconnect {
                    self.mark_release(slot);
                }

                let payload = self.events.payload(record.offset, record.length);
                (record.kind, handle, Reader::new(payload))
            }
            None => (EventKind::Empty, ConnectionId::default(), Reader::new(&[])),
        }
    }

    /// Pops the next event for one connection, `Empty` when its queue has
    /// nothing pending.
    pub fn pop_event_for_connection(&mut self, handle: ConnectionId) -> NetworkResult<(EventKind, Reader<'_>)> {
        let slot = self.connections.check(handle)?;

        match self.events.pop_for(slot) {
            Some(record) => {
                if record.kind == EventKind::Disconnect {
                    self.mark_release(slot);
                }

                let payload = self.events.payload(record.offset, record.length);
                Ok((record.kind, Reader::new(payload)))
            }
            None => Ok((EventKind::Empty, Reader::new(&[]))),
        }
    }

    /// Runs one tick: drains the interface, dispatches datagrams through
    /// the protocol engine and receive pipelines, services timers and
    /// stage requests, and flushes outbound datagrams. All inbound
    /// processing completes before the flush.
    pub fn schedule_update(&mut self) -> NetworkResult<()> {
        let now = self.clock.advance();

        // Events not drained since the last tick are destroyed.
        let dropped = self.events.reset_pending(self.listening);
        for slot in dropped {
            self.mark_release(slot);
        }

        self.receiver.clear();
        match self.interface.schedule_receive(&mut self.receiver) {
            Ok(_) | Err(NetworkError::Wait) => {}
            Err(err) => return Err(err),
        }

        if self.receiver.receive_error_code != 0 {
            logging::error!(self.log, "Error on receive {}", self.receiver.receive_error_code);
            self.stats.receive_errors += 1;
        }

        let mut scratch = [0u8; MTU];
        for index in 0..self.receiver.packet_count() {
            let meta = self.receiver.packet(index);
            let length = meta.length.min(MTU);
            scratch[..length].copy_from_slice(&self.receiver.payload_at(index)[..length]);
            self.process_datagram(meta.endpoint, &scratch[..length], now);
        }

        self.service_connections(now);
        self.service_pipelines();

        match self.interface.schedule_send(&mut self.send_queue) {
            Ok(_) | Err(NetworkError::Wait) => {}
            Err(err) => return Err(err),
        }

        // Slots whose Disconnect was popped recycle only after their last
        // outbound has flushed.
        self.service_releases();

        Ok(())
    }

    fn ensure_bound(&mut self) -> NetworkResult<()> {
        if !self.bound {
            let any = self.interface.any_endpoint();
            self.interface.bind(&any)?;
            self.bound = true;
        }

        Ok(())
    }

    fn open_connection(&mut self, address: EndPoint, state: ConnectionState) -> ConnectionId {
        let now = self.clock.now();
        let scratch = self.pipelines.allocate_arenas();
        let handle = self.connections.acquire(address, state, now, scratch);

        self.by_address.insert(address, handle.index());
        self.live.insert(handle.index());

        handle
    }

    fn close_connection(&mut self, slot: usize, reason: DisconnectReason, surface: bool) {
        let state = self.connections.slot(slot).state;
        if state == ConnectionState::Disconnected || state == ConnectionState::Empty {
            return;
        }

        logging::debug!(self.log, "closing connection";
                        "context" => "close",
                        "connection_id" => slot,
                        "reason" => ?reason);

        let address = self.connections.slot(slot).address;
        self.by_address.remove(&address);
        self.live.swap_remove(&slot);

        {
            let conn = self.connections.slot_mut(slot);
            conn.state = ConnectionState::Disconnected;
            conn.reason = reason;
            conn.accept_pending = false;
        }

        if surface {
            self.push_event(slot, EventKind::Disconnect, &[reason.code()]);
        } else {
            // Never surfaced to the user, so there is no pop to wait for.
            self.connections.release(slot);
        }
    }

    fn mark_release(&mut self, slot: usize) {
        let conn = self.connections.slot_mut(slot);

        if conn.state == ConnectionState::Disconnected && !conn.release_pending {
            conn.release_pending = true;
            self.releases.push(slot);
        }
    }

    fn service_releases(&mut self) {
        if self.releases.is_empty() {
            return;
        }

        for slot in mem::take(&mut self.releases) {
            let conn = self.connections.slot(slot);

            if conn.state == ConnectionState::Disconnected && conn.release_pending {
                logging::trace!(self.log, "releasing connection slot"; "context" => "release", "connection_id" => slot);
                self.connections.release(slot);
            }
        }
    }

    fn push_event(&mut self, slot: usize, kind: EventKind, payload: &[u8]) {
        let listening = self.listening;

        if self.events.push(slot, kind, payload, listening) {
            // The overflow reset destroyed a pending Disconnect; the pop
            // that would have recycled the slot is never coming.
            self.mark_release(slot);
        }
    }

    fn send_control(&mut self, slot: usize, packet_type: PacketType) {
        let (address, token) = {
            let conn = self.connections.slot(slot);
            (conn.address, conn.token)
        };

        let mut raw = [0u8; UdpHeader::SIZE];
        UdpHeader::new(packet_type, token, 0).write(&mut raw);

        self.send_queue.push(address, &raw);
        self.connections.slot_mut(slot).last_send = self.clock.now();
    }

    fn process_datagram(&mut self, from: EndPoint, data: &[u8], now: u64) {
        let header = match UdpHeader::read(data) {
            Ok(header) => header,
            Err(_) => {
                self.stats.malformed_packets += 1;
                return;
            }
        };

        let payload = &data[UdpHeader::SIZE..];

        match header.packet_type {
            PacketType::ConnectionRequest => self.on_connection_request(from, header, now),
            PacketType::ConnectionAccept => self.on_connection_accept(from, header, now),
            PacketType::Disconnect => self.on_disconnect(from, header),
            PacketType::Data => self.on_data(from, header, payload, now),
            PacketType::Ping => self.on_ping(from, header, now),
        }
    }

    fn on_connection_request(&mut self, from: EndPoint, header: UdpHeader, now: u64) {
        if !self.listening {
            self.stats.dropped_datagrams += 1;
            return;
        }

        if let Some(&slot) = self.by_address.get(&from) {
            match self.connections.slot(slot).state {
                ConnectionState::AwaitingResponse => {
                    // Duplicate request; replay the accept without
                    // allocating a new slot.
                    self.send_control(slot, PacketType::ConnectionAccept);
                }
                ConnectionState::Connected => {
                    if header.session_token != self.connections.slot(slot).token {
                        // The peer restarted: retire the old session and
                        // open a fresh one.
                        self.close_connection(slot, DisconnectReason::ClosedByRemote, true);
                        self.open_incoming(from, now);
                    } else {
                        self.send_control(slot, PacketType::ConnectionAccept);
                    }
                }
                _ => self.stats.dropped_datagrams += 1,
            }
            return;
        }

        self.open_incoming(from, now);
    }

    fn open_incoming(&mut self, from: EndPoint, now: u64) {
        let handle = self.open_connection(from, ConnectionState::AwaitingResponse);
        let slot = handle.index();

        {
            let conn = self.connections.slot_mut(slot);
            conn.token = rand::random::<u16>().max(1);
            conn.accept_pending = true;
            conn.last_receive = now;
        }

        self.accept_queue.push_back(slot);
        self.send_control(slot, PacketType::ConnectionAccept);

        logging::debug!(self.log, "incoming connection"; "context" => "request", "connection_id" => slot);
    }

    fn on_connection_accept(&mut self, from: EndPoint, header: UdpHeader, now: u64) {
        let slot = match self.by_address.get(&from) {
            Some(&slot) => slot,
            None => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        match self.connections.slot(slot).state {
            ConnectionState::Connecting => {
                {
                    let conn = self.connections.slot_mut(slot);
                    conn.token = header.session_token;
                    conn.state = ConnectionState::Connected;
                    conn.last_receive = now;
                }

                self.push_event(slot, EventKind::Connect, &[]);

                logging::debug!(self.log, "connection established"; "context" => "accept", "connection_id" => slot);
            }
            ConnectionState::Connected if self.connections.slot(slot).token == header.session_token => {
                self.connections.slot_mut(slot).last_receive = now;
            }
            _ => self.stats.dropped_datagrams += 1,
        }
    }

    fn on_disconnect(&mut self, from: EndPoint, header: UdpHeader) {
        let slot = match self.by_address.get(&from) {
            Some(&slot) => slot,
            None => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        let conn = self.connections.slot(slot);

        match conn.state {
            ConnectionState::Connected if conn.token == header.session_token => {
                self.close_connection(slot, DisconnectReason::ClosedByRemote, true);
            }
            ConnectionState::AwaitingResponse if conn.token == header.session_token => {
                self.close_connection(slot, DisconnectReason::ClosedByRemote, false);
            }
            ConnectionState::Connecting => {
                self.close_connection(slot, DisconnectReason::ClosedByRemote, true);
            }
            _ => self.stats.dropped_datagrams += 1,
        }
    }

    fn on_data(&mut self, from: EndPoint, header: UdpHeader, payload: &[u8], now: u64) {
        let slot = match self.by_address.get(&from) {
            Some(&slot) => slot,
            None => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        let conn = self.connections.slot(slot);
        let promote = match conn.state {
            ConnectionState::AwaitingResponse if conn.token == header.session_token => true,
            ConnectionState::Connected if conn.token == header.session_token => false,
            _ => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        if promote {
            self.promote(slot);
        }

        self.connections.slot_mut(slot).last_receive = now;
        self.route_data(slot, header, payload);
    }

    fn on_ping(&mut self, from: EndPoint, header: UdpHeader, now: u64) {
        let slot = match self.by_address.get(&from) {
            Some(&slot) => slot,
            None => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        let conn = self.connections.slot(slot);
        let promote = match conn.state {
            ConnectionState::AwaitingResponse if conn.token == header.session_token => true,
            ConnectionState::Connected if conn.token == header.session_token => false,
            _ => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        if promote {
            self.promote(slot);
        }

        self.connections.slot_mut(slot).last_receive = now;
    }

    /// An AwaitingResponse record saw proof the peer holds the session
    /// token before the user called `accept`; it connects here and the
    /// open surfaces as a Connect event instead of an accept return.
    fn promote(&mut self, slot: usize) {
        {
            let conn = self.connections.slot_mut(slot);
            conn.state = ConnectionState::Connected;
            conn.accept_pending = false;
        }

        self.push_event(slot, EventKind::Connect, &[]);
    }

    fn route_data(&mut self, slot: usize, header: UdpHeader, payload: &[u8]) {
        let pipeline = PipelineId(header.flags);

        if usize::from(pipeline.0) >= self.pipelines.pipeline_count() {
            self.stats.malformed_packets += 1;
            return;
        }

        if pipeline == NULL_PIPELINE {
            self.push_event(slot, EventKind::Data, payload);
            return;
        }

        let mut scratch = [0u8; MTU];
        scratch[..payload.len()].copy_from_slice(payload);

        let run;
        let start;
        let length;
        {
            let arena = &mut self.connections.slot_mut(slot).scratch[usize::from(pipeline.0)];
            let mut staged = StageBuffer::new(&mut scratch[..payload.len()], 0, payload.len());

            run = match self.pipelines.run_receive(pipeline, arena, &mut staged) {
                Ok(run) => run,
                Err(_) => {
                    self.stats.malformed_packets += 1;
                    return;
                }
            };

            start = staged.offset();
            length = staged.len();
        }

        if run.error {
            self.stats.dropped_datagrams += 1;
            return;
        }

        self.service_stage_requests(slot, pipeline, &run);
        self.push_event(slot, EventKind::Data, &scratch[start..start + length]);
    }

    fn service_connections(&mut self, now: u64) {
        let slots: Vec<usize> = self.live.iter().copied().collect();

        for slot in slots {
            match self.connections.slot(slot).state {
                ConnectionState::Connecting => self.service_connecting(slot, now),
                ConnectionState::AwaitingResponse => {
                    if now - self.connections.slot(slot).last_receive >= self.params.disconnect_timeout_ms {
                        // Nobody accepted this record; reclaim it without
                        // surfacing events for a session that never opened.
                        self.close_connection(slot, DisconnectReason::Timeout, false);
                    }
                }
                ConnectionState::Connected => {
                    let (last_receive, last_send) = {
                        let conn = self.connections.slot(slot);
                        (conn.last_receive, conn.last_send)
                    };

                    if now - last_receive > self.params.disconnect_timeout_ms {
                        self.close_connection(slot, DisconnectReason::Timeout, true);
                    } else if now - last_send > self.params.heartbeat_timeout_ms {
                        self.send_control(slot, PacketType::Ping);
                    }
                }
                _ => {}
            }
        }
    }

    fn service_connecting(&mut self, slot: usize, now: u64) {
        let (attempts, last_attempt) = {
            let conn = self.connections.slot(slot);
            (conn.attempts, conn.last_attempt)
        };

        if attempts > 0 && now - last_attempt < self.params.connect_timeout_ms {
            return;
        }

        if attempts >= self.params.max_connect_attempts {
            logging::debug!(self.log, "connect attempts exhausted";
                            "context" => "connect",
                            "connection_id" => slot,
                            "attempts" => attempts);
            self.close_connection(slot, DisconnectReason::MaxConnectionAttempts, true);
            return;
        }

        self.send_control(slot, PacketType::ConnectionRequest);

        let conn = self.connections.slot_mut(slot);
        conn.attempts += 1;
        conn.last_attempt = now;
    }

    /// Re-runs stages that asked for service-phase updates on the last
    /// tick. Fresh requests raised here are serviced on the next tick.
    fn service_pipelines(&mut self) {
        if self.pending_updates.is_empty() {
            return;
        }

        for (slot, pipeline, position) in mem::take(&mut self.pending_updates) {
            if self.connections.slot(slot).state != ConnectionState::Connected {
                continue;
            }

            let run;
            {
                let start = match self.pipelines.get(pipeline) {
                    Ok(pipeline) => UdpHeader::SIZE + pipeline.header_capacity(),
                    Err(_) => continue,
                };

                let arena = &mut self.connections.slot_mut(slot).scratch[usize::from(pipeline.0)];
                let mut scratch = [0u8; MTU];
                let mut staged = StageBuffer::new(&mut scratch[..start], start, 0);

                run = match self.pipelines.run_stage_send(pipeline, position, arena, &mut staged) {
                    Ok(run) => run,
                    Err(_) => continue,
                };
            }

            self.service_stage_requests(slot, pipeline, &run);
        }
    }

    fn service_stage_requests(&mut self, slot: usize, pipeline: PipelineId, run: &StageRun) {
        for &position in run.resends.iter() {
            self.emit_resend(slot, pipeline, position);
        }

        for &position in run.updates.iter() {
            self.pending_updates.push((slot, pipeline, position));
        }
    }

    /// Re-emits the outbound a stage reconstructed in its send scratch.
    fn emit_resend(&mut self, slot: usize, pipeline: PipelineId, position: usize) {
        let (address, token) = {
            let conn = self.connections.slot(slot);
            (conn.address, conn.token)
        };

        let mut datagram = [0u8; MTU];
        let length = {
            let conn = self.connections.slot(slot);
            let arena = &conn.scratch[usize::from(pipeline.0)];

            match self.pipelines.resend_payload(pipeline, position, arena) {
                Some(payload) if UdpHeader::SIZE + payload.len() <= MTU => {
                    datagram[UdpHeader::SIZE..UdpHeader::SIZE + payload.len()].copy_from_slice(payload);
                    UdpHeader::SIZE + payload.len()
                }
                _ => return,
            }
        };

        UdpHeader::new(PacketType::Data, token, pipeline.0).write(&mut datagram[..UdpHeader::SIZE]);
        self.send_queue.push(address, &datagram[..length]);
        self.connections.slot_mut(slot).last_send = self.clock.now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::RECEIVE_BUFFER_TOO_SMALL;
    use crate::ipc::IpcInterface;
    use crate::pipeline::{StageCapacities, StageIo, StageRequests};
    use quark::logging::{Drain, Never, OwnedKVList, Record};
    use std::sync::{Arc, Mutex};

    struct CaptureDrain(Arc<Mutex<Vec<String>>>);

    impl Drain for CaptureDrain {
        type Ok = ();
        type Err = Never;

        fn log(&self, record: &Record, _values: &OwnedKVList) -> Result<(), Never> {
            self.0.lock().unwrap().push(format!("{}", record.msg()));
            Ok(())
        }
    }

    fn capture_logger() -> (Logger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger::root(CaptureDrain(lines.clone()).fuse(), logging::o!());
        (logger, lines)
    }

    fn test_params() -> Params {
        Params {
            fixed_frame_time_ms: 16,
            connect_timeout_ms: 64,
            max_connect_attempts: 8,
            disconnect_timeout_ms: 640,
            heartbeat_timeout_ms: 160,
            receive_buffer_size: 4096,
            max_receive_buffer_size: 4096,
            event_queue_capacity: 8,
            ..Params::default()
        }
    }

    fn ipc_driver(params: Params) -> Driver<IpcInterface> {
        Driver::new(IpcInterface::new(), params, None)
    }

    /// Binds a listening server on the port, connects a client and drives
    /// both through the handshake.
    fn connected_pair(port: u16) -> (Driver<IpcInterface>, Driver<IpcInterface>, ConnectionId, ConnectionId) {
        let mut server = ipc_driver(test_params());
        server.bind(&EndPoint::ipc_port(port)).unwrap();
        server.listen().unwrap();

        let mut client = ipc_driver(test_params());
        let client_handle = client.connect(&EndPoint::ipc_port(port)).unwrap();

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        let server_handle = server.accept();
        assert!(server_handle.is_created());

        client.schedule_update().unwrap();
        let (kind, handle, _) = client.pop_event();
        assert_eq!(kind, EventKind::Connect);
        assert_eq!(handle, client_handle);

        (server, client, server_handle, client_handle)
    }

    #[test]
    fn test_connect_and_close() {
        let (mut server, mut client, server_handle, client_handle) = connected_pair(42001);

        // The accepted side consumed its open through accept(); nothing
        // else is pending on the slot.
        {
            let (kind, _) = server.pop_event_for_connection(server_handle).unwrap();
            assert_eq!(kind, EventKind::Empty);
        }

        client.disconnect(client_handle).unwrap();
        {
            let (kind, handle, mut reader) = client.pop_event();
            assert_eq!(kind, EventKind::Disconnect);
            assert_eq!(handle, client_handle);
            assert_eq!(reader.read_byte(), DisconnectReason::ClosedByLocal.code());
        }

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        let (kind, mut reader) = server.pop_event_for_connection(server_handle).unwrap();
        assert_eq!(kind, EventKind::Disconnect);
        assert_eq!(reader.read_byte(), DisconnectReason::ClosedByRemote.code());
    }

    #[test]
    fn test_data_roundtrip() {
        let (mut server, mut client, server_handle, client_handle) = connected_pair(42002);

        let mut buffer = client.begin_send(NULL_PIPELINE, client_handle).unwrap();
        assert!(buffer.write_bytes(b"fromserver"));
        assert_eq!(client.end_send(buffer), 10);

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        {
            let (kind, mut reader) = server.pop_event_for_connection(server_handle).unwrap();
            assert_eq!(kind, EventKind::Data);
            assert_eq!(reader.len(), 10);

            let mut raw = [0u8; 10];
            assert!(reader.read_bytes(&mut raw));
            assert_eq!(&raw, b"fromserver");
        }

        let mut buffer = server.begin_send(NULL_PIPELINE, server_handle).unwrap();
        assert!(buffer.write_bytes(b"client"));
        assert_eq!(server.end_send(buffer), 6);

        server.schedule_update().unwrap();
        client.schedule_update().unwrap();

        let (kind, handle, mut reader) = client.pop_event();
        assert_eq!(kind, EventKind::Data);
        assert_eq!(handle, client_handle);

        let mut raw = [0u8; 6];
        assert!(reader.read_bytes(&mut raw));
        assert_eq!(&raw, b"client");
    }

    #[test]
    fn test_receive_buffer_overflow() {
        let (logger, lines) = capture_logger();

        let mut params = test_params();
        params.receive_buffer_size = 8;
        params.max_receive_buffer_size = 8;

        let mut server = Driver::new(IpcInterface::new(), params, &logger);
        server.bind(&EndPoint::ipc_port(42003)).unwrap();
        server.listen().unwrap();

        let mut client = ipc_driver(test_params());
        let client_handle = client.connect(&EndPoint::ipc_port(42003)).unwrap();

        // The 4-byte handshake datagrams fit the 8-byte receive buffer.
        client.schedule_update().unwrap();
        server.schedule_update().unwrap();
        assert!(server.accept().is_created());
        client.schedule_update().unwrap();
        {
            let (kind, _, _) = client.pop_event();
            assert_eq!(kind, EventKind::Connect);
        }

        let mut buffer = client.begin_send(NULL_PIPELINE, client_handle).unwrap();
        assert!(buffer.write_bytes(&[0u8; 10]));
        assert_eq!(client.end_send(buffer), 10);
        client.schedule_update().unwrap();

        server.schedule_update().unwrap();

        assert_eq!(server.receive_error_code(), RECEIVE_BUFFER_TOO_SMALL);
        assert_eq!(server.stats().receive_errors, 1);
        assert!(lines.lock().unwrap().iter().any(|line| line == "Error on receive 10040"));
    }

    #[test]
    fn test_mtu_edge() {
        let (mut server, mut client, server_handle, client_handle) = connected_pair(42004);

        let max_payload = MTU - UdpHeader::SIZE;

        let mut buffer = client.begin_send(NULL_PIPELINE, client_handle).unwrap();
        assert!(buffer.write_bytes(&vec![7u8; max_payload]));
        assert_eq!(client.end_send(buffer), max_payload);

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        {
            let (kind, reader) = server.pop_event_for_connection(server_handle).unwrap();
            assert_eq!(kind, EventKind::Data);
            assert_eq!(reader.len(), max_payload);
        }

        // One byte more fails the write and nothing is transmitted.
        let mut buffer = client.begin_send(NULL_PIPELINE, client_handle).unwrap();
        assert!(!buffer.write_bytes(&vec![7u8; max_payload + 1]));
        assert_eq!(client.end_send(buffer), 0);

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        let (kind, _) = server.pop_event_for_connection(server_handle).unwrap();
        assert_eq!(kind, EventKind::Empty);
    }

    #[test]
    fn test_event_queue_reset_log() {
        let (logger, lines) = capture_logger();

        let mut server = Driver::new(IpcInterface::new(), test_params(), &logger);
        server.bind(&EndPoint::ipc_port(42005)).unwrap();
        server.listen().unwrap();

        let mut client = ipc_driver(test_params());
        let client_handle = client.connect(&EndPoint::ipc_port(42005)).unwrap();

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();
        assert!(server.accept().is_created());
        client.schedule_update().unwrap();
        {
            let (kind, _, _) = client.pop_event();
            assert_eq!(kind, EventKind::Connect);
        }

        let mut buffer = client.begin_send(NULL_PIPELINE, client_handle).unwrap();
        assert!(buffer.write_bytes(&[1]));
        client.end_send(buffer);
        client.schedule_update().unwrap();

        // The Data event lands on slot 0 and nobody pops it.
        server.schedule_update().unwrap();
        server.schedule_update().unwrap();

        assert!(lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line == "Resetting event queue with pending events (Count=1, ConnectionID=0) Listening: 1"));
    }

    #[test]
    fn test_five_client_fan_in() {
        let mut server = ipc_driver(test_params());
        server.bind(&EndPoint::ipc_port(42006)).unwrap();
        server.listen().unwrap();

        let mut clients: Vec<Driver<IpcInterface>> = (0..5).map(|_| ipc_driver(test_params())).collect();
        let handles: Vec<ConnectionId> = clients
            .iter_mut()
            .map(|client| client.connect(&EndPoint::ipc_port(42006)).unwrap())
            .collect();

        for client in clients.iter_mut() {
            client.schedule_update().unwrap();
        }
        server.schedule_update().unwrap();

        let mut accepted = Vec::new();
        loop {
            let handle = server.accept();
            if !handle.is_created() {
                break;
            }
            accepted.push(handle);
        }
        assert_eq!(accepted.len(), 5);

        for (client, handle) in clients.iter_mut().zip(handles.iter()) {
            client.schedule_update().unwrap();

            {
                let (kind, event_handle, _) = client.pop_event();
                assert_eq!(kind, EventKind::Connect);
                assert_eq!(event_handle, *handle);
            }

            let (kind, _, _) = client.pop_event();
            assert_eq!(kind, EventKind::Empty);
        }

        for handle in accepted {
            let (kind, _) = server.pop_event_for_connection(handle).unwrap();
            assert_eq!(kind, EventKind::Empty);
        }
    }

    #[test]
    fn test_connect_retry_exhaustion() {
        let mut params = test_params();
        params.max_connect_attempts = 3;

        let mut client = ipc_driver(params);
        // Nobody ever binds this port; requests queue into the void.
        let handle = client.connect(&EndPoint::ipc_port(42007)).unwrap();

        let mut connects = 0;
        let mut disconnects = 0;
        let mut ticks = 0u64;

        while ticks < 64 {
            client.schedule_update().unwrap();
            ticks += 1;

            loop {
                let (kind, event_handle, mut reader) = client.pop_event();
                match kind {
                    EventKind::Empty => break,
                    EventKind::Connect => connects += 1,
                    EventKind::Disconnect => {
                        assert_eq!(event_handle, handle);
                        assert_eq!(reader.read_byte(), DisconnectReason::MaxConnectionAttempts.code());
                        disconnects += 1;
                    }
                    kind => panic!("Unexpected event {:?}", kind),
                }
            }

            if disconnects > 0 {
                break;
            }
        }

        assert_eq!(connects, 0);
        assert_eq!(disconnects, 1);
        // Three attempts spaced a full timeout apart precede the failure.
        assert!(ticks * 16 >= 3 * 64);
    }

    #[test]
    fn test_idle_client_times_out() {
        let (mut server, client, server_handle, _client_handle) = connected_pair(42008);

        // The client goes silent for good.
        drop(client);

        let mut disconnects = 0;
        for _ in 0..64 {
            server.schedule_update().unwrap();

            loop {
                let (kind, mut reader) = server.pop_event_for_connection(server_handle).unwrap();
                match kind {
                    EventKind::Empty => break,
                    EventKind::Disconnect => {
                        assert_eq!(reader.read_byte(), DisconnectReason::Timeout.code());
                        disconnects += 1;
                    }
                    kind => panic!("Unexpected event {:?}", kind),
                }
            }

            if disconnects > 0 {
                break;
            }
        }

        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_slot_recycling_bumps_generation() {
        let (_server, mut client, _server_handle, client_handle) = connected_pair(42009);

        client.disconnect(client_handle).unwrap();
        {
            let (kind, _, _) = client.pop_event();
            assert_eq!(kind, EventKind::Disconnect);
        }
        client.schedule_update().unwrap();

        assert_eq!(client.connection_state(client_handle), ConnectionState::Empty);
        assert!(client.begin_send(NULL_PIPELINE, client_handle).is_err());

        let replacement = client.connect(&EndPoint::ipc_port(42009)).unwrap();

        assert_eq!(replacement.id, client_handle.id);
        assert_ne!(replacement, client_handle);
    }

    #[test]
    fn test_uncreated_handles_are_rejected() {
        let mut driver = ipc_driver(test_params());

        assert!(driver.disconnect(ConnectionId::default()).is_err());
        assert!(driver.begin_send(NULL_PIPELINE, ConnectionId::default()).is_err());

        let (kind, handle, _) = driver.pop_event();
        assert_eq!(kind, EventKind::Empty);
        assert!(!handle.is_created());
    }

    #[test]
    fn test_connect_auto_binds() {
        let mut client = ipc_driver(test_params());

        assert!(!client.is_bound());
        let handle = client.connect(&EndPoint::ipc_port(42010)).unwrap();

        assert!(handle.is_created());
        assert!(client.is_bound());
        client.local_endpoint().unwrap();
    }

    #[test]
    fn test_duplicate_request_and_peer_restart() {
        let mut server = ipc_driver(test_params());
        server.bind(&EndPoint::ipc_port(42011)).unwrap();
        server.listen().unwrap();

        let from = EndPoint::ipc_channel(0x7777);
        let mut raw = [0u8; UdpHeader::SIZE];

        // First request opens a slot; accept() claims it.
        UdpHeader::new(PacketType::ConnectionRequest, 0, 0).write(&mut raw);
        server.process_datagram(from, &raw, 16);

        let first = server.accept();
        assert!(first.is_created());

        // A duplicate carrying the session token replays the accept
        // without allocating a new slot.
        let token = server.connections.slot(first.index()).token;
        UdpHeader::new(PacketType::ConnectionRequest, token, 0).write(&mut raw);
        server.process_datagram(from, &raw, 32);

        assert!(!server.accept().is_created());
        assert_eq!(server.connection_state(first), ConnectionState::Connected);

        // A request without the token means the peer restarted: the old
        // session closes and a new one opens.
        UdpHeader::new(PacketType::ConnectionRequest, 0, 0).write(&mut raw);
        server.process_datagram(from, &raw, 48);

        {
            let (kind, mut reader) = server.pop_event_for_connection(first).unwrap();
            assert_eq!(kind, EventKind::Disconnect);
            assert_eq!(reader.read_byte(), DisconnectReason::ClosedByRemote.code());
        }

        let second = server.accept();
        assert!(second.is_created());
        assert_ne!(second, first);
    }

    #[test]
    fn test_unaccepted_connection_idles_out_silently() {
        let mut server = ipc_driver(test_params());
        server.bind(&EndPoint::ipc_port(42012)).unwrap();
        server.listen().unwrap();

        let mut raw = [0u8; UdpHeader::SIZE];
        UdpHeader::new(PacketType::ConnectionRequest, 0, 0).write(&mut raw);
        server.process_datagram(EndPoint::ipc_channel(0x7778), &raw, 0);

        for _ in 0..64 {
            server.schedule_update().unwrap();
        }

        assert!(!server.accept().is_created());

        let (kind, _, _) = server.pop_event();
        assert_eq!(kind, EventKind::Empty);
    }

    #[test]
    fn test_heartbeats_keep_connections_alive() {
        let (mut server, mut client, server_handle, client_handle) = connected_pair(42013);

        // Run well past the disconnect timeout; heartbeats on both sides
        // keep the liveness timers fresh.
        for _ in 0..96 {
            client.schedule_update().unwrap();
            server.schedule_update().unwrap();
        }

        assert_eq!(server.connection_state(server_handle), ConnectionState::Connected);
        assert_eq!(client.connection_state(client_handle), ConnectionState::Connected);
    }

    /// Prepends a fixed two byte tag on send and strips it on receive,
    /// failing the chain on a mismatch.
    struct TagStage;

    impl PipelineStage for TagStage {
        fn capacities(&self) -> StageCapacities {
            StageCapacities {
                receive: 0,
                send: 0,
                header: 2,
                shared: 0,
            }
        }

        fn send(&self, _io: StageIo<'_>, buffer: &mut StageBuffer<'_>, requests: &mut StageRequests) {
            if !buffer.prepend(&[0x5a, 0xa5]) {
                requests.error = true;
            }
        }

        fn receive(&self, _io: StageIo<'_>, buffer: &mut StageBuffer<'_>, requests: &mut StageRequests) {
            if buffer.len() < 2 || buffer.payload()[0] != 0x5a || buffer.payload()[1] != 0xa5 {
                requests.error = true;
                return;
            }

            buffer.strip(2);
        }
    }

    #[test]
    fn test_data_through_pipeline_stages() {
        let mut server = ipc_driver(test_params());
        let stage = server.register_stage(Box::new(TagStage));
        let server_pipeline = server.create_pipeline(&[stage]).unwrap();
        server.bind(&EndPoint::ipc_port(42014)).unwrap();
        server.listen().unwrap();

        let mut client = ipc_driver(test_params());
        let stage = client.register_stage(Box::new(TagStage));
        let client_pipeline = client.create_pipeline(&[stage]).unwrap();
        assert_eq!(client_pipeline, server_pipeline);

        let client_handle = client.connect(&EndPoint::ipc_port(42014)).unwrap();
        client.schedule_update().unwrap();
        server.schedule_update().unwrap();
        let server_handle = server.accept();
        client.schedule_update().unwrap();
        {
            let (kind, _, _) = client.pop_event();
            assert_eq!(kind, EventKind::Connect);
        }

        let mut buffer = client.begin_send(client_pipeline, client_handle).unwrap();
        assert_eq!(buffer.capacity(), MTU - UdpHeader::SIZE - 2);
        assert!(buffer.write_bytes(b"piped"));
        assert_eq!(client.end_send(buffer), 5);

        client.schedule_update().unwrap();
        server.schedule_update().unwrap();

        let (kind, mut reader) = server.pop_event_for_connection(server_handle).unwrap();
        assert_eq!(kind, EventKind::Data);

        let mut raw = [0u8; 5];
        assert!(reader.read_bytes(&mut raw));
        assert_eq!(&raw, b"piped");
    }

    #[test]
    fn test_pipelines_are_fixed_before_connections() {
        let mut server = ipc_driver(test_params());
        server.bind(&EndPoint::ipc_port(42015)).unwrap();
        server.listen().unwrap();

        let mut raw = [0u8; UdpHeader::SIZE];
        UdpHeader::new(PacketType::ConnectionRequest, 0, 0).write(&mut raw);
        server.process_datagram(EndPoint::ipc_channel(0x7779), &raw, 16);

        let stage = server.register_stage(Box::new(TagStage));
        assert_eq!(
            server.create_pipeline(&[stage]).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidState)
        );
    }
}
