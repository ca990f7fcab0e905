use quark::logging::{self, Logger};
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
    Empty,
    Data,
    Connect,
    Disconnect,
}

#[derive(Debug, Copy, Clone)]
pub struct EventRecord {
    pub kind: EventKind,
    pub offset: usize,
    pub length: usize,
}

/// Bounded per-connection event FIFOs over a shared payload arena.
///
/// Events are produced during a driver tick and must be drained before the
/// next one: the driver resets any queue still holding events at tick
/// start, and a queue that overflows its capacity mid-tick resets the same
/// way. Both paths log the affected connection. Arena payloads stay valid
/// until the arena is cleared on the next tick.
pub struct EventQueue {
    queues: Vec<VecDeque<EventRecord>>,
    arena: Vec<u8>,
    capacity: usize,
    cursor: usize,
    resets: usize,
    log: Logger,
}

impl EventQueue {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(capacity: usize, log: L) -> EventQueue {
        let queue_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        EventQueue {
            queues: Vec::new(),
            arena: Vec::new(),
            capacity,
            cursor: 0,
            resets: 0,
            log: queue_log,
        }
    }

    /// The number of queue resets since construction.
    #[inline]
    pub fn resets(&self) -> usize {
        self.resets
    }

    #[inline]
    pub fn pending(&self, slot: usize) -> usize {
        self.queues.get(slot).map_or(0, VecDeque::len)
    }

    /// Appends an event, copying the payload into the arena. Returns true
    /// when an overflow reset destroyed a pending `Disconnect` event, which
    /// the caller must compensate for by releasing the slot itself.
    pub fn push(&mut self, slot: usize, kind: EventKind, payload: &[u8], listening: bool) -> bool {
        if slot >= self.queues.len() {
            self.queues.resize_with(slot + 1, VecDeque::new);
        }

        let mut dropped_disconnect = false;

        if self.queues[slot].len() >= self.capacity {
            dropped_disconnect = self.reset_queue(slot, listening);
        }

        let offset = self.arena.len();
        self.arena.extend_from_slice(payload);

        self.queues[slot].push_back(EventRecord {
            kind,
            offset,
            length: payload.len(),
        });

        dropped_disconnect
    }

    /// Pops the next event from any connection, round-robin fair across
    /// the per-connection queues.
    pub fn pop_any(&mut self) -> Option<(usize, EventRecord)> {
        if self.queues.is_empty() {
            return None;
        }

        for step in 0..self.queues.len() {
            let slot = (self.cursor + step) % self.queues.len();

            if let Some(record) = self.queues[slot].pop_front() {
                self.cursor = (slot + 1) % self.queues.len();
                return Some((slot, record));
            }
        }

        None
    }

    /// Pops the next event for one connection.
    #[inline]
    pub fn pop_for(&mut self, slot: usize) -> Option<EventRecord> {
        self.queues.get_mut(slot).and_then(VecDeque::pop_front)
    }

    #[inline]
    pub fn payload(&self, offset: usize, length: usize) -> &[u8] {
        &self.arena[offset..offset + length]
    }

    /// Tick-start hygiene: resets every queue still holding events and
    /// clears the arena. Returns the slots whose destroyed events included
    /// a `Disconnect`.
    pub fn reset_pending(&mut self, listening: bool) -> Vec<usize> {
        let mut dropped = Vec::new();

        for slot in 0..self.queues.len() {
            if !self.queues[slot].is_empty() && self.reset_queue(slot, listening) {
                dropped.push(slot);
            }
        }

        self.arena.clear();
        dropped
    }

    fn reset_queue(&mut self, slot: usize, listening: bool) -> bool {
        let queue = &mut self.queues[slot];

        logging::warn!(
            self.log,
            "Resetting event queue with pending events (Count={}, ConnectionID={}) Listening: {}",
            queue.len(),
            slot,
            listening as u8
        );

        let dropped_disconnect = queue.iter().any(|record| record.kind == EventKind::Disconnect);
        queue.clear();
        self.resets += 1;

        dropped_disconnect
    }
}
