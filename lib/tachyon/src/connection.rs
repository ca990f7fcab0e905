use crate::endpoint::EndPoint;
use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// A stable handle to a virtual connection. The generation disambiguates
/// reused slots: a handle minted before a slot was recycled no longer
/// matches. Generation zero marks a handle that was never created.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    pub id: i32,
    pub generation: i32,
}

impl ConnectionId {
    #[inline]
    pub fn is_created(&self) -> bool {
        self.generation != 0
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.id as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Empty,
    Connecting,
    AwaitingResponse,
    Connected,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    Default,
    Timeout,
    MaxConnectionAttempts,
    ClosedByRemote,
    ClosedByLocal,
}

impl DisconnectReason {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            DisconnectReason::Default => 0,
            DisconnectReason::Timeout => 1,
            DisconnectReason::MaxConnectionAttempts => 2,
            DisconnectReason::ClosedByRemote => 3,
            DisconnectReason::ClosedByLocal => 4,
        }
    }
}

/// Per-slot connection record. Timers are milliseconds on the driver's
/// tick clock. The scratch vector holds one contiguous arena per
/// registered pipeline, zeroed when the record is created.
pub struct Connection {
    pub generation: i32,
    pub state: ConnectionState,
    pub address: EndPoint,
    pub token: u16,
    pub last_receive: u64,
    pub last_send: u64,
    pub last_attempt: u64,
    pub attempts: u16,
    pub reason: DisconnectReason,
    pub accept_pending: bool,
    pub release_pending: bool,
    pub scratch: Vec<Vec<u8>>,
}

impl Connection {
    fn new(generation: i32) -> Connection {
        Connection {
            generation,
            state: ConnectionState::Empty,
            address: EndPoint::default(),
            token: 0,
            last_receive: 0,
            last_send: 0,
            last_attempt: 0,
            attempts: 0,
            reason: DisconnectReason::Default,
            accept_pending: false,
            release_pending: false,
            scratch: Vec::new(),
        }
    }

    fn open(&mut self, address: EndPoint, state: ConnectionState, now: u64, scratch: Vec<Vec<u8>>) {
        self.state = state;
        self.address = address;
        self.token = 0;
        self.last_receive = now;
        self.last_send = now;
        self.last_attempt = 0;
        self.attempts = 0;
        self.reason = DisconnectReason::Default;
        self.accept_pending = false;
        self.release_pending = false;
        self.scratch = scratch;
    }
}

/// Slot allocator for connection records. Released slots return to a free
/// list with their generation bumped so stale handles compare unequal.
pub struct ConnectionList {
    slots: Vec<Connection>,
    free: Vec<usize>,
}

impl ConnectionList {
    #[inline]
    pub fn new() -> ConnectionList {
        ConnectionList {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Opens a record in the given state and returns its handle.
    pub fn acquire(
        &mut self,
        address: EndPoint,
        state: ConnectionState,
        now: u64,
        scratch: Vec<Vec<u8>>,
    ) -> ConnectionId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Connection::new(1));
                self.slots.len() - 1
            }
        };

        self.slots[index].open(address, state, now, scratch);
        self.handle(index)
    }

    /// Returns the record to the free list. The generation advances so any
    /// outstanding handle goes stale.
    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];

        if slot.state == ConnectionState::Empty {
            return;
        }

        slot.state = ConnectionState::Empty;
        slot.address = EndPoint::default();
        slot.token = 0;
        slot.accept_pending = false;
        slot.release_pending = false;
        slot.scratch = Vec::new();
        slot.generation += 1;

        self.free.push(index);
    }

    /// The current handle for a slot.
    #[inline]
    pub fn handle(&self, index: usize) -> ConnectionId {
        ConnectionId {
            id: index as i32,
            generation: self.slots[index].generation,
        }
    }

    /// Validates a user-supplied handle and resolves it to a slot index.
    pub fn check(&self, handle: ConnectionId) -> NetworkResult<usize> {
        if !handle.is_created() {
            return Err(NetworkError::Fatal(ErrorType::StaleHandle));
        }

        let index = handle.index();

        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation && slot.state != ConnectionState::Empty => Ok(index),
            _ => Err(NetworkError::Fatal(ErrorType::StaleHandle)),
        }
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &Connection {
        &self.slots[index]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut Connection {
        &mut self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_one() -> (ConnectionList, ConnectionId) {
        let mut list = ConnectionList::new();
        let handle = list.acquire(EndPoint::ipc_channel(1), ConnectionState::Connecting, 100, Vec::new());
        (list, handle)
    }

    #[test]
    fn test_acquire_produces_created_handle() {
        let (list, handle) = list_with_one();

        assert!(handle.is_created());
        assert_ne!(handle, ConnectionId::default());
        assert_eq!(list.check(handle).unwrap(), 0);
        assert_eq!(list.slot(0).state, ConnectionState::Connecting);
        assert_eq!(list.slot(0).last_receive, 100);
    }

    #[test]
    fn test_release_bumps_generation() {
        let (mut list, handle) = list_with_one();

        list.release(0);

        assert_eq!(list.slot(0).state, ConnectionState::Empty);
        assert_eq!(
            list.check(handle).unwrap_err(),
            NetworkError::Fatal(ErrorType::StaleHandle)
        );

        let recycled = list.acquire(EndPoint::ipc_channel(2), ConnectionState::AwaitingResponse, 200, Vec::new());

        assert_eq!(recycled.index(), 0);
        assert_ne!(recycled, handle);
        assert_eq!(list.check(recycled).unwrap(), 0);
    }

    #[test]
    fn test_default_handle_is_not_created() {
        let (list, _) = list_with_one();

        assert!(!ConnectionId::default().is_created());
        assert!(list.check(ConnectionId::default()).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut list, _) = list_with_one();

        list.release(0);
        let generation = list.slot(0).generation;
        list.release(0);

        assert_eq!(list.slot(0).generation, generation);
    }
}
