//! `Tachyon` is a connection-oriented, datagram-based messaging layer for
//! games: virtual connections with handshake, liveness and retransmission
//! timers over unreliable datagram interfaces (UDP or an in-process
//! exchange), composable pipeline stages applied symmetrically on send and
//! receive, and a bit-packed stream codec.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod events;
pub mod interface;
pub mod ipc;
pub mod params;
pub mod pipeline;
pub mod protocol;
pub mod shared;
pub mod stream;
pub mod udp;

pub mod prelude;
