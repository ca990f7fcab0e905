use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Driver tuning parameters. All timeouts are milliseconds on the driver's
/// tick clock. A nonzero `fixed_frame_time_ms` advances the clock by that
/// amount per tick instead of following the wall clock, which makes timer
/// behavior reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u16,
    pub disconnect_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub fixed_frame_time_ms: u64,
    pub receive_buffer_size: usize,
    pub dynamic_stream_size: bool,
    pub max_receive_buffer_size: usize,
    pub event_queue_capacity: usize,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            connect_timeout_ms: 1000,
            max_connect_attempts: 60,
            disconnect_timeout_ms: 30_000,
            heartbeat_timeout_ms: 500,
            fixed_frame_time_ms: 0,
            receive_buffer_size: 65536,
            dynamic_stream_size: false,
            max_receive_buffer_size: 1 << 20,
            event_queue_capacity: 32,
        }
    }
}

impl Params {
    pub fn load<P: AsRef<Path>>(path: P) -> Params {
        serdeconv::from_toml_file(path).expect("Error loading driver configuration file")
    }
}
