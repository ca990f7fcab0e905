pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger, Never, OwnedKVList, Record};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger. Binaries and tests that want output
/// use this as the root; library components receive a parent logger and
/// derive children from it.
pub fn term_logger() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Malformed embedded logging config");

    config.build_logger().expect("Logger construction failed")
}
