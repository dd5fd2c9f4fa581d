pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a logger from the supplied `sloggers` TOML configuration string.
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("Invalid logger configuration");

    config.build_logger().expect("Logger construction failed")
}

/// Stderr terminal logger with the default configuration.
pub fn terminal() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Logger that throws everything away. Used by objects constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
