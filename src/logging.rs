use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};

use crate::config::LoggingConfig;
use crate::error::MapMarkError;

/// Level for third-party crates; only our own crate follows the configured level.
const DEPENDENCY_LEVEL: &str = "warn";

/// Starts the global logger. The returned handle must stay alive for the
/// lifetime of the process or buffered output is lost.
pub fn init(config: &LoggingConfig) -> Result<LoggerHandle, MapMarkError> {
    let logger = Logger::try_with_str(log_spec(config))?.format(flexi_logger::detailed_format);

    let logger = match config.file() {
        Some(file) => logger
            .log_to_file(FileSpec::try_from(file)?.suppress_timestamp())
            .append()
            .duplicate_to_stderr(Duplicate::Warn),
        None => logger.log_to_stderr(),
    };

    Ok(logger.start()?)
}

fn log_spec(config: &LoggingConfig) -> String {
    format!("{}, mapmark={}", DEPENDENCY_LEVEL, config.level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_spec_scopes_level_to_crate() {
        let config = LoggingConfig {
            level: "debug".into(),
            file: None,
        };
        assert_eq!(log_spec(&config), "warn, mapmark=debug");
    }
}
