use flexi_logger::{FileSpec, Logger, LoggerHandle, WriteMode};
use once_cell::sync::OnceCell;

use crate::config::LoggingConfig;
use crate::error::DaemonError;

/// Keeps the logger alive for the life of the process.
static LOGGER: OnceCell<LoggerHandle> = OnceCell::new();

/// Installs the process logger for applications embedding the daemons.
///
/// The crate itself only talks to the `log` facade; this is a convenience
/// for hosts that do not bring their own logger. Calling it again after a
/// successful initialisation does nothing.
pub fn init_logging(config: &LoggingConfig) -> Result<(), DaemonError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }

    let spec = format!("warn, dbdaemon={}", config.dbdaemon);
    let logger = Logger::try_with_str(&spec)?.format(flexi_logger::detailed_format);

    let logger = match &config.directory {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("dbdaemon"))
            .write_mode(WriteMode::BufferAndFlush),
        None => logger.log_to_stderr(),
    };

    let handle = logger.start()?;
    let _ = LOGGER.set(handle);

    Ok(())
}
