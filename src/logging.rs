use std::path::Path;

use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};

use crate::config::LoggingConfig;
use crate::error::CoursePulseError;

const LOG_BASENAME: &str = "coursepulse";
const ROTATE_BYTES: u64 = 1024 * 1024;
const KEEP_LOG_FILES: usize = 2;

/// Start file logging under `<data_dir>/logs`. The returned handle must be kept alive for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig, data_dir: &Path) -> Result<LoggerHandle, CoursePulseError> {
    let duplicate = if config.log_to_stderr {
        Duplicate::All
    } else {
        Duplicate::None
    };

    let handle = Logger::try_with_str(config.log_spec())?
        .log_to_file(
            FileSpec::default()
                .directory(data_dir.join("logs"))
                .basename(LOG_BASENAME),
        )
        .format_for_files(detailed_format)
        .rotate(
            Criterion::Size(ROTATE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_LOG_FILES),
        )
        .duplicate_to_stderr(duplicate)
        .start()?;

    Ok(handle)
}
