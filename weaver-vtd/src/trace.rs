use std::io::BufWriter;
use std::io::Write;
use std::str::FromStr;

use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;

/// A week of daily files before rotation starts discarding.
const MAX_LOG_FILES: usize = 7;

const LOG_BUF_CAPACITY: usize = 8 * 1024 * 1024;

/// Everything at the requested level goes to daily-rolling files; warnings
/// out of the daemon's own crates are mirrored to the operator on stderr
/// (protocol violations, membership changes, unreachable peers). The
/// returned guards flush buffered log lines on drop.
pub fn init_logging(dir: &str, level: &str) -> Result<Vec<Box<dyn Drop + Send + Sync + 'static>>> {
    let mut guards: Vec<Box<dyn Drop + Send + Sync + 'static>> = Vec::new();

    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("weaver-vtd.log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    let (non_blocking, flush_guard) = tracing_appender::non_blocking(rolling);
    guards.push(Box::new(flush_guard));

    let file_writer = BufWriter::with_capacity(LOG_BUF_CAPACITY, non_blocking);
    let dispatch_file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {} | {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::from_str(level)?)
        .chain(Box::new(file_writer) as Box<dyn Write + Send>);

    let colors = ColoredLevelConfig::new().warn(Color::Yellow).error(Color::Red);
    let dispatch_stderr = fern::Dispatch::new()
        .level(LevelFilter::Warn)
        // weaver:: and weaver_vtd:: targets both carry this prefix
        .filter(|metadata| metadata.target().starts_with("weaver"))
        .format(move |out, message, record| {
            out.finish(format_args!("{} {}", colors.color(record.level()), message))
        })
        .chain(std::io::stderr());

    if fern::Dispatch::new().chain(dispatch_file).chain(dispatch_stderr).apply().is_err() {
        eprintln!("logger has already been set");
        return Ok(Vec::new());
    }

    Ok(guards)
}
