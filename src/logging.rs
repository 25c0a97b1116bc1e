//! Logging setup
//!
//! Console logging with level colors plus optional rolling file output.

use std::path::Path;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const COLOR_TRACE: &str = "\x1b[37m"; // White
const COLOR_DEBUG: &str = "\x1b[36m"; // Cyan
const COLOR_INFO: &str = "\x1b[32m"; // Green
const COLOR_WARN: &str = "\x1b[33m"; // Yellow
const COLOR_ERROR: &str = "\x1b[31m"; // Red

/// Initialize logging with the given configuration
pub fn init_logging(
    log_level: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let level = parse_log_level(log_level)?;

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("troublemaker=trace".parse()?);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(LogFormatter { ansi: true });

    let file_layer = if log_to_file {
        let file_path = Path::new(log_file_path.unwrap_or("logs/troublemaker.log"));
        let directory = file_path.parent().unwrap_or_else(|| Path::new("logs"));
        let file_name = file_path
            .file_name()
            .unwrap_or_else(|| "troublemaker.log".as_ref());
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .event_format(LogFormatter { ansi: false }),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);
    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).init();
    } else {
        registry.with(console_layer).init();
    }

    Ok(())
}

/// Custom log formatter with level colors
struct LogFormatter {
    ansi: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let now = std::time::SystemTime::now();
        let datetime: chrono::DateTime<chrono::Utc> = now.into();
        write!(writer, "[{}] ", datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC"))?;

        if self.ansi {
            let level_color = match *metadata.level() {
                Level::TRACE => COLOR_TRACE,
                Level::DEBUG => COLOR_DEBUG,
                Level::INFO => COLOR_INFO,
                Level::WARN => COLOR_WARN,
                Level::ERROR => COLOR_ERROR,
            };
            write!(writer, "{}{:<5}\x1b[0m ", level_color, metadata.level())?;
        } else {
            write!(writer, "{:<5} ", metadata.level())?;
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}
