use std::io;
use std::path::Path;

use tracing::dispatcher::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::{fmt, registry};

use crate::simulation::config::{Config, Logging, Profiling};
use crate::simulation::profiling::{SpanDurationToCSVLayer, WriterGuard};

const LOG_FILE_NAME: &str = "log.json";
const INSTRUMENT_FILE_NAME: &str = "instrument.csv";

// Keeps the writers alive. Once dropped, pending log lines are flushed and the default subscriber
// is reset.
#[allow(dead_code)]
pub struct LogGuards {
    csv_guard: Option<WriterGuard>,
    log_guard: Option<WorkerGuard>,
    default: DefaultGuard,
}

pub fn init_std_out_logging_thread_local() -> DefaultGuard {
    let collector = registry().with(
        fmt::Layer::new()
            .with_writer(io::stdout)
            .with_filter(LevelFilter::INFO),
    );
    tracing::subscriber::set_default(collector)
}

/// Installs the subscriber for the current thread: console output at INFO, a json log file if
/// `output.logging` is `Info`, and a span duration csv if `output.profiling` is set.
pub fn init_logging(config: &Config) -> io::Result<LogGuards> {
    let output = config.output();
    let dir = Path::new(&output.output_dir);

    let (csv_layer, csv_guard) = match &output.profiling {
        Profiling::CSV(level) => {
            let path = dir.join("instrument").join(INSTRUMENT_FILE_NAME);
            let (layer, guard) =
                SpanDurationToCSVLayer::new(&path, level.create_tracing_level())?;
            (Some(layer), Some(guard))
        }
        Profiling::None => (None, None),
    };

    let (log_layer, log_guard) = if Logging::Info == output.logging {
        std::fs::create_dir_all(dir)?;
        let (log_file, log_guard) = non_blocking(rolling::never(dir, LOG_FILE_NAME));
        let layer = fmt::Layer::new()
            .with_writer(log_file)
            .json()
            .with_ansi(false)
            .with_filter(LevelFilter::INFO);
        (Some(layer), Some(log_guard))
    } else {
        (None, None)
    };

    let console_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(LevelFilter::INFO);

    // layers which are None are simply not added
    let collector = registry()
        .with(log_layer)
        .with(console_layer)
        .with(csv_layer);
    let default = tracing::subscriber::set_default(collector);

    Ok(LogGuards {
        csv_guard,
        log_guard,
        default,
    })
}
