use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::field::Field;
use tracing::span::Attributes;
use tracing::{Id, Level, Subscriber};
use tracing_subscriber::field::Visit;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const CSV_HEADER: &str = "tick,target,span,duration_ns";

/// Records the time spent inside a span, i.e. between enter and exit, and writes one csv row per
/// closed span. Spans more verbose than `level` are ignored. If a span carries a field named `now`,
/// its value is written as tick.
pub struct SpanDurationToCSVLayer {
    writer: Arc<Mutex<BufWriter<File>>>,
    level: Level,
}

/// Flushes the csv file when dropped.
pub struct WriterGuard {
    writer_ref: Arc<Mutex<BufWriter<File>>>,
}

struct SpanDuration {
    elapsed: u64,
    last: Instant,
}

struct SimTime(u64);

#[derive(Default)]
struct TickVisitor {
    now: Option<u64>,
}

impl Visit for TickVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "now" {
            self.now = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn Debug) {}
}

impl SpanDurationToCSVLayer {
    pub fn new(path: &Path, level: Level) -> io::Result<(Self, WriterGuard)> {
        if let Some(prefix) = path.parent() {
            fs::create_dir_all(prefix)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{CSV_HEADER}")?;

        // the mutex is necessary, because the Layer must be Sync + Send for the subscriber. The
        // guard keeps a second reference, so that the file can be flushed at the end of the run.
        let writer_ref = Arc::new(Mutex::new(writer));
        let layer = SpanDurationToCSVLayer {
            writer: writer_ref.clone(),
            level,
        };
        Ok((layer, WriterGuard { writer_ref }))
    }

    fn is_recorded(&self, level: &Level) -> bool {
        *level <= self.level
    }
}

impl<S> Layer<S> for SpanDurationToCSVLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if !self.is_recorded(attrs.metadata().level()) {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = TickVisitor::default();
        attrs.record(&mut visitor);

        let mut extensions = span.extensions_mut();
        extensions.insert(SpanDuration {
            elapsed: 0,
            last: Instant::now(),
        });
        if let Some(now) = visitor.now {
            extensions.insert(SimTime(now));
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(timing) = span.extensions_mut().get_mut::<SpanDuration>() {
                timing.last = Instant::now();
            }
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(timing) = span.extensions_mut().get_mut::<SpanDuration>() {
                timing.elapsed += timing.last.elapsed().as_nanos() as u64;
            }
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let extensions = span.extensions();
        let Some(duration) = extensions.get::<SpanDuration>() else {
            return;
        };
        let tick = extensions
            .get::<SimTime>()
            .map(|t| t.0.to_string())
            .unwrap_or_default();
        let meta = span.metadata();

        if let Ok(mut writer) = self.writer.lock() {
            // a failing write must not take the simulation down
            let _ = writeln!(
                writer,
                "{},{},{},{}",
                tick,
                meta.target(),
                meta.name(),
                duration.elapsed
            );
        }
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer_ref.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tracing::{info_span, trace_span, Level};
    use tracing_subscriber::layer::SubscriberExt;

    use crate::simulation::profiling::SpanDurationToCSVLayer;

    #[test]
    fn spans_are_written_as_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instrument").join("spans.csv");

        {
            let (layer, _guard) = SpanDurationToCSVLayer::new(&path, Level::INFO).unwrap();
            let subscriber = tracing_subscriber::registry().with(layer);
            tracing::subscriber::with_default(subscriber, || {
                let span = info_span!("step", now = 42u64);
                span.in_scope(|| {});
                drop(span);
                // more verbose than the configured level
                let span = trace_span!("ignored");
                span.in_scope(|| {});
            });
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!("tick,target,span,duration_ns", lines[0]);
        assert_eq!(2, lines.len());
        assert!(lines[1].starts_with("42,"));
        assert!(lines[1].contains(",step,"));
    }
}
