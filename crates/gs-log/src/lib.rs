//! Shared `tracing` setup for the three binaries (`gs-meta`, `gs-agent`,
//! `gs-cli`).
//!
//! Each process calls [`init`] once at startup with its own service name;
//! `RUST_LOG` always wins over the default filter. A single `gs-agent`
//! process supervises many runtimes concurrently in-process, so there is no
//! per-runtime process boundary to hang a second global subscriber off of;
//! [`RuntimeFileLog`] instead gives each supervised runtime its own
//! non-blocking file writer, independent of (and in addition to) the
//! process-wide stderr subscriber set up by [`init`].

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn filter(default_directives: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives)
    }
}

/// Initializes a stderr-only subscriber. `service` is attached to every
/// span/event via the `service` field so multi-process logs stay
/// attributable when aggregated.
pub fn init(service: &str) {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter("info"))
        .try_init();
    tracing::info!(service, "logging initialized");
}

/// A single runtime's persisted stderr log: a non-blocking writer over a
/// file at `path`, truncated on open. Lines written through [`write_line`]
/// land only in this file — the process's own `tracing` subscriber (set up
/// once via [`init`]) is untouched, so many of these can coexist per
/// process.
///
/// [`write_line`]: RuntimeFileLog::write_line
pub struct RuntimeFileLog {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl RuntimeFileLog {
    /// Opens (truncating) the log file at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> std::io::Result<RuntimeFileLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Truncate-on-start: open then drop so the appender starts from empty.
        std::fs::File::create(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().expect("log path has a file name");
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(RuntimeFileLog { writer, _guard: guard })
    }

    /// Appends one line (a trailing `\n` is added).
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        use std::io::Write;
        writeln!(self.writer, "{line}")
    }
}
