//! Process-wide tracing setup for the broker binaries.
//!
//! Everything is driven by environment variables so the same binary can log
//! human-readable output on a developer machine and JSON lines in a fleet.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/tmp/pool-broker.log";

/// Where formatted events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "file" => Self::File,
            "both" => Self::Both,
            "none" | "off" => Self::None,
            _ => Self::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, Self::Console | Self::Both)
    }

    fn file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogSettings {
    /// Reads `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT` and `LOG_FILE_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL").unwrap_or(defaults.level),
            output: lookup("LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            format: match lookup("LOG_FORMAT").as_deref() {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Human,
            },
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in ["sqlx=warn", "tokio=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }

    fn file_parts(&self) -> (&Path, &Path) {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/tmp"));
        let name = self
            .file_path
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("pool-broker.log"));
        (dir, name)
    }
}

// Writes every buffer to both sinks; succeeds if either does.
struct TeeWriter<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.first.write(buf);
        let second = self.second.write(buf);
        first.or(second)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

#[derive(Clone)]
struct MakeTeeWriter<A, B> {
    first: A,
    second: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTeeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = TeeWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            first: self.first.make_writer(),
            second: self.second.make_writer(),
        }
    }
}

/// Initializes the global tracing subscriber from environment variables.
///
/// The returned guard must be kept alive for as long as file logging should
/// flush; dropping it stops the background writer.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

/// Initializes the global tracing subscriber from explicit settings.
pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(settings.filter());
    let json = settings.format == LogFormat::Json;

    macro_rules! install {
        ($writer:expr) => {{
            let layer = tracing_subscriber::fmt::layer().with_writer($writer);
            if json {
                subscriber.with(layer.json()).init();
            } else {
                subscriber.with(layer.pretty()).init();
            }
        }};
    }

    if !settings.output.file() {
        if settings.output.console() {
            install!(io::stdout);
        } else {
            subscriber.init();
        }
        return None;
    }

    let (dir, name) = settings.file_parts();
    let appender = tracing_appender::rolling::daily(dir, name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    if settings.output.console() {
        install!(MakeTeeWriter {
            first: io::stdout,
            second: file_writer,
        });
    } else {
        install!(file_writer);
    }

    Some(guard)
}
