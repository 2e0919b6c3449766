//! Process-wide tracing setup shared by the devhost binaries.
//!
//! Behaviour is driven by environment variables:
//!
//! - `DEVHOST_LOG_LEVEL`: default filter level (`info`). `RUST_LOG` wins when set.
//! - `DEVHOST_LOG_OUTPUT`: `console`, `file` or `both`.
//! - `DEVHOST_LOG_FORMAT`: `human` or `json`.
//! - `DEVHOST_LOG_FILE`: base path of the daily rolling log file.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/tmp/devhost.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Console,
        }
    }

    fn to_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
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
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            level: lookup("DEVHOST_LOG_LEVEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.level),
            output: lookup("DEVHOST_LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            format: lookup("DEVHOST_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.format),
            file_path: lookup("DEVHOST_LOG_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }

    /// Directory and file-name prefix for the rolling appender.
    fn file_parts(&self) -> (PathBuf, PathBuf) {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/tmp"));
        let name = self
            .file_path
            .file_name()
            .unwrap_or_else(|| "devhost.log".as_ref());
        (dir.to_path_buf(), PathBuf::from(name))
    }

    fn env_filter(&self) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        ["tokio=warn", "hyper=warn", "sqlx=warn"]
            .into_iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, directive| f.add_directive(directive))
    }
}

/// Writes every record to two writers.
struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.first.write_all(buf);
        let second = self.second.write_all(buf);
        first.and(second).map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    first: A,
    second: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            first: self.first.make_writer(),
            second: self.second.make_writer(),
        }
    }
}

macro_rules! install {
    ($writer:expr, $format:expr, $filter:expr) => {{
        let layer = tracing_subscriber::fmt::layer()
            .with_writer($writer)
            .with_target(true);
        let subscriber = registry().with($filter);
        match $format {
            LogFormat::Json => subscriber.with(layer.json()).try_init(),
            LogFormat::Human => subscriber.with(layer.pretty()).try_init(),
        }
    }};
}

/// Install the global subscriber described by `DEVHOST_LOG_*`.
///
/// Keep the returned guard alive for the life of the process when file
/// output is enabled, otherwise buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

/// Install the global subscriber for explicit settings.
pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let filter = settings.env_filter();
    let (dir, name) = settings.file_parts();

    let (guard, result) = match (settings.output.to_console(), settings.output.to_file()) {
        (true, true) => {
            let (file, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, name),
            );
            let writer = MakeTee {
                first: io::stdout,
                second: file,
            };
            (Some(guard), install!(writer, settings.format, filter))
        }
        (false, true) => {
            let (file, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, name),
            );
            (Some(guard), install!(file, settings.format, filter))
        }
        _ => (None, install!(io::stdout, settings.format, filter)),
    };

    if let Err(e) = result {
        // A subscriber is already installed (tests, embedding); keep it
        eprintln!("devhost-logging: subscriber not installed: {e}");
    }
    guard
}
