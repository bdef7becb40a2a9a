//! Logger initialization.
//!
//! Plain `log` + `env_logger` rather than `tracing` (kept here rather than
//! swapped for the heavier crate the spec's "structured logging" ambient
//! requirement might otherwise suggest). The one addition over a bare
//! stderr-only setup is a file target, since `serve` must write to
//! `<cache-dir>/server.log` per spec §6 even when it isn't attached to a
//! terminal.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

/// Initializes the global logger once for the `serve` command.
///
/// Writes to `log_path` always; additionally mirrors to stderr when
/// `foreground` is set, so `prise serve` run interactively still shows
/// output without duplicating it when run under a service supervisor.
pub fn init(log_path: &Path, foreground: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| Error::fatal(format!("cannot open log file {}: {e}", log_path.display())))?;

    let target: Box<dyn Write + Send> = if foreground {
        Box::new(TeeWriter { file })
    } else {
        Box::new(file)
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(target))
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| Error::fatal(format!("logger already initialized: {e}")))
}

/// Writes every line to both the log file and stderr.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}
