//! Logging setup.
//!
//! `env_logger` writes to stdout; when a log file is configured every line
//! is also appended to it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use env_logger::{Env, Target};

use crate::models::LoggingConfig;

/// Initialize the global logger. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(config: &LoggingConfig) -> io::Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));

    if let Some(path) = &config.file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    } else {
        builder.target(Target::Stdout);
    }

    builder
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Writes to stdout and a log file
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}
