use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::Builder;
use log::{debug, info, LevelFilter};

/// Where formatted log lines go: stderr until a file is attached
#[derive(Clone, Default)]
struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut file) => match file.as_mut() {
                Some(file) => file.write(buf),
                None => io::stderr().write(buf),
            },
            Err(_) => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut file) => match file.as_mut() {
                Some(file) => file.flush(),
                None => io::stderr().flush(),
            },
            Err(_) => io::stderr().flush(),
        }
    }
}

/// Handle to the installed logger, for applying settings that are only known
/// after configuration has been loaded
#[derive(Clone)]
pub struct LogHandle {
    sink: LogSink,
}

impl LogHandle {
    pub fn set_level(&self, log_level: &str) {
        let level = parse_level(log_level);
        log::set_max_level(level);
        debug!("Log level set to: {}", level);
    }

    /// Append all further output to `log_file`
    pub fn redirect_to_file(&self, log_file: &str) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file: {}", log_file))?;

        info!("Logging to file: {}", log_file);
        if let Ok(mut current) = self.sink.file.lock() {
            *current = Some(file);
        }
        Ok(())
    }
}

/// Initialise logging from `LOG_LEVEL` and `LOG_FILE`
pub fn init() -> Result<LogHandle> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    init_with(&log_level, log_file.as_deref())
}

pub fn init_with(log_level: &str, log_file: Option<&str>) -> Result<LogHandle> {
    let mut builder = Builder::new();
    let sink = LogSink::default();

    // The builder passes everything; the global max level does the filtering
    builder
        .format(|buf, record| {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                timestamp,
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter(None, LevelFilter::Trace)
        .target(env_logger::Target::Pipe(Box::new(sink.clone())));

    builder
        .try_init()
        .context("A global logger is already installed")?;

    let handle = LogHandle { sink };
    handle.set_level(log_level);
    if let Some(log_file) = log_file {
        handle.redirect_to_file(log_file)?;
    }
    Ok(handle)
}

/// Unknown names fall back to `Info`
pub fn parse_level(name: &str) -> LevelFilter {
    match name.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("loud"), LevelFilter::Info);
    }

    #[test]
    fn test_sink_switches_to_file() {
        let path = std::env::temp_dir().join(format!("osi-visualizer-log-{}.log", uuid::Uuid::new_v4()));
        let mut sink = LogSink::default();
        let handle = LogHandle { sink: sink.clone() };

        handle.redirect_to_file(path.to_str().unwrap()).unwrap();
        sink.write_all(b"captured line\n").unwrap();
        sink.flush().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "captured line\n");
        std::fs::remove_file(path).ok();
    }
}
