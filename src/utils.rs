use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Keeps printable ASCII and whitespace only
pub fn filter_printable_chars(input: &str) -> String {
    input.chars()
        .filter(|c| {
            c.is_ascii_graphic() ||
            c.is_ascii_whitespace() ||
            *c == '\n' ||
            *c == '\r' ||
            *c == '\t'
        })
        .collect()
}

/// Turns control and non-ASCII characters into escape sequences
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() || c == '\n' || c == '\r' => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Timestamped logger for the `log` facade: console, plus an optional
/// append-only file that always receives the unfiltered line.
pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    raw_display: bool,
    level: LevelFilter,
}

impl Logger {
    pub fn new(log_file: Option<&Path>, raw_display: bool, level: LevelFilter) -> io::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self { writer, raw_display, level })
    }

    /// Installs this logger as the global `log` backend.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Dependencies (DNS resolver, TLS) only get through with warnings.
        if !metadata.target().starts_with("mailsharp") && metadata.level() > Level::Warn {
            return false;
        }
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("{} {:<5} {}\n", timestamp, record.level(), record.args());

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        if let Some(writer) = &self.writer {
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.write_all(log_line.as_bytes());
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(writer) = &self.writer {
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filter_printable_chars() {
        assert_eq!(filter_printable_chars("MAIL\x1b[31m FROM\x00:<a>\r\n"), "MAIL[31m FROM:<a>\r\n");
        assert_eq!(filter_printable_chars("caf\u{e9}"), "caf");
    }

    #[test]
    fn test_safe_log_string() {
        assert_eq!(safe_log_string("a\0b\x1bc\u{e9}\r\n"), "a\\0b\\x1bc\\u{e9}\r\n");
    }

    #[test]
    fn test_logger_writes_file_and_filters_level() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("mailsharp.log");
        let logger = Logger::new(Some(&path), false, LevelFilter::Info).unwrap();

        logger.log(
            &Record::builder()
                .args(format_args!("[1] 192.0.2.1:4000 >> EHLO \x07client"))
                .level(Level::Info)
                .target("mailsharp::session")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("hidden at info"))
                .level(Level::Debug)
                .target("mailsharp::session")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("resolver chatter"))
                .level(Level::Info)
                .target("hickory_proto::udp")
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        // The file keeps the raw line.
        assert!(written.contains(" INFO  [1] 192.0.2.1:4000 >> EHLO \x07client"));
    }
}
