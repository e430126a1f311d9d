//! Newline-delimited JSON logging for the harness binary, in the same
//! spirit as the runtime's own CSV metrics: one self-contained record per
//! line, safe to `tail -f | jq` while a scenario is running.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: f64,
    level: LogLevel,
    event: &'a str,
    detail: &'a str,
}

pub struct StructuredLogger<W: Write> {
    sink: W,
}

impl<W: Write> StructuredLogger<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn log(&mut self, level: LogLevel, event: &str, detail: &str) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let entry = LogEntry {
            timestamp,
            level,
            event,
            detail,
        };
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(self.sink, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_one_json_object_per_line() {
        let mut buf = Vec::new();
        {
            let mut logger = StructuredLogger::new(&mut buf);
            logger.log(LogLevel::Info, "store_created", "blocks=16");
            logger.log(LogLevel::Warn, "store_full", "name=scenario");
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "store_created");
        assert_eq!(first["level"], "info");
    }
}
