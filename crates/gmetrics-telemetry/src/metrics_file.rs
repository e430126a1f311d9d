//! Gzipped CSV metrics files.
//!
//! Each file gets a two-column synthetic prefix (`generation,timestamp`)
//! followed by the caller's declared columns, written once as a header.
//! Writing a row is a three-step protocol: `start_record` captures a
//! timestamp, one or more `add_row` calls append a line, and
//! `end_record` advances the generation counter and decides how hard to
//! flush.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;

/// How hard `end_record` should push buffered bytes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushKind {
    None,
    Partial,
    Full,
}

pub struct MetricsFile {
    path: PathBuf,
    encoder: GzEncoder<File>,
    column_count: usize,
    generation: u64,
    current_timestamp: Option<f64>,
}

impl MetricsFile {
    /// Creates (truncating) the file at `path` and writes its header row.
    pub fn create(path: impl AsRef<Path>, columns: &[&str]) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let header = format!("generation,timestamp,{}\n", columns.join(","));
        encoder.write_all(header.as_bytes())?;
        Ok(Self { path, encoder, column_count: columns.len(), generation: 0, current_timestamp: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Captures the wall-clock timestamp this record's rows will share.
    pub fn start_record(&mut self) {
        self.current_timestamp = Some(wallclock_seconds());
    }

    /// Appends one CSV row. `values.len()` must equal the column count
    /// the file was created with.
    pub fn add_row(&mut self, values: &[String]) -> io::Result<()> {
        debug_assert_eq!(values.len(), self.column_count);
        let timestamp = self.current_timestamp.unwrap_or_else(wallclock_seconds);
        let line = format!("{},{},{}\n", self.generation, timestamp, values.join(","));
        write_with_eintr_retry(&mut self.encoder, line.as_bytes())
    }

    /// Advances the generation counter and flushes accordingly: full
    /// flush if a flush was requested externally, partial flush every
    /// tenth generation, otherwise none.
    pub fn end_record(&mut self, flush_requested: bool) -> io::Result<()> {
        self.generation += 1;
        let kind = if flush_requested {
            FlushKind::Full
        } else if self.generation % 10 == 0 {
            FlushKind::Partial
        } else {
            FlushKind::None
        };
        match kind {
            FlushKind::None => Ok(()),
            FlushKind::Partial => self.encoder.flush(),
            FlushKind::Full => {
                self.encoder.flush()?;
                self.encoder.get_ref().sync_all()
            }
        }
    }
}

fn wallclock_seconds() -> f64 {
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    duration.as_secs() as f64 + duration.subsec_nanos() as f64 / 1e9
}

fn write_with_eintr_retry<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    match writer.write_all(bytes) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => writer.write_all(bytes),
        Err(e) => {
            // Non-fatal: a dropped row never aborts the tick loop.
            eprintln!("gmetrics: dropping metrics row after write error: {e}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_rows_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.csv.gz");
        let mut file = MetricsFile::create(&path, &["count", "bytes"]).unwrap();
        file.start_record();
        file.add_row(&["1".to_string(), "64".to_string()]).unwrap();
        file.end_record(false).unwrap();
        assert_eq!(file.generation(), 1);
    }

    #[test]
    fn flush_policy_matches_signal_then_decade_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.csv.gz");
        let mut file = MetricsFile::create(&path, &["x"]).unwrap();

        file.start_record();
        file.add_row(&["0".to_string()]).unwrap();
        file.end_record(true).unwrap(); // generation 1, full flush from signal
        assert_eq!(file.generation(), 1);

        for _ in 0..8 {
            file.start_record();
            file.add_row(&["0".to_string()]).unwrap();
            file.end_record(false).unwrap(); // generations 2..9, no flush
        }
        assert_eq!(file.generation(), 9);

        file.start_record();
        file.add_row(&["0".to_string()]).unwrap();
        file.end_record(false).unwrap(); // generation 10, partial flush
        assert_eq!(file.generation(), 10);
    }
}
