//! The one built-in tick handler: dumps the metrics store's own
//! allocation labels to a list file, then appends one CSV row per live
//! store to `allocation-block-stores.csv.gz`.

use std::path::PathBuf;

use gmetrics_runtime::{context, METRICS_STORE_NAME};

use crate::metrics_file::MetricsFile;

pub struct AllocationSnapshotHandler {
    log_dir: PathBuf,
    metrics_file: Option<MetricsFile>,
}

impl AllocationSnapshotHandler {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self { log_dir: log_dir.into(), metrics_file: None }
    }

    /// Runs one snapshot pass: the metrics store's label dump, then one
    /// CSV record summarizing every live store.
    pub fn tick(&mut self) {
        self.write_metrics_store_allocation_list();

        if self.metrics_file.is_none() {
            let path = self.log_dir.join("allocation-block-stores.csv.gz");
            self.metrics_file =
                MetricsFile::create(&path, &["name", "allocations", "bytes", "creation_stack_trace"]).ok();
        }
        let Some(file) = self.metrics_file.as_mut() else { return };

        // Summaries are collected under both locks, then the locks are
        // released before any gzip write runs — a row never serializes
        // every other allocation in the process behind `allocations`.
        let summaries = context().store_summaries();

        file.start_record();
        for summary in summaries {
            let row = [
                summary.name,
                summary.number_of_allocations.to_string(),
                summary.total_bytes_allocated.to_string(),
                csv_quote(&summary.creation_stack_trace.unwrap_or_default()),
            ];
            let _ = file.add_row(&row);
        }
        let _ = file.end_record(context().flush_requested());
    }

    fn write_metrics_store_allocation_list(&self) {
        let Some(labels) = context().allocation_labels(METRICS_STORE_NAME) else { return };
        let path = self.log_dir.join(format!("{METRICS_STORE_NAME}-allocations.list"));
        let _ = std::fs::write(path, labels.join("\n"));
    }
}

fn csv_quote(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_quote_escapes_only_when_needed() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn tick_writes_a_csv_file_into_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = AllocationSnapshotHandler::new(dir.path());
        handler.tick();
        assert!(dir.path().join("allocation-block-stores.csv.gz").exists());
    }

    #[test]
    fn tick_writes_only_the_metrics_store_allocation_list() {
        let ptr = context().malloc(64);
        assert!(!ptr.is_null());

        let dir = tempfile::tempdir().unwrap();
        let mut handler = AllocationSnapshotHandler::new(dir.path());
        handler.tick();

        assert!(dir.path().join(format!("{METRICS_STORE_NAME}-allocations.list")).exists());
        let mut thread_default_lists = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.ends_with("-allocations.list") && !name.starts_with(METRICS_STORE_NAME)
            });
        assert!(thread_default_lists.next().is_none());

        context().free(ptr);
    }
}
