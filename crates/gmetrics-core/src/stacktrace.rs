//! Captured call stacks, used to record where a block store (or a
//! dedicated-store-worthy allocation) was created.
//!
//! Capture is cheap: only return addresses are collected. Symbol
//! resolution is deferred until [`StackTrace::output`] is first called,
//! since resolving every frame's symbol is the expensive part and most
//! captured traces are never printed.

use std::sync::{Mutex, OnceLock};

use backtrace::Backtrace;

pub struct StackTrace {
    raw: Mutex<Backtrace>,
    start_frame: usize,
    end_frame: usize,
    delimiter: String,
    output: OnceLock<String>,
}

impl StackTrace {
    /// Captures the current call stack, keeping frames `[start_frame,
    /// start_frame + frame_count)` for later formatting.
    pub fn capture(start_frame: usize, frame_count: usize, delimiter: &str) -> Self {
        Self {
            raw: Mutex::new(Backtrace::new_unresolved()),
            start_frame,
            end_frame: start_frame + frame_count,
            delimiter: delimiter.to_string(),
            output: OnceLock::new(),
        }
    }

    /// Formats the captured frames, joined by the configured delimiter.
    /// Resolves symbols on first call and caches the result.
    pub fn output(&self) -> &str {
        self.output.get_or_init(|| {
            let mut backtrace = self.raw.lock().expect("stack trace mutex poisoned");
            backtrace.resolve();
            backtrace
                .frames()
                .iter()
                .enumerate()
                .skip(self.start_frame)
                .take(self.end_frame.saturating_sub(self.start_frame))
                .flat_map(|(_, frame)| frame.symbols())
                .map(|symbol| {
                    symbol
                        .name()
                        .map(|name| name.to_string())
                        .unwrap_or_else(|| "<unknown>".to_string())
                })
                .collect::<Vec<_>>()
                .join(&self.delimiter)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_cached_after_first_call() {
        let trace = StackTrace::capture(0, 16, " <- ");
        let first = trace.output().to_string();
        let second = trace.output().to_string();
        assert_eq!(first, second);
    }
}
