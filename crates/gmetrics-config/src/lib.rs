//! Reads the `G_METRICS_*` environment variables exactly once and caches
//! the result behind an atomic state machine.
//!
//! Resolution touches `std::env::var` and `/proc/self/cmdline`, neither of
//! which is reentrancy-hazardous by itself, but [`config`] is called from
//! the allocator's hot path and may be re-entered on the same thread
//! before the first resolution finishes (for example if something on that
//! path panics into a signal handler that also allocates). A thread that
//! observes resolution already in progress gets a transient disabled
//! config rather than blocking or recursing into `resolve()` itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;

static CACHED_STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CONFIG: OnceLock<GMetricsConfig> = OnceLock::new();
static TRANSIENT_DISABLED: OnceLock<GMetricsConfig> = OnceLock::new();

/// Resolved configuration for this process, read once at first use.
#[derive(Debug, Clone)]
pub struct GMetricsConfig {
    /// Whether `/proc/self/cmdline` matched `G_METRICS_COMMAND`.
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub skip: Vec<String>,
    pub collection_interval: Duration,
    pub stack_trace_size: usize,
    pub max_allocation_block_stores: usize,
    /// Bytes, not KiB — already multiplied out of the environment value.
    pub default_allocation_block_store_size: usize,
    pub dedicated_threshold: usize,
}

impl GMetricsConfig {
    fn disabled_default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("/tmp/metrics"),
            skip: Vec::new(),
            collection_interval: Duration::from_secs(10),
            stack_trace_size: 5,
            max_allocation_block_stores: 8192,
            default_allocation_block_store_size: 10_485_760 * 1024,
            dedicated_threshold: 8192,
        }
    }

    /// Whether `name` is in the skip list, disabling that metric.
    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|skipped| name.contains(skipped.as_str()))
    }
}

/// Returns the process-wide configuration, resolving it on first call.
pub fn config() -> &'static GMetricsConfig {
    match CACHED_STATE.compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            let resolved = resolve();
            let _ = CONFIG.set(resolved);
            CACHED_STATE.store(RESOLVED, Ordering::Release);
            CONFIG.get().expect("config was just set")
        }
        Err(RESOLVING) => TRANSIENT_DISABLED.get_or_init(GMetricsConfig::disabled_default),
        Err(_) => {
            // Either already RESOLVED, or another thread raced us into
            // RESOLVING and finished before we re-checked; spin briefly
            // rather than assume RESOLVED is visible yet.
            loop {
                if let Some(resolved) = CONFIG.get() {
                    return resolved;
                }
                std::hint::spin_loop();
            }
        }
    }
}

fn resolve() -> GMetricsConfig {
    let command = env_string("G_METRICS_COMMAND", "gnome-shell");
    let enabled = process_matches_command(&command);
    let log_dir = PathBuf::from(env_string("G_METRICS_LOG_DIR", &default_log_dir()));
    let skip = env_string("G_METRICS_SKIP", "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let collection_interval = Duration::from_secs(env_int("G_METRICS_COLLECTION_INTERVAL", 10).max(0) as u64);
    let stack_trace_size = env_int("G_METRICS_STACK_TRACE_SIZE", 5).max(0) as usize;
    let max_allocation_block_stores = env_int("G_METRICS_MAX_ALLOCATION_BLOCK_STORES", 8192).max(0) as usize;
    // The environment value is KiB; the 10_485_760 default therefore
    // yields a 10 GiB store. Kept as specified — see DESIGN.md.
    let default_store_kib = env_int("G_METRICS_DEFAULT_ALLOCATION_BLOCK_STORE_SIZE", 10_485_760).max(0);
    let default_allocation_block_store_size = default_store_kib as usize * 1024;
    let dedicated_threshold = env_int("G_METRICS_DEDICATED_ALLOCATION_BLOCK_STORE_THRESHOLD", 8192).max(0) as usize;

    GMetricsConfig {
        enabled,
        log_dir,
        skip,
        collection_interval,
        stack_trace_size,
        max_allocation_block_stores,
        default_allocation_block_store_size,
        dedicated_threshold,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Parses the *value* of `name`, falling back to `default` if unset or
/// unparseable.
fn env_int(name: &str, default: i64) -> i64 {
    std::env::var(name).ok().and_then(|value| value.trim().parse::<i64>().ok()).unwrap_or(default)
}

fn default_log_dir() -> String {
    let cache_home = std::env::var("XDG_CACHE_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.cache")
    });
    format!("{cache_home}/metrics/{}", std::process::id())
}

/// Whether this process's argv0 (the first NUL-delimited token of
/// `/proc/self/cmdline`) ends with `command`.
fn process_matches_command(command: &str) -> bool {
    let Ok(cmdline) = std::fs::read("/proc/self/cmdline") else {
        return false;
    };
    let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or(&[]);
    String::from_utf8_lossy(argv0).ends_with(command)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn env_int_parses_the_value_not_the_variable_name() {
        // SAFETY: tests run single-threaded for env mutation by convention
        // in this crate; no other test touches this variable name.
        unsafe { std::env::set_var("GMETRICS_CONFIG_TEST_INT", "42") };
        assert_eq!(env_int("GMETRICS_CONFIG_TEST_INT", 7), 42);
        unsafe { std::env::remove_var("GMETRICS_CONFIG_TEST_INT") };
    }

    #[test]
    fn env_int_falls_back_to_default_on_garbage() {
        unsafe { std::env::set_var("GMETRICS_CONFIG_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_int("GMETRICS_CONFIG_TEST_GARBAGE", 7), 7);
        unsafe { std::env::remove_var("GMETRICS_CONFIG_TEST_GARBAGE") };
    }

    #[test]
    fn is_skipped_matches_substrings() {
        let mut config = GMetricsConfig::disabled_default();
        config.skip = vec!["heap".to_string()];
        assert!(config.is_skipped("heap-allocations"));
        assert!(!config.is_skipped("timer-ticks"));
    }

    #[test]
    fn default_allocation_block_store_size_is_ten_gib() {
        let config = GMetricsConfig::disabled_default();
        assert_eq!(config.default_allocation_block_store_size, 10 * 1024 * 1024 * 1024);
    }
}
