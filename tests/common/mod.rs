//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `htrie=debug,htrie::trie=trace`)
//! - `HTRIE_LOG_DIR`: Log directory (default: `logs/`)
//! - `HTRIE_LOG_CONSOLE`: Set to "0" to disable console output

#![allow(dead_code)]

use std::env;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
/// Logs are written to `logs/htrie.ndjson` as one JSON object per line.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Configuration for tracing setup.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Log file name.
    pub log_file: String,
    /// Enable console output.
    pub console_enabled: bool,
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "htrie.ndjson".to_string(),
            console_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("HTRIE_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if env::var("HTRIE_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            config.console_enabled = false;
        }

        config
    }
}

/// Create an EnvFilter from RUST_LOG or use default level.
fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

/// Thread-safe line writer for the JSON file layer.
struct LineWriter {
    file: Mutex<File>,
}

impl Write for &LineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().unwrap();
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

fn setup_tracing() {
    let config = TracingConfig::from_env();

    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");
    let log_path = config.log_dir.join(&config.log_file);

    // Leaked to get the 'static lifetime the writer closure needs.
    let file_writer: &'static LineWriter = Box::leak(Box::new(LineWriter {
        file: Mutex::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(log_path)
                .expect("Failed to create log file"),
        ),
    }));

    let console_layer = if config.console_enabled {
        Some(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(true)
                .with_ansi(true)
                .compact()
                .with_filter(make_filter(config.default_level)),
        )
    } else {
        None
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(move || file_writer)
        .with_thread_ids(true)
        .with_target(true)
        .json()
        .with_filter(make_filter(config.default_level));

    // try_init: don't panic if something already installed a subscriber.
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Mix the low bits of a counter into a hash-shaped key.
///
/// The trie expects key entropy in the low-order bits; tests that want
/// realistic key distributions run their counters through this.
pub fn mix_key(i: u64) -> u64 {
    // splitmix64 finalizer
    let mut z = i.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
