//! Optional event logging for the engine's hot paths.
//!
//! The trie never logs by default: descent, slot acquisition and the burst
//! CAS loops sit on paths where even a disabled logger call is unwelcome.
//! Everything funnels through [`engine_log!`], which forwards to `tracing`
//! only when the `tracing` cargo feature is enabled and expands to nothing
//! otherwise, so release builds carry zero instrumentation cost.
//!
//! Sites worth watching live in `trie.rs` and `trie/burst.rs`: fresh-bucket
//! installs and bucket replacements at `trace`, degenerate bursts at
//! `debug`, burst alias fallbacks at `warn`, and key-space exhaustion at
//! `error`. To see them:
//!
//! ```bash
//! # burst activity while the scenario tests run
//! RUST_LOG=htrie::trie=trace cargo test --features tracing bursts
//!
//! # only the alias fallbacks and no-space failures
//! RUST_LOG=htrie=warn cargo test --features tracing
//! ```

/// Emit a `tracing` event at the given level: `engine_log!(level, fields...)`.
///
/// The first token names the level (`trace`, `debug`, `warn`, `error`);
/// the rest is passed to the matching `tracing` macro unchanged, so field
/// shorthand and `name = value` pairs both work:
///
/// ```rust,ignore
/// engine_log!(trace, key, bucket = b, "installed fresh bucket");
/// engine_log!(error, key, "collision bucket full at max depth");
/// ```
#[cfg(feature = "tracing")]
macro_rules! engine_log {
    (trace, $($arg:tt)*) => { tracing::trace!($($arg)*) };
    (debug, $($arg:tt)*) => { tracing::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { tracing::warn!($($arg)*) };
    (error, $($arg:tt)*) => { tracing::error!($($arg)*) };
}

/// Without the `tracing` feature every event site compiles away.
#[cfg(not(feature = "tracing"))]
macro_rules! engine_log {
    ($($arg:tt)*) => {};
}

pub(crate) use engine_log;
