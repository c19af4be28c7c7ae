//! Driver logging (`klog`).
//!
//! Level-filtered logging macros shared by every driver crate in the tree.
//! The crate is deliberately tiny so that interrupt-context code can log
//! without pulling in any subsystem beyond a single atomic load.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Developer diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Mute switch only | Probe banners, status lines |
//! | [`klog_force!`] | Active | No | Pre-abort fault dumps |
//!
//! # Output
//!
//! Nothing is printed until the platform installs a [`LogSink`] with
//! [`set_sink`]. Until then every macro is a cheap no-op, which is also what
//! host-side unit tests see.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Once;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

impl Level {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Sentinel: all filtered output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Mute switch for [`klog_always!`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Set the minimum level for [`klog!`].
#[inline]
pub fn set_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Current minimum level, or `None` when filtered output is disabled.
pub fn level() -> Option<Level> {
    Level::from_u8(LOG_MIN_LEVEL.load(Ordering::Acquire))
}

/// Disable all [`klog!`] output. Does **not** affect [`klog_force!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Mute or unmute [`klog_always!`].
#[inline]
pub fn set_always_enabled(enabled: bool) {
    LOG_ALWAYS_ENABLED.store(enabled, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Sink
// ============================================================================

/// Destination for formatted log lines.
///
/// Implementations must be callable from interrupt context: no blocking,
/// no allocation on the hot path.
pub trait LogSink: Sync {
    /// Write one formatted line (the trailing newline is included).
    fn write_line(&self, args: fmt::Arguments);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Install the output sink. Only the first call takes effect.
///
/// Returns `false` if a sink was already installed.
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink.write_line(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Status output that ignores the level filter but honours the mute switch.
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Unconditional output for diagnostics that must survive any filter,
/// e.g. register dumps right before a fatal abort.
#[macro_export]
macro_rules! klog_force {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only print, fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered logging.
///
/// ```ignore
/// klog!(Warn, "[SMMU] unit {} stuck in reset", id);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    struct CaptureSink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for CaptureSink {
        fn write_line(&self, args: fmt::Arguments) {
            self.lines.lock().unwrap().push(std::format!("{}", args));
        }
    }

    static CAPTURE: CaptureSink = CaptureSink {
        lines: Mutex::new(Vec::new()),
    };

    // Level and sink are process-wide, so every assertion lives in one test.
    #[test]
    fn test_filter_and_sink() {
        assert!(set_sink(&CAPTURE));
        assert!(!set_sink(&CAPTURE));

        set_level(Level::Warn);
        assert_eq!(level(), Some(Level::Warn));
        assert!(enabled(Level::Error));
        assert!(!enabled(Level::Info));

        klog!(Info, "dropped {}", 1);
        klog!(Error, "kept {}", 2);
        klog_force!("forced");

        disable();
        assert_eq!(level(), None);
        klog!(Error, "dropped while disabled");
        klog_force!("still forced");

        set_always_enabled(false);
        klog_always!("muted");
        set_always_enabled(true);
        klog_always!("unmuted");

        let lines = CAPTURE.lines.lock().unwrap();
        assert_eq!(
            lines.as_slice(),
            &["kept 2\n", "forced\n", "still forced\n", "unmuted\n"]
        );
    }
}
