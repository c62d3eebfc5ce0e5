//! Thin wrapper around the `log` crate that mirrors the macro surface the
//! rest of this codebase is written against (`log!(LogDebug, "...")`).
//!
//! The runtime logs through here rather than `println!` everywhere so that
//! a client embedding this core can redirect diagnostics (e.g. into its own
//! trace file) by installing a different `log::Log` implementation instead
//! of one tied to `env_logger`.

use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

impl LogLevel {
    pub fn as_level(self) -> log::Level {
        match self {
            LogLevel::LogFatal => log::Level::Error,
            LogLevel::LogError => log::Level::Error,
            LogLevel::LogWarn => log::Level::Warn,
            LogLevel::LogInfo => log::Level::Info,
            LogLevel::LogDebug => log::Level::Debug,
        }
    }
}

/// Installs the `env_logger` backend. Idempotent; safe to call from every
/// entry point (CLI, preload ctor, attach handshake).
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .try_init();
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        log::log!($crate::log::LogLevel::as_level($level), $($arg)+)
    };
}

/// A thread/task the assertion is diagnosing. Anything that can name itself
/// (a tid, a fragment start PC, ...) implements this so `ed_assert!` can
/// print "which tracee" without every caller having to format it by hand.
pub trait DiagnosticSubject {
    fn diag_id(&self) -> String;
}

impl DiagnosticSubject for libc::pid_t {
    fn diag_id(&self) -> String {
        format!("tid {}", self)
    }
}

impl<T: DiagnosticSubject + ?Sized> DiagnosticSubject for &T {
    fn diag_id(&self) -> String {
        (*self).diag_id()
    }
}

/// Fatal invariant check. Unlike a recoverable `Result`, failure here means
/// the runtime has observed state it believes is impossible; this must not
/// unwind back through an instrumentation callback, so it logs at Error and
/// aborts the process immediately rather than panicking (a panic could be
/// caught by a `catch_unwind` in a careless client).
#[macro_export]
macro_rules! ed_assert {
    ($subj:expr, $cond:expr) => {
        if !($cond) {
            $crate::log::fatal_abort(&$subj, &format!("assertion failed: {}", stringify!($cond)));
        }
    };
    ($subj:expr, $cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::log::fatal_abort(&$subj, &format!($($arg)+));
        }
    };
}

#[doc(hidden)]
pub fn fatal_abort<S: DiagnosticSubject>(subject: &S, message: &str) -> ! {
    log::error!("[{}] fatal: {}", subject.diag_id(), message);
    let bt = backtrace::Backtrace::new();
    log::error!("{:?}", bt);
    std::process::abort();
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::LogFatal => "FATAL",
            LogLevel::LogError => "ERROR",
            LogLevel::LogWarn => "WARN",
            LogLevel::LogInfo => "INFO",
            LogLevel::LogDebug => "DEBUG",
        };
        f.write_str(s)
    }
}
