use crate::ffi::ShieldLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Option<&ShieldLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    LOGGER.install_sink(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const TUNNEL   = 0b0000_0001;
        const DNS      = 0b0000_0010;
        const CACHE    = 0b0000_0100;
        const FILTER   = 0b0000_1000;
        const UPSTREAM = 0b0001_0000;
        const FFI      = 0b0010_0000;
        const SESSION  = 0b0100_0000;
        const ALL      = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone, Copy)]
struct LogSinkInner {
    callback: LogCallback,
    context: *mut c_void,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

// The host guarantees the sink context outlives the installed sink.
unsafe impl Send for LogSinkInner {}
unsafe impl Sync for LogSinkInner {}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[shield-p{pid}]"),
        }
    }

    fn install_sink(
        &self,
        sink: Option<&ShieldLogSink>,
        level: Option<&str>,
    ) -> Result<(), &'static str> {
        let mut guard = self.sink.lock();
        match sink {
            Some(sink) => {
                let Some(callback) = sink.log else {
                    return Err("log callback missing");
                };
                *guard = Some(LogSinkInner {
                    callback,
                    context: sink.context,
                    breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
                    min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
                });
            }
            None => *guard = None,
        }
        Ok(())
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let sink = *self.sink.lock();
        let Some(inner) = sink else { return };
        if breadcrumbs.is_empty() {
            if level > inner.min_level {
                return;
            }
        } else if !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };

        let Ok(level_c) = CString::new(level.as_str()) else {
            return;
        };
        let Ok(msg_c) = CString::new(formatted) else {
            return;
        };
        unsafe {
            (inner.callback)(
                level_c.as_ptr(),
                msg_c.as_ptr(),
                breadcrumbs.bits(),
                inner.context,
            );
        }
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::TUNNEL) {
        "TUNNEL"
    } else if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else if flags.contains(BreadcrumbFlags::CACHE) {
        "CACHE"
    } else if flags.contains(BreadcrumbFlags::FILTER) {
        "FILTER"
    } else if flags.contains(BreadcrumbFlags::UPSTREAM) {
        "UPSTREAM"
    } else if flags.contains(BreadcrumbFlags::FFI) {
        "FFI"
    } else if flags.contains(BreadcrumbFlags::SESSION) {
        "SESSION"
    } else {
        "LOG"
    }
}

// ============================================================================
// Rate-Limited Warnings
// ============================================================================
// Hot paths (upstream timeouts, tunnel writes) can fail once per packet. Each
// category keeps its own window so one noisy failure cannot hide another.

/// Minimum interval between logs of the same category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

const CATEGORY_COUNT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Upstream resolver timed out or the socket failed.
    UpstreamFailure,
    /// Writing a response back into the tunnel failed.
    TunnelWrite,
    /// Reading from the tunnel failed with something other than an interrupt.
    TunnelRead,
    /// A bounded queue or task group was full and work was shed.
    Saturated,
    /// Host callback reported failure.
    CallbackError,
}

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::UpstreamFailure => 0,
            Self::TunnelWrite => 1,
            Self::TunnelRead => 2,
            Self::Saturated => 3,
            Self::CallbackError => 4,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::UpstreamFailure => "UPSTREAM_FAILURE",
            Self::TunnelWrite => "TUNNEL_WRITE",
            Self::TunnelRead => "TUNNEL_READ",
            Self::Saturated => "SATURATED",
            Self::CallbackError => "CALLBACK_ERROR",
        }
    }
}

struct RateLimitedLogger {
    /// Last emit time (unix millis) per category.
    last_log_times: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            last_log_times: [ZERO; CATEGORY_COUNT],
        }
    }

    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let slot = &self.last_log_times[category.index()];
        let last = slot.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }
        // Losing the CAS means another thread just logged this category.
        if slot
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        warn(format!("[{}] {}", category.label(), message));
        true
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Emit a warning unless the same category already logged within the last second.
/// Returns true if the line was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}
