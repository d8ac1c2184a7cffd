#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod dns;
pub mod ffi;
pub mod filter;
pub mod logger;
pub mod proxy;
pub mod stats;
pub mod telemetry;
pub mod upstream;
pub mod wire;

#[cfg(test)]
mod test_support;

use crate::ffi::{
    ShieldBlockedEvent, ShieldCallbacks, ShieldConfig, ShieldHostRuleConfig, ShieldLogSink,
    ShieldStats,
};
use crate::filter::{BlocklistProvider, RuleAction, RuleSet, SharedBlocklist};
use crate::logger::BreadcrumbFlags;
use crate::proxy::{ProxyConfig, ProxyError, ProxySession, ProxyState, SessionDeps, StateCell};
use crate::stats::ProxyStats;
use crate::telemetry::{BlockedEvent, Telemetry};
use crate::upstream::UdpForwarder;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// Opaque engine handle shared with the host app.
pub struct ShieldEngine {
    runtime: Runtime,
    callbacks: ShieldCallbacks,
    blocklist: Arc<SharedBlocklist>,
    rules: Arc<RuleSet>,
    stats: Arc<ProxyStats>,
    telemetry: Arc<Telemetry>,
    state: Arc<StateCell>,
    session: Mutex<Option<ProxySession>>,
}

impl ShieldEngine {
    pub fn new(callbacks: ShieldCallbacks) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("shield-forward")
            .enable_io()
            .enable_time()
            .build()?;

        let blocklist = SharedBlocklist::default().with_refresh_hook(move || {
            logger::breadcrumb(BreadcrumbFlags::FFI, "requesting blocklist refresh from host");
            callbacks.request_refresh();
        });

        logger::breadcrumb(BreadcrumbFlags::FFI, "ShieldEngine initialized");
        Ok(Self {
            runtime,
            callbacks,
            blocklist: Arc::new(blocklist),
            rules: Arc::new(RuleSet::new()),
            stats: Arc::new(ProxyStats::new()),
            telemetry: Arc::new(Telemetry::new()),
            state: Arc::new(StateCell::default()),
            session: Mutex::new(None),
        })
    }

    /// Starts a session on `tun`. The engine owns the descriptor from here on
    /// and closes it on stop or on failure.
    pub fn start(&self, tun: OwnedFd, config: ProxyConfig) -> Result<(), ProxyError> {
        let mut slot = self.session.lock();
        if slot.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }
        let upstream = UdpForwarder::new(
            config.upstream,
            config.dns_timeout,
            Arc::new(self.callbacks),
        );
        let deps = SessionDeps {
            upstream: Arc::new(upstream),
            provider: self.blocklist.clone(),
            rules: Arc::clone(&self.rules),
            stats: Arc::clone(&self.stats),
            telemetry: Arc::clone(&self.telemetry),
            state: Arc::clone(&self.state),
            runtime: self.runtime.handle().clone(),
        };
        *slot = Some(ProxySession::start(tun, config, deps)?);
        drop(slot);
        // The host may call back into the engine from its refresh hook.
        self.blocklist.request_refresh();
        Ok(())
    }

    pub fn stop(&self) {
        let session = self.session.lock().take();
        match session {
            Some(session) => session.stop(),
            None => logger::breadcrumb(BreadcrumbFlags::SESSION, "stop requested with no session"),
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    pub fn publish_blocklist<I, S>(&self, domains: I, strict: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blocklist.publish_domains(domains, strict);
    }

    pub fn set_keywords(&self, keywords: &[String]) {
        self.blocklist.publish_keywords(keywords);
    }

    pub fn stats(&self) -> ShieldStats {
        let mut stats = self.stats.snapshot();
        stats.cache_entries = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.cache_len() as u64)
            .unwrap_or(0);
        stats.state = self.state() as u32;
        stats
    }

    pub fn drain_blocked(&self, max_events: usize) -> (Vec<BlockedEvent>, u64) {
        self.telemetry.drain(max_events)
    }

    pub fn install_host_rule(&self, pattern: &str, action: RuleAction) -> u64 {
        self.rules.install_rule(pattern, action)
    }

    pub fn remove_host_rule(&self, id: u64) -> bool {
        self.rules.remove_rule(id)
    }
}

impl Drop for ShieldEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}

/// Collects the valid UTF-8 entries of a C string array.
///
/// # Safety
/// `items` must be null or point to `count` pointers, each null or a valid C string.
unsafe fn c_string_list<'a>(items: *const *const c_char, count: usize) -> Vec<&'a str> {
    if items.is_null() || count == 0 {
        return Vec::new();
    }
    let pointers = unsafe { slice::from_raw_parts(items, count) };
    pointers
        .iter()
        .filter(|ptr| !ptr.is_null())
        .filter_map(|ptr| unsafe { CStr::from_ptr(*ptr) }.to_str().ok())
        .collect()
}

#[no_mangle]
pub unsafe extern "C" fn ShieldNewEngine(callbacks: *const ShieldCallbacks) -> *mut ShieldEngine {
    let callbacks = unsafe { callbacks.as_ref() }.copied().unwrap_or_default();
    match ShieldEngine::new(callbacks) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            crate::logger::error(format!("ShieldNewEngine failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ShieldFreeEngine(engine: *mut ShieldEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

/// Starts filtering on `tun_fd`. Unless the engine pointer is null or the
/// descriptor negative, ownership of `tun_fd` passes to the engine even when
/// start fails.
///
/// Returns 0 on success, -1 null engine, -2 invalid descriptor, -3 already
/// running, -4 invalid config, -5 tunnel unavailable, -6 worker startup failed.
#[no_mangle]
pub unsafe extern "C" fn ShieldEngineStart(
    engine: *mut ShieldEngine,
    tun_fd: i32,
    config: *const ShieldConfig,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    if tun_fd < 0 {
        return -2;
    }
    let config = unsafe { config.as_ref() }.copied().unwrap_or_default();
    // Safety: the host hands over an open descriptor it no longer uses.
    let tun = unsafe { OwnedFd::from_raw_fd(tun_fd) };
    match unsafe { engine.as_ref() }.start(tun, ProxyConfig::from(config)) {
        Ok(()) => 0,
        Err(error) => {
            crate::logger::error(format!("ShieldEngineStart error: {error}"));
            match error {
                ProxyError::AlreadyRunning => -3,
                ProxyError::InvalidConfig(_) => -4,
                ProxyError::TunnelUnavailable(_) => -5,
                ProxyError::Runtime(_) => -6,
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ShieldEngineStop(engine: *mut ShieldEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

/// Replaces the blocked-domain set. Entries are trimmed and lowercased; blank
/// and `#` lines are skipped.
#[no_mangle]
pub unsafe extern "C" fn ShieldEnginePublishBlocklist(
    engine: *mut ShieldEngine,
    domains: *const *const c_char,
    count: usize,
    strict: bool,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if domains.is_null() && count > 0 {
        return false;
    }
    let list = unsafe { c_string_list(domains, count) };
    unsafe { engine.as_ref() }.publish_blocklist(list, strict);
    true
}

#[no_mangle]
pub unsafe extern "C" fn ShieldEngineSetKeywords(
    engine: *mut ShieldEngine,
    keywords: *const *const c_char,
    count: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if keywords.is_null() && count > 0 {
        return false;
    }
    let keywords: Vec<String> = unsafe { c_string_list(keywords, count) }
        .into_iter()
        .map(str::to_owned)
        .collect();
    unsafe { engine.as_ref() }.set_keywords(&keywords);
    true
}

#[no_mangle]
pub unsafe extern "C" fn ShieldEngineGetStats(
    engine: *mut ShieldEngine,
    out: *mut ShieldStats,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.stats();
    true
}

#[no_mangle]
pub unsafe extern "C" fn ShieldEngineGetState(engine: *mut ShieldEngine) -> u32 {
    match NonNull::new(engine) {
        Some(engine) => unsafe { engine.as_ref() }.state() as u32,
        None => ProxyState::Stopped as u32,
    }
}

#[no_mangle]
pub unsafe extern "C" fn ShieldSetLogSink(
    sink: *const ShieldLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn ShieldSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub unsafe extern "C" fn ShieldBlockedDrain(
    engine: *mut ShieldEngine,
    out_events: *mut ShieldBlockedEvent,
    max_events: usize,
    dropped_out: *mut u64,
) -> usize {
    let Some(engine) = NonNull::new(engine) else {
        return 0;
    };
    if out_events.is_null() || max_events == 0 {
        return 0;
    }
    let (events, dropped) = unsafe { engine.as_ref() }.drain_blocked(max_events);
    if let Some(ptr) = unsafe { dropped_out.as_mut() } {
        *ptr = dropped;
    }
    let out_slice = unsafe { slice::from_raw_parts_mut(out_events, max_events) };
    for (slot, event) in out_slice.iter_mut().zip(&events) {
        *slot = ShieldBlockedEvent::from(event);
    }
    events.len()
}

#[no_mangle]
pub extern "C" fn ShieldEnsureLinked() -> bool {
    true
}

#[no_mangle]
pub unsafe extern "C" fn ShieldHostRuleAdd(
    engine: *mut ShieldEngine,
    config: *const ShieldHostRuleConfig,
    out_id: *mut u64,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(cfg) = (unsafe { config.as_ref() }) else {
        return false;
    };
    if cfg.pattern.is_null() {
        return false;
    }
    let pattern = match unsafe { CStr::from_ptr(cfg.pattern) }.to_str() {
        Ok(p) if !p.trim().is_empty() => p,
        _ => return false,
    };
    let action = if cfg.block {
        RuleAction::Block
    } else {
        RuleAction::Allow
    };
    let id = unsafe { engine.as_ref() }.install_host_rule(pattern, action);
    if let Some(out) = unsafe { out_id.as_mut() } {
        *out = id;
    }
    true
}

#[no_mangle]
pub unsafe extern "C" fn ShieldHostRuleRemove(engine: *mut ShieldEngine, rule_id: u64) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    unsafe { engine.as_ref() }.remove_host_rule(rule_id)
}
