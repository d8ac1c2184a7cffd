use std::ffi::{c_char, c_void};
use std::os::fd::RawFd;

use crate::logger::{self, ErrorCategory};
use crate::proxy::{
    DEFAULT_CLIENT_ADDR, DEFAULT_CLIENT_PREFIX, DEFAULT_DNS_SERVER, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_MTU, DEFAULT_READ_POLL_TIMEOUT, DEFAULT_UPSTREAM,
};
use crate::telemetry::BlockedEvent;
use crate::upstream::SocketProtector;

pub type ProtectSocketFn = unsafe extern "C" fn(fd: i32, context: *mut c_void) -> bool;
pub type RequestRefreshFn = unsafe extern "C" fn(context: *mut c_void);

/// Mirror of the `ShieldConfig` struct defined in `include/shield.h`.
/// Addresses are IPv4 octets in network order.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ShieldConfig {
    /// Upstream resolver. All-zero selects 1.1.1.1.
    pub upstream_addr: [u8; 4],
    pub upstream_port: u16,
    /// Virtual DNS server the tunnel routes queries to.
    pub dns_server: [u8; 4],
    pub client_addr: [u8; 4],
    pub client_prefix: u8,
    pub cache_capacity: u32,
    pub cache_ttl_ms: u32,
    pub dns_timeout_ms: u32,
    pub max_ancestor_depth: u32,
    pub max_in_flight: u32,
    pub mtu: u32,
    pub read_poll_timeout_ms: u32,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            upstream_addr: DEFAULT_UPSTREAM.ip().octets(),
            upstream_port: DEFAULT_UPSTREAM.port(),
            dns_server: DEFAULT_DNS_SERVER.octets(),
            client_addr: DEFAULT_CLIENT_ADDR.octets(),
            client_prefix: DEFAULT_CLIENT_PREFIX,
            cache_capacity: crate::cache::DEFAULT_CAPACITY as u32,
            cache_ttl_ms: crate::cache::DEFAULT_TTL.as_millis() as u32,
            dns_timeout_ms: crate::upstream::DEFAULT_TIMEOUT.as_millis() as u32,
            max_ancestor_depth: crate::filter::DEFAULT_MAX_ANCESTOR_DEPTH as u32,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT as u32,
            mtu: DEFAULT_MTU as u32,
            read_poll_timeout_ms: DEFAULT_READ_POLL_TIMEOUT.as_millis() as u32,
        }
    }
}

/// Host hooks. Every field is optional.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShieldCallbacks {
    /// Exempts an upstream socket from the tunnel (Android `VpnService.protect`).
    pub protect_socket: Option<ProtectSocketFn>,
    /// Asks the host to refetch its blocklists; called at session start.
    pub request_blocklist_refresh: Option<RequestRefreshFn>,
    pub context: *mut c_void,
}

unsafe impl Send for ShieldCallbacks {}
unsafe impl Sync for ShieldCallbacks {}

impl Default for ShieldCallbacks {
    fn default() -> Self {
        Self {
            protect_socket: None,
            request_blocklist_refresh: None,
            context: std::ptr::null_mut(),
        }
    }
}

impl ShieldCallbacks {
    pub fn request_refresh(&self) {
        if let Some(refresh) = self.request_blocklist_refresh {
            unsafe { refresh(self.context) };
        }
    }
}

impl SocketProtector for ShieldCallbacks {
    fn protect(&self, fd: RawFd) -> bool {
        let Some(protect) = self.protect_socket else {
            return true;
        };
        let ok = unsafe { protect(fd, self.context) };
        if !ok {
            logger::rate_limited_error(
                ErrorCategory::CallbackError,
                format!("host refused to protect upstream socket fd={fd}"),
            );
        }
        ok
    }
}

#[repr(C)]
pub struct ShieldLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShieldStats {
    pub queries: u64,
    pub blocked: u64,
    pub cache_hits: u64,
    pub forwarded: u64,
    pub upstream_failures: u64,
    /// Packets that were not well-formed IPv4/UDP/53 DNS queries.
    pub dropped_packets: u64,
    /// Allowed queries shed because too many forwards were in flight.
    pub forward_saturated: u64,
    pub write_failures: u64,
    pub cache_entries: u64,
    /// 0 stopped, 1 starting, 2 running, 3 stopping.
    pub state: u32,
}

pub const SHIELD_MAX_DOMAIN: usize = 256;

/// `reason`: 0 exact, 1 ancestor, 2 keyword, 3 host rule, 4 cached.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShieldBlockedEvent {
    pub timestamp_ms: u64,
    pub reason: u8,
    pub domain_len: u16,
    pub domain: [c_char; SHIELD_MAX_DOMAIN],
}

impl Default for ShieldBlockedEvent {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            reason: 0,
            domain_len: 0,
            domain: [0; SHIELD_MAX_DOMAIN],
        }
    }
}

impl From<&BlockedEvent> for ShieldBlockedEvent {
    fn from(event: &BlockedEvent) -> Self {
        let mut out = ShieldBlockedEvent {
            timestamp_ms: event.timestamp_ms,
            reason: event.source.code(),
            ..Default::default()
        };
        let bytes = event.domain.as_bytes();
        let len = bytes.len().min(SHIELD_MAX_DOMAIN - 1);
        for (slot, byte) in out.domain.iter_mut().zip(&bytes[..len]) {
            *slot = *byte as c_char;
        }
        out.domain[len] = 0;
        out.domain_len = len as u16;
        out
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShieldHostRuleConfig {
    pub pattern: *const c_char,
    /// True blocks matching hosts, false always allows them.
    pub block: bool,
}

#[cfg(test)]
mod tests;
