use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::ProxyError;
use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::ffi::ShieldConfig;
use crate::filter::DEFAULT_MAX_ANCESTOR_DEPTH;
use crate::upstream::DEFAULT_TIMEOUT;

pub const DEFAULT_UPSTREAM: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53);
pub const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(10, 111, 222, 2);
pub const DEFAULT_CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 111, 222, 1);
pub const DEFAULT_CLIENT_PREFIX: u8 = 24;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_READ_POLL_TIMEOUT: Duration = Duration::from_millis(2000);

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 65_535;

/// Settings for one proxy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub upstream: SocketAddr,
    /// Source address stamped on every response written to the tunnel.
    pub dns_server: Ipv4Addr,
    /// Address the host assigned to the tunnel interface. Informational.
    pub client_addr: Ipv4Addr,
    pub client_prefix: u8,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub dns_timeout: Duration,
    pub max_ancestor_depth: usize,
    pub max_in_flight: usize,
    /// Read buffer size for tunnel packets.
    pub mtu: usize,
    pub read_poll_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: SocketAddr::V4(DEFAULT_UPSTREAM),
            dns_server: DEFAULT_DNS_SERVER,
            client_addr: DEFAULT_CLIENT_ADDR,
            client_prefix: DEFAULT_CLIENT_PREFIX,
            cache_capacity: DEFAULT_CAPACITY,
            cache_ttl: DEFAULT_TTL,
            dns_timeout: DEFAULT_TIMEOUT,
            max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            mtu: DEFAULT_MTU,
            read_poll_timeout: DEFAULT_READ_POLL_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.cache_capacity == 0 {
            return Err(ProxyError::InvalidConfig("cache capacity must be non-zero"));
        }
        if self.cache_ttl.is_zero() {
            return Err(ProxyError::InvalidConfig("cache ttl must be non-zero"));
        }
        if self.dns_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig("dns timeout must be non-zero"));
        }
        if self.read_poll_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig("read poll timeout must be non-zero"));
        }
        if self.max_ancestor_depth == 0 {
            return Err(ProxyError::InvalidConfig("ancestor depth must be non-zero"));
        }
        if self.max_in_flight == 0 {
            return Err(ProxyError::InvalidConfig("max in-flight forwards must be non-zero"));
        }
        if self.client_prefix > 32 {
            return Err(ProxyError::InvalidConfig("client prefix must be at most 32"));
        }
        if self.upstream.port() == 0 {
            return Err(ProxyError::InvalidConfig("upstream port must be non-zero"));
        }
        if self.dns_server.is_unspecified() {
            return Err(ProxyError::InvalidConfig("dns server address must be set"));
        }
        Ok(())
    }

    /// Read buffer length, clamped to something a tunnel can deliver.
    pub fn read_buffer_len(&self) -> usize {
        self.mtu.clamp(MIN_MTU, MAX_MTU)
    }
}

impl From<ShieldConfig> for ProxyConfig {
    fn from(raw: ShieldConfig) -> Self {
        let defaults = ProxyConfig::default();
        let upstream_ip = Ipv4Addr::from(raw.upstream_addr);
        let upstream = if upstream_ip.is_unspecified() {
            defaults.upstream
        } else {
            SocketAddr::V4(SocketAddrV4::new(upstream_ip, raw.upstream_port))
        };
        Self {
            upstream,
            dns_server: Ipv4Addr::from(raw.dns_server),
            client_addr: Ipv4Addr::from(raw.client_addr),
            client_prefix: raw.client_prefix,
            cache_capacity: raw.cache_capacity as usize,
            cache_ttl: Duration::from_millis(u64::from(raw.cache_ttl_ms)),
            dns_timeout: Duration::from_millis(u64::from(raw.dns_timeout_ms)),
            max_ancestor_depth: raw.max_ancestor_depth as usize,
            max_in_flight: raw.max_in_flight as usize,
            mtu: raw.mtu as usize,
            read_poll_timeout: Duration::from_millis(u64::from(raw.read_poll_timeout_ms)),
        }
    }
}
