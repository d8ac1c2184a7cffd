use super::*;
use crate::filter::BlockReason;
use crate::proxy::ProxyConfig;
use crate::telemetry::BlockSource;
use std::ffi::CStr;
use std::sync::atomic::{AtomicI32, Ordering};

#[test]
fn default_config_matches_proxy_defaults() {
    let config = ProxyConfig::from(ShieldConfig::default());
    assert_eq!(config, ProxyConfig::default());
    assert_eq!(config.upstream.to_string(), "1.1.1.1:53");
}

#[test]
fn unspecified_upstream_falls_back_to_default() {
    let raw = ShieldConfig {
        upstream_addr: [0, 0, 0, 0],
        upstream_port: 5353,
        ..ShieldConfig::default()
    };
    assert_eq!(ProxyConfig::from(raw).upstream.to_string(), "1.1.1.1:53");

    let raw = ShieldConfig {
        upstream_addr: [9, 9, 9, 9],
        ..ShieldConfig::default()
    };
    assert_eq!(ProxyConfig::from(raw).upstream.to_string(), "9.9.9.9:53");
}

#[test]
fn unset_dns_server_is_rejected() {
    let raw = ShieldConfig {
        dns_server: [0, 0, 0, 0],
        ..ShieldConfig::default()
    };
    assert!(ProxyConfig::from(raw).validate().is_err());
}

#[test]
fn blocked_event_copies_and_terminates_domain() {
    let event = BlockedEvent::new("ads.example.com", BlockSource::Filter(BlockReason::Ancestor));
    let raw = ShieldBlockedEvent::from(&event);
    assert_eq!(raw.reason, 1);
    assert_eq!(raw.domain_len, 15);
    let text = unsafe { CStr::from_ptr(raw.domain.as_ptr()) };
    assert_eq!(text.to_str().unwrap(), "ads.example.com");
}

#[test]
fn blocked_event_truncates_long_domains() {
    let long = "a".repeat(SHIELD_MAX_DOMAIN + 40);
    let raw = ShieldBlockedEvent::from(&BlockedEvent::new(long, BlockSource::Cached));
    assert_eq!(usize::from(raw.domain_len), SHIELD_MAX_DOMAIN - 1);
    assert_eq!(raw.domain[SHIELD_MAX_DOMAIN - 1], 0);
    assert_eq!(raw.reason, 4);
}

static LAST_PROTECTED: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C" fn refuse_protect(fd: i32, _context: *mut c_void) -> bool {
    LAST_PROTECTED.store(fd, Ordering::SeqCst);
    false
}

#[test]
fn protect_callback_result_is_reported() {
    let callbacks = ShieldCallbacks {
        protect_socket: Some(refuse_protect),
        ..ShieldCallbacks::default()
    };
    assert!(!callbacks.protect(42));
    assert_eq!(LAST_PROTECTED.load(Ordering::SeqCst), 42);
    assert!(ShieldCallbacks::default().protect(7));
}
