use super::*;
use crate::dns;
use crate::filter::rules::RuleAction;
use crate::filter::{FilterSnapshot, SharedBlocklist, DEFAULT_KEYWORDS};
use crate::test_support::{
    dns_answer, dns_query, query_packet, udp_packet, CLIENT, CLIENT_PORT, SERVER,
};
use crate::upstream::ForwardError;
use crate::wire::checksum;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::net::Ipv4Addr;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};

const UPSTREAM_ADDR: [u8; 4] = [93, 184, 216, 34];

struct MockUpstream {
    calls: AtomicUsize,
    delay: Option<Duration>,
    failing: AtomicBool,
}

impl MockUpstream {
    fn new(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every later forward time out.
    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl Upstream for MockUpstream {
    fn forward(&self, query: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, ForwardError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = dns::transaction_id(&query).unwrap_or_default();
        let name = dns::read_question(&query)
            .map(|q| q.name)
            .unwrap_or_default();
        let delay = self.delay;
        let failing = self.failing.load(Ordering::SeqCst);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if failing {
                return Err(ForwardError::Timeout(Duration::from_millis(2000)));
            }
            Ok(dns_answer(id, &name, UPSTREAM_ADDR))
        }
        .boxed()
    }
}

struct Harness {
    session: Option<ProxySession>,
    peer: UnixDatagram,
    upstream: Arc<MockUpstream>,
    blocklist: Arc<SharedBlocklist>,
    rules: Arc<RuleSet>,
    deps: SessionDeps,
    _runtime: Runtime,
}

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime")
}

fn harness_with(domains: &[&str], delay: Option<Duration>, config: ProxyConfig) -> Harness {
    let runtime = runtime();
    let keywords: Vec<String> = DEFAULT_KEYWORDS.iter().map(|kw| kw.to_string()).collect();
    let blocklist = Arc::new(SharedBlocklist::new(FilterSnapshot::new(
        domains.iter().copied(),
        false,
        &keywords,
    )));
    let rules = Arc::new(RuleSet::new());
    let upstream = MockUpstream::new(delay);
    let deps = SessionDeps {
        upstream: upstream.clone(),
        provider: blocklist.clone(),
        rules: Arc::clone(&rules),
        stats: Arc::new(ProxyStats::new()),
        telemetry: Arc::new(Telemetry::new()),
        state: Arc::new(StateCell::default()),
        runtime: runtime.handle().clone(),
    };
    let (tunnel_side, peer) = UnixDatagram::pair().expect("socket pair");
    peer.set_read_timeout(Some(Duration::from_secs(3)))
        .expect("read timeout");
    let session =
        ProxySession::start(OwnedFd::from(tunnel_side), config, deps.clone()).expect("start");
    Harness {
        session: Some(session),
        peer,
        upstream,
        blocklist,
        rules,
        deps,
        _runtime: runtime,
    }
}

fn harness(domains: &[&str]) -> Harness {
    harness_with(domains, None, ProxyConfig::default())
}

impl Harness {
    fn send(&self, packet: &[u8]) {
        self.peer.send(packet).expect("send to tunnel");
    }

    fn recv(&self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let n = self.peer.recv(&mut buf).expect("response from tunnel");
        buf[..n].to_vec()
    }

    fn session(&self) -> &ProxySession {
        self.session.as_ref().expect("session running")
    }

    fn stats(&self) -> crate::ffi::ShieldStats {
        self.deps.stats.snapshot()
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Checks framing and returns the DNS payload.
fn dns_payload(packet: &[u8]) -> &[u8] {
    assert_eq!(packet[0], 0x45);
    assert_eq!(packet[9], 17);
    assert_eq!(usize::from(u16::from_be_bytes([packet[2], packet[3]])), packet.len());
    assert!(checksum::verify_ipv4_header(&packet[..20]));
    assert_eq!(&packet[12..16], &SERVER.octets());
    assert_eq!(&packet[16..20], &CLIENT.octets());
    assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 53);
    assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), CLIENT_PORT);
    &packet[28..]
}

fn answer_addr(payload: &[u8]) -> [u8; 4] {
    let tail = &payload[payload.len() - 4..];
    [tail[0], tail[1], tail[2], tail[3]]
}

#[test]
fn blocked_domain_gets_null_answer_and_is_cached() {
    let h = harness(&["xxxsite.com"]);
    h.send(&query_packet(0x1234, "xxxsite.com"));

    let packet = h.recv();
    let payload = dns_payload(&packet);
    assert_eq!(dns::transaction_id(payload), Some(0x1234));
    assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 1);
    assert_eq!(answer_addr(payload), [0, 0, 0, 0]);

    let entry = h.session().cache.get("xxxsite.com").expect("cached");
    assert!(entry.blocked);
    assert_eq!(h.upstream.calls(), 0);
    let stats = h.stats();
    assert_eq!(stats.queries, 1);
    assert_eq!(stats.blocked, 1);

    let (events, _) = h.deps.telemetry.drain(8);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].domain, "xxxsite.com");
}

#[test]
fn allowed_domain_is_forwarded_once_then_served_from_cache() {
    let h = harness(&[]);
    h.send(&query_packet(1, "bank.com"));
    let first = h.recv();
    let payload = dns_payload(&first);
    assert_eq!(dns::transaction_id(payload), Some(1));
    assert_eq!(answer_addr(payload), UPSTREAM_ADDR);
    assert!(!h.session().cache.get("bank.com").expect("cached").blocked);

    h.send(&query_packet(2, "bank.com"));
    let second = h.recv();
    let payload = dns_payload(&second);
    assert_eq!(dns::transaction_id(payload), Some(2));
    assert_eq!(answer_addr(payload), UPSTREAM_ADDR);

    assert_eq!(h.upstream.calls(), 1);
    let stats = h.stats();
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.blocked, 0);
}

#[test]
fn ancestor_block_respects_depth_limit() {
    let h = harness(&["example.com"]);
    h.send(&query_packet(10, "a.b.example.com"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), [0, 0, 0, 0]);

    h.send(&query_packet(11, "a.b.c.d.e.f.example.com"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), UPSTREAM_ADDR);
    assert_eq!(h.upstream.calls(), 1);
}

#[test]
fn keyword_blocks_without_list_entry() {
    let h = harness(&[]);
    h.send(&query_packet(7, "free-porn-videos.net"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), [0, 0, 0, 0]);
    assert_eq!(h.upstream.calls(), 0);
}

#[test]
fn non_dns_traffic_is_dropped_silently() {
    let h = harness(&["xxxsite.com"]);
    h.send(&udp_packet(CLIENT, CLIENT_PORT, SERVER, 443, b"not dns at all"));
    h.send(&[0x60; 40]);
    h.send(&query_packet(0x4242, "xxxsite.com"));

    let payload_owner = h.recv();
    assert_eq!(dns::transaction_id(dns_payload(&payload_owner)), Some(0x4242));
    let stats = h.stats();
    assert_eq!(stats.dropped_packets, 2);
    assert_eq!(stats.queries, 1);
}

#[test]
fn query_to_another_resolver_is_answered_as_configured_server() {
    let h = harness(&["xxxsite.com"]);
    let elsewhere = Ipv4Addr::new(8, 8, 8, 8);
    h.send(&udp_packet(CLIENT, CLIENT_PORT, elsewhere, 53, &dns_query(0x0808, "xxxsite.com")));

    let packet = h.recv();
    let payload = dns_payload(&packet);
    assert_eq!(dns::transaction_id(payload), Some(0x0808));
    assert_eq!(answer_addr(payload), [0, 0, 0, 0]);
    assert_eq!(h.stats().queries, 1);
}

#[test]
fn republished_blocklist_applies_to_next_query() {
    let h = harness(&[]);
    h.send(&query_packet(1, "tracker.io"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), UPSTREAM_ADDR);

    h.blocklist.publish_domains(["ads.net"], false);
    h.send(&query_packet(2, "cdn.ads.net"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), [0, 0, 0, 0]);
}

#[test]
fn allow_rule_overrides_blocklist() {
    let h = harness(&["example.com"]);
    h.rules.install_rule("*.example.com", RuleAction::Allow);
    h.send(&query_packet(3, "www.example.com"));
    assert_eq!(answer_addr(dns_payload(&h.recv())), UPSTREAM_ADDR);
}

#[test]
fn upstream_failure_writes_nothing_and_loop_keeps_answering() {
    let h = harness(&["xxxsite.com"]);
    h.upstream.fail();
    h.send(&query_packet(0x0101, "bank.com"));
    assert!(wait_until(|| h.stats().upstream_failures == 1));

    h.peer
        .set_read_timeout(Some(Duration::from_millis(300)))
        .expect("read timeout");
    let mut buf = [0u8; 2048];
    let err = h.peer.recv(&mut buf).expect_err("no reply for a failed forward");
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));
    assert!(h.session().cache.get("bank.com").is_none());

    h.peer
        .set_read_timeout(Some(Duration::from_secs(3)))
        .expect("read timeout");
    h.send(&query_packet(0x0102, "xxxsite.com"));
    let packet = h.recv();
    let payload = dns_payload(&packet);
    assert_eq!(dns::transaction_id(payload), Some(0x0102));
    assert_eq!(answer_addr(payload), [0, 0, 0, 0]);

    let stats = h.stats();
    assert_eq!(stats.upstream_failures, 1);
    assert_eq!(stats.forwarded, 0);
    assert_eq!(stats.queries, 2);
    assert_eq!(h.upstream.calls(), 1);
}

#[test]
fn failed_tunnel_writes_are_counted_and_reading_continues() {
    let h = harness(&["xxxsite.com"]);
    // Writes into a peer that stopped receiving fail with EPIPE.
    h.peer
        .shutdown(std::net::Shutdown::Read)
        .expect("shutdown peer read side");

    h.send(&query_packet(1, "xxxsite.com"));
    assert!(wait_until(|| h.stats().write_failures >= 1));

    h.send(&query_packet(2, "xxxsite.com"));
    assert!(wait_until(|| h.stats().write_failures >= 2));

    let stats = h.stats();
    assert_eq!(stats.queries, 2);
    assert_eq!(stats.blocked, 2);
    assert_eq!(h.session().state(), ProxyState::Running);
}

#[test]
fn stop_clears_cache_and_closes_tunnel() {
    let mut h = harness(&["xxxsite.com"]);
    h.send(&query_packet(5, "xxxsite.com"));
    h.recv();

    let session = h.session.take().expect("session");
    let cache = Arc::clone(&session.cache);
    assert_eq!(cache.len(), 1);
    session.stop();

    assert!(cache.is_empty());
    assert_eq!(h.deps.state.get(), ProxyState::Stopped);
    assert!(h.peer.send(&query_packet(6, "xxxsite.com")).is_err());
}

#[test]
fn stop_does_not_wait_for_slow_upstream() {
    let mut h = harness_with(&[], Some(Duration::from_secs(30)), ProxyConfig::default());
    h.send(&query_packet(9, "slow.example"));
    let deadline = Instant::now() + Duration::from_secs(2);
    while h.upstream.calls() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(h.upstream.calls(), 1);

    let started = Instant::now();
    h.session.take().expect("session").stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.stats().upstream_failures, 0);
}

#[test]
fn second_session_is_rejected_while_running() {
    let h = harness(&[]);
    assert_eq!(h.session().state(), ProxyState::Running);
    let (other, _peer) = UnixDatagram::pair().expect("socket pair");
    let err = ProxySession::start(OwnedFd::from(other), ProxyConfig::default(), h.deps.clone())
        .err()
        .expect("second start must fail");
    assert!(matches!(err, ProxyError::AlreadyRunning));
    assert_eq!(h.deps.state.get(), ProxyState::Running);
}

#[test]
fn invalid_config_leaves_state_stopped() {
    let rt = runtime();
    let deps = SessionDeps {
        upstream: MockUpstream::new(None),
        provider: Arc::new(SharedBlocklist::default()),
        rules: Arc::new(RuleSet::new()),
        stats: Arc::new(ProxyStats::new()),
        telemetry: Arc::new(Telemetry::new()),
        state: Arc::new(StateCell::default()),
        runtime: rt.handle().clone(),
    };
    let (tunnel_side, _peer) = UnixDatagram::pair().expect("socket pair");
    let config = ProxyConfig {
        cache_capacity: 0,
        ..ProxyConfig::default()
    };
    let err = ProxySession::start(OwnedFd::from(tunnel_side), config, deps.clone())
        .err()
        .expect("zero capacity must be rejected");
    assert!(matches!(err, ProxyError::InvalidConfig(_)));
    assert_eq!(deps.state.get(), ProxyState::Stopped);
}

#[test]
fn session_start_leaves_refresh_to_the_owner() {
    let rt = runtime();
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let provider = SharedBlocklist::default().with_refresh_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let deps = SessionDeps {
        upstream: MockUpstream::new(None),
        provider: Arc::new(provider),
        rules: Arc::new(RuleSet::new()),
        stats: Arc::new(ProxyStats::new()),
        telemetry: Arc::new(Telemetry::new()),
        state: Arc::new(StateCell::default()),
        runtime: rt.handle().clone(),
    };
    let (tunnel_side, _peer) = UnixDatagram::pair().expect("socket pair");
    let session =
        ProxySession::start(OwnedFd::from(tunnel_side), ProxyConfig::default(), deps).expect("start");
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    session.stop();
}

#[test]
fn config_validation_rejects_bad_values() {
    assert!(ProxyConfig::default().validate().is_ok());
    let bad_prefix = ProxyConfig {
        client_prefix: 33,
        ..ProxyConfig::default()
    };
    assert!(matches!(bad_prefix.validate(), Err(ProxyError::InvalidConfig(_))));
    let no_timeout = ProxyConfig {
        dns_timeout: Duration::ZERO,
        ..ProxyConfig::default()
    };
    assert!(no_timeout.validate().is_err());
    let no_server = ProxyConfig {
        dns_server: Ipv4Addr::UNSPECIFIED,
        ..ProxyConfig::default()
    };
    assert!(matches!(no_server.validate(), Err(ProxyError::InvalidConfig(_))));
    let tiny_mtu = ProxyConfig {
        mtu: 10,
        ..ProxyConfig::default()
    };
    assert_eq!(tiny_mtu.read_buffer_len(), 576);
    assert_eq!(ProxyConfig::default().dns_server, Ipv4Addr::new(10, 111, 222, 2));
}
