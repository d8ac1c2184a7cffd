use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};

use super::tunnel::TunnelWriter;
use crate::cache::{CacheEntry, ResponseCache};
use crate::dns;
use crate::filter::{Decision, FilterEngine};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::stats::ProxyStats;
use crate::telemetry::{BlockSource, BlockedEvent, Telemetry};
use crate::upstream::{ForwardError, Upstream};
use crate::wire::{self, ParsedQuery};

/// Per-session query pipeline. The fast paths (cache hit, block) run inline on
/// the reader thread; allowed queries are handed to the runtime.
pub struct QueryHandler {
    pub(super) dns_server: Ipv4Addr,
    pub(super) cache: Arc<ResponseCache>,
    pub(super) filter: FilterEngine,
    pub(super) upstream: Arc<dyn Upstream>,
    pub(super) writer: TunnelWriter,
    pub(super) stats: Arc<ProxyStats>,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) forwards: Arc<Semaphore>,
    pub(super) shutdown: watch::Receiver<bool>,
    pub(super) runtime: Handle,
}

/// Where a response goes once the upstream answers.
struct ReplyTarget {
    dns_server: Ipv4Addr,
    client_addr: Ipv4Addr,
    client_port: u16,
    transaction_id: u16,
    domain: String,
}

impl ReplyTarget {
    fn of(dns_server: Ipv4Addr, query: &ParsedQuery<'_>) -> Self {
        Self {
            dns_server,
            client_addr: query.client_addr,
            client_port: query.client_port,
            transaction_id: query.transaction_id,
            domain: query.domain.clone(),
        }
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        wire::build_udp_response(self.dns_server, self.client_addr, self.client_port, payload)
    }
}

impl QueryHandler {
    pub fn handle_packet(&self, packet: &[u8]) {
        let query = match wire::parse_query(packet) {
            Ok(query) => query,
            Err(err) => {
                self.stats.record_dropped();
                if !err.is_irrelevant() {
                    logger::breadcrumb(
                        BreadcrumbFlags::TUNNEL,
                        format!("dropped {} byte packet: {}", packet.len(), err.description()),
                    );
                }
                return;
            }
        };
        self.stats.record_query();
        if query.server_addr != self.dns_server {
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!(
                    "query for {} sent to {}, answering as {}",
                    query.domain, query.server_addr, self.dns_server
                ),
            );
        }

        if let Some(entry) = self.cache.get(&query.domain) {
            self.answer_from_cache(&query, entry);
            return;
        }

        match self.filter.decide(&query.domain) {
            Decision::Block(reason) => {
                let Some(response) = dns::synthesize_blocked(query.message) else {
                    self.stats.record_dropped();
                    return;
                };
                self.stats.record_blocked();
                logger::breadcrumb(
                    BreadcrumbFlags::FILTER,
                    format!("blocked {} ({})", query.domain, reason.as_str()),
                );
                self.telemetry
                    .record(BlockedEvent::new(query.domain.as_str(), BlockSource::Filter(reason)));
                self.cache
                    .put(CacheEntry::new(query.domain.as_str(), response.clone(), true));
                self.emit(ReplyTarget::of(self.dns_server, &query).frame(&response));
            }
            Decision::Allow => self.forward(&query),
        }
    }

    fn answer_from_cache(&self, query: &ParsedQuery<'_>, entry: CacheEntry) {
        self.stats.record_cache_hit();
        if entry.blocked {
            self.stats.record_blocked();
            self.telemetry
                .record(BlockedEvent::new(query.domain.as_str(), BlockSource::Cached));
        }
        logger::breadcrumb(
            BreadcrumbFlags::CACHE,
            format!("cache hit for {} (blocked={})", query.domain, entry.blocked),
        );
        let payload = dns::with_transaction_id(&entry.response, query.transaction_id);
        self.emit(ReplyTarget::of(self.dns_server, query).frame(&payload));
    }

    fn forward(&self, query: &ParsedQuery<'_>) {
        let Ok(permit) = Arc::clone(&self.forwards).try_acquire_owned() else {
            self.stats.record_saturated();
            logger::rate_limited_error(
                ErrorCategory::Saturated,
                format!("too many forwards in flight, dropping query for {}", query.domain),
            );
            return;
        };

        let target = ReplyTarget::of(self.dns_server, query);
        let request = self.upstream.forward(query.message.to_vec());
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let writer = self.writer.clone();
        let mut shutdown = self.shutdown.clone();

        self.runtime.spawn(async move {
            let _permit = permit;
            let outcome = tokio::select! {
                result = request => result,
                _ = shutdown.wait_for(|stopping| *stopping) => Err(ForwardError::Cancelled),
            };
            match outcome {
                Ok(response) => {
                    stats.record_forwarded();
                    if let Some(summary) = dns::summarize_response(&response) {
                        logger::breadcrumb(
                            BreadcrumbFlags::UPSTREAM,
                            format!(
                                "{} answered (rcode={}, answers={})",
                                target.domain, summary.rcode, summary.answers
                            ),
                        );
                    }
                    cache.put(CacheEntry::new(target.domain.as_str(), response.clone(), false));
                    let payload = dns::with_transaction_id(&response, target.transaction_id);
                    writer.send(target.frame(&payload));
                }
                Err(ForwardError::Cancelled) => {
                    logger::breadcrumb(
                        BreadcrumbFlags::UPSTREAM,
                        format!("forward for {} abandoned on shutdown", target.domain),
                    );
                }
                Err(err) => {
                    stats.record_upstream_failure();
                    logger::rate_limited_error(
                        ErrorCategory::UpstreamFailure,
                        format!("forward for {} failed: {err}", target.domain),
                    );
                }
            }
        });
    }

    fn emit(&self, packet: Vec<u8>) {
        self.writer.send(packet);
    }
}
