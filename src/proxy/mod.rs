//! One run of the DNS proxy over a tunnel descriptor.

mod config;
mod handler;
mod tunnel;

pub use config::{
    ProxyConfig, DEFAULT_CLIENT_ADDR, DEFAULT_CLIENT_PREFIX, DEFAULT_DNS_SERVER,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_MTU, DEFAULT_READ_POLL_TIMEOUT, DEFAULT_UPSTREAM,
};

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};

use self::handler::QueryHandler;
use self::tunnel::{TunnelWriter, WakePipe, WRITE_QUEUE_DEPTH};
use crate::cache::ResponseCache;
use crate::filter::rules::RuleSet;
use crate::filter::{BlocklistProvider, FilterEngine};
use crate::logger::{self, BreadcrumbFlags};
use crate::stats::ProxyStats;
use crate::telemetry::Telemetry;
use crate::upstream::Upstream;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(#[source] io::Error),
    #[error("a proxy session is already active")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to start session workers: {0}")]
    Runtime(#[source] io::Error),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProxyState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Lifecycle state shared between the engine and its current session. Only
/// a `Stopped -> Starting` transition may open a session, so at most one is
/// ever active.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ProxyState::Stopped as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> ProxyState {
        ProxyState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ProxyState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn begin_start(&self) -> bool {
        self.0
            .compare_exchange(
                ProxyState::Stopped as u8,
                ProxyState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Collaborators a session borrows from its engine.
#[derive(Clone)]
pub struct SessionDeps {
    pub upstream: Arc<dyn Upstream>,
    pub provider: Arc<dyn BlocklistProvider>,
    pub rules: Arc<RuleSet>,
    pub stats: Arc<ProxyStats>,
    pub telemetry: Arc<Telemetry>,
    pub state: Arc<StateCell>,
    pub runtime: Handle,
}

pub struct ProxySession {
    state: Arc<StateCell>,
    cache: Arc<ResponseCache>,
    stop_flag: Arc<AtomicBool>,
    wake: WakePipe,
    shutdown: watch::Sender<bool>,
    writer_stop: Option<Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    tun: Option<Arc<OwnedFd>>,
}

impl ProxySession {
    /// Takes ownership of `tun` and starts the read loop. On failure the
    /// descriptor is closed and the state is back to `Stopped`.
    pub fn start(tun: OwnedFd, config: ProxyConfig, deps: SessionDeps) -> Result<Self, ProxyError> {
        if !deps.state.begin_start() {
            return Err(ProxyError::AlreadyRunning);
        }
        match Self::open(tun, config, &deps) {
            Ok(session) => {
                deps.state.set(ProxyState::Running);
                logger::info("dns proxy running");
                Ok(session)
            }
            Err(err) => {
                deps.state.set(ProxyState::Stopped);
                logger::error(format!("dns proxy failed to start: {err}"));
                Err(err)
            }
        }
    }

    fn open(tun: OwnedFd, config: ProxyConfig, deps: &SessionDeps) -> Result<Self, ProxyError> {
        config.validate()?;
        tunnel::check_descriptor(tun.as_raw_fd()).map_err(ProxyError::TunnelUnavailable)?;
        let wake = WakePipe::new().map_err(ProxyError::Runtime)?;

        logger::breadcrumb(
            BreadcrumbFlags::SESSION,
            format!(
                "session starting (fd={}, upstream={}, server={}, client={}/{}, cache={}x{}ms)",
                tun.as_raw_fd(),
                config.upstream,
                config.dns_server,
                config.client_addr,
                config.client_prefix,
                config.cache_capacity,
                config.cache_ttl.as_millis()
            ),
        );

        let tun = Arc::new(tun);
        let cache = Arc::new(ResponseCache::new(config.cache_capacity, config.cache_ttl));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (packet_tx, packet_rx) = crossbeam_channel::bounded(WRITE_QUEUE_DEPTH);
        let (writer_stop, writer_stop_rx) = crossbeam_channel::bounded::<()>(0);

        let writer = tunnel::spawn_writer(
            Arc::clone(&tun),
            packet_rx,
            writer_stop_rx,
            Arc::clone(&deps.stats),
        )
        .map_err(ProxyError::Runtime)?;

        let handler = QueryHandler {
            dns_server: config.dns_server,
            cache: Arc::clone(&cache),
            filter: FilterEngine::new(
                Arc::clone(&deps.provider),
                Arc::clone(&deps.rules),
                config.max_ancestor_depth,
            ),
            upstream: Arc::clone(&deps.upstream),
            writer: TunnelWriter::new(packet_tx, Arc::clone(&deps.stats)),
            stats: Arc::clone(&deps.stats),
            telemetry: Arc::clone(&deps.telemetry),
            forwards: Arc::new(Semaphore::new(config.max_in_flight)),
            shutdown: shutdown_rx,
            runtime: deps.runtime.clone(),
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader = tunnel::spawn_reader(
            Arc::clone(&tun),
            wake.read_fd(),
            config.read_buffer_len(),
            config.read_poll_timeout,
            Arc::clone(&stop_flag),
            move |packet| handler.handle_packet(packet),
        );
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                drop(writer_stop);
                let _ = writer.join();
                return Err(ProxyError::Runtime(err));
            }
        };

        Ok(Self {
            state: Arc::clone(&deps.state),
            cache,
            stop_flag,
            wake,
            shutdown,
            writer_stop: Some(writer_stop),
            reader: Some(reader),
            writer: Some(writer),
            tun: Some(tun),
        })
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Interrupts the read loop, abandons in-flight forwards, closes the
    /// tunnel and flushes the cache.
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(tun) = self.tun.take() else {
            return;
        };
        self.state.set(ProxyState::Stopping);
        logger::breadcrumb(BreadcrumbFlags::SESSION, "session stopping");

        self.stop_flag.store(true, Ordering::Release);
        self.wake.wake();
        let _ = self.shutdown.send(true);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                logger::error("tunnel reader panicked");
            }
        }
        drop(self.writer_stop.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                logger::error("tunnel writer panicked");
            }
        }
        drop(tun);

        self.cache.clear();
        self.state.set(ProxyState::Stopped);
        logger::info("dns proxy stopped");
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests;
