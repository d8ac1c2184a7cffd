//! Relays allowed queries to the upstream resolver.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;

/// Largest classic (non-EDNS) UDP DNS message.
pub const MAX_RESPONSE_LEN: usize = 512;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream socket error: {0}")]
    Io(#[from] io::Error),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("host refused to protect the upstream socket")]
    ProtectFailed,
    #[error("upstream returned an empty datagram")]
    EmptyResponse,
    #[error("forward abandoned by session shutdown")]
    Cancelled,
}

/// Exempts a socket from being routed back into the tunnel.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

/// For hosts whose routing already keeps upstream traffic off the tunnel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// One query in, one raw response out.
pub trait Upstream: Send + Sync {
    fn forward(&self, query: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, ForwardError>>;
}

/// Fresh protected UDP socket per query, single fixed resolver.
pub struct UdpForwarder {
    resolver: SocketAddr,
    timeout: Duration,
    protector: Arc<dyn SocketProtector>,
}

impl UdpForwarder {
    pub fn new(resolver: SocketAddr, timeout: Duration, protector: Arc<dyn SocketProtector>) -> Self {
        Self {
            resolver,
            timeout,
            protector,
        }
    }

    pub fn resolver(&self) -> SocketAddr {
        self.resolver
    }
}

impl Upstream for UdpForwarder {
    fn forward(&self, query: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, ForwardError>> {
        let resolver = self.resolver;
        let timeout = self.timeout;
        let protector = Arc::clone(&self.protector);
        async move {
            let socket = open_protected_socket(resolver, protector.as_ref())?;
            socket.connect(resolver).await?;
            socket.send(&query).await?;

            let mut buf = [0u8; MAX_RESPONSE_LEN];
            let len = time::timeout(timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| ForwardError::Timeout(timeout))??;
            if len == 0 {
                return Err(ForwardError::EmptyResponse);
            }
            Ok(buf[..len].to_vec())
        }
        .boxed()
    }
}

fn open_protected_socket(
    resolver: SocketAddr,
    protector: &dyn SocketProtector,
) -> Result<UdpSocket, ForwardError> {
    let bind_addr: SocketAddr = match resolver {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = std::net::UdpSocket::bind(bind_addr)?;
    if !protector.protect(socket.as_raw_fd()) {
        return Err(ForwardError::ProtectFailed);
    }
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}
