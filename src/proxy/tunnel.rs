//! Raw tunnel descriptor I/O: one reader thread polling the tunnel and a wake
//! pipe, one writer thread draining a bounded queue of framed packets.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::stats::ProxyStats;

/// Packets waiting for the writer thread before new ones are shed.
pub const WRITE_QUEUE_DEPTH: usize = 256;

/// Self-pipe used to interrupt a reader blocked in `poll`.
pub struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe(2) just handed us two fresh descriptors we own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            set_cloexec_nonblocking(fd.as_raw_fd())?;
        }
        Ok(Self { read, write })
    }

    pub fn wake(&self) {
        let byte = 1u8;
        let _ = unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_cloexec_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Fails when `fd` is not an open descriptor.
pub fn check_descriptor(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Packet { hangup: bool },
    Woken,
    Idle,
    Closed,
}

fn wait_readable(tun: RawFd, wake: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: tun,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wake,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(Readiness::Idle);
    }
    if fds[1].revents != 0 {
        return Ok(Readiness::Woken);
    }
    let revents = fds[0].revents;
    let hangup = revents & (libc::POLLHUP | libc::POLLERR) != 0;
    if revents & libc::POLLIN != 0 {
        Ok(Readiness::Packet { hangup })
    } else if hangup || revents & libc::POLLNVAL != 0 {
        Ok(Readiness::Closed)
    } else {
        Ok(Readiness::Idle)
    }
}

fn read_packet(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_packet(fd: RawFd, packet: &[u8]) -> io::Result<()> {
    loop {
        let n = unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n as usize != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short tunnel write ({n} of {} bytes)", packet.len()),
            ));
        }
        return Ok(());
    }
}

/// Runs the blocking read loop on a dedicated thread until `stop` is set, the
/// wake pipe fires, or the tunnel fails.
pub fn spawn_reader<F>(
    tun: Arc<OwnedFd>,
    wake_fd: RawFd,
    buffer_len: usize,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
    mut on_packet: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    thread::Builder::new()
        .name("tunnel-reader".into())
        .spawn(move || {
            let fd = tun.as_raw_fd();
            let mut buf = vec![0u8; buffer_len];
            logger::breadcrumb(BreadcrumbFlags::TUNNEL, format!("read loop started (fd={fd})"));
            while !stop.load(Ordering::Acquire) {
                let hangup = match wait_readable(fd, wake_fd, poll_timeout) {
                    Ok(Readiness::Packet { hangup }) => hangup,
                    Ok(Readiness::Idle) => continue,
                    Ok(Readiness::Woken) => break,
                    Ok(Readiness::Closed) => {
                        if !stop.load(Ordering::Acquire) {
                            logger::error(format!("tunnel fd {fd} closed underneath the read loop"));
                        }
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logger::error(format!("tunnel poll failed: {err}"));
                        break;
                    }
                };
                match read_packet(fd, &mut buf) {
                    Ok(0) if hangup => {
                        logger::error(format!("tunnel fd {fd} reached end of stream"));
                        break;
                    }
                    Ok(0) => continue,
                    Ok(n) => on_packet(&buf[..n]),
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                        ) =>
                    {
                        continue
                    }
                    Err(err) => {
                        logger::rate_limited_error(
                            ErrorCategory::TunnelRead,
                            format!("tunnel read failed: {err}"),
                        );
                        logger::error(format!("read loop exiting after tunnel error: {err}"));
                        break;
                    }
                }
            }
            logger::breadcrumb(BreadcrumbFlags::TUNNEL, "read loop finished");
        })
}

/// Producer side of the tunnel output. Cloned into every task that answers
/// a query; the writer thread is the only one touching the descriptor.
#[derive(Clone)]
pub struct TunnelWriter {
    tx: Sender<Vec<u8>>,
    stats: Arc<ProxyStats>,
}

impl TunnelWriter {
    pub fn new(tx: Sender<Vec<u8>>, stats: Arc<ProxyStats>) -> Self {
        Self { tx, stats }
    }

    /// Queues one complete packet. Returns false when it was shed.
    pub fn send(&self, packet: Vec<u8>) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.record_write_failure();
                logger::rate_limited_error(
                    ErrorCategory::Saturated,
                    format!("tunnel write queue full ({WRITE_QUEUE_DEPTH}), dropping response"),
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                logger::breadcrumb(
                    BreadcrumbFlags::TUNNEL,
                    "response dropped, tunnel writer already stopped",
                );
                false
            }
        }
    }
}

/// Drains `packets` onto the tunnel, one whole packet per write, until `stop`
/// disconnects or every producer is gone.
pub fn spawn_writer(
    tun: Arc<OwnedFd>,
    packets: Receiver<Vec<u8>>,
    stop: Receiver<()>,
    stats: Arc<ProxyStats>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tunnel-writer".into())
        .spawn(move || {
            let fd = tun.as_raw_fd();
            loop {
                crossbeam_channel::select! {
                    recv(packets) -> msg => match msg {
                        Ok(packet) => {
                            if let Err(err) = write_packet(fd, &packet) {
                                stats.record_write_failure();
                                logger::rate_limited_error(
                                    ErrorCategory::TunnelWrite,
                                    format!("tunnel write of {} bytes failed: {err}", packet.len()),
                                );
                            }
                        }
                        Err(_) => break,
                    },
                    recv(stop) -> _ => break,
                }
            }
            logger::breadcrumb(BreadcrumbFlags::TUNNEL, "writer finished");
        })
}
