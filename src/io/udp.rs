//! UDP datagram input
//!
//! A receiver thread drains the socket into a bounded channel so bursts are
//! not lost while the demuxer is busy decoding. `read` hands out one datagram
//! at a time and keeps any unconsumed tail for the next call.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, Bytes};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError};

use super::{InputHandler, Whence};
use crate::config::IoConfig;
use crate::error::{AvpipeError, Result};

/// Largest datagram accepted from the socket
const MAX_DATAGRAM: usize = 65_536;

pub struct UdpInput {
    addr: SocketAddr,
    rx: Receiver<Bytes>,
    pending: Bytes,
    read_timeout: Duration,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    datagrams: u64,
}

/// Parse `udp://host:port` (query string ignored).
pub fn parse_udp_url(url: &str) -> Result<SocketAddr> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| AvpipeError::Config(format!("not a udp url: {}", url)))?;
    let hostport = rest.split(['?', '/']).next().unwrap_or(rest);
    let hostport = if hostport.starts_with(':') {
        format!("0.0.0.0{}", hostport)
    } else {
        hostport.to_string()
    };
    hostport
        .to_socket_addrs()
        .map_err(|e| AvpipeError::Config(format!("invalid udp url {}: {}", url, e)))?
        .next()
        .ok_or_else(|| AvpipeError::Config(format!("udp url {} resolved to nothing", url)))
}

impl UdpInput {
    /// Bind the socket described by `url` and start the receiver thread.
    pub fn bind(url: &str, config: &IoConfig) -> Result<Self> {
        let addr = parse_udp_url(url)?;
        let socket = UdpSocket::bind(addr)?;
        Self::from_socket(socket, config)
    }

    /// Start receiving on an already bound socket.
    pub fn from_socket(socket: UdpSocket, config: &IoConfig) -> Result<Self> {
        let addr = socket.local_addr()?;
        socket.set_read_timeout(Some(Duration::from_millis(config.udp_socket_timeout_ms.max(1))))?;

        let (tx, rx) = bounded::<Bytes>(config.udp_queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let poll = Duration::from_millis(config.udp_socket_timeout_ms.max(1));

        let receiver = std::thread::Builder::new()
            .name(format!("udp-recv:{}", addr))
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let mut received: u64 = 0;
                while !thread_stop.load(Ordering::Relaxed) {
                    let n = match socket.recv(&mut buf) {
                        Ok(n) => n,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(%addr, error = %e, "udp receive failed");
                            break;
                        }
                    };
                    if n == 0 {
                        continue;
                    }
                    received += 1;
                    let mut datagram = Bytes::copy_from_slice(&buf[..n]);
                    // Block while the queue is full, but keep honouring stop
                    loop {
                        match tx.send_timeout(datagram, poll) {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(d)) => {
                                if thread_stop.load(Ordering::Relaxed) {
                                    return;
                                }
                                datagram = d;
                            }
                            Err(SendTimeoutError::Disconnected(_)) => return,
                        }
                    }
                }
                tracing::debug!(%addr, received, "udp receiver stopped");
            })?;

        tracing::info!(%addr, "listening for udp input");
        Ok(Self {
            addr,
            rx,
            pending: Bytes::new(),
            read_timeout: Duration::from_millis(config.udp_read_timeout_ms),
            stop,
            receiver: Some(receiver),
            datagrams: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                tracing::warn!(addr = %self.addr, "udp receiver thread panicked");
            }
        }
    }
}

impl InputHandler for UdpInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // an empty datagram is not end of stream; only a closed queue is
        while self.pending.is_empty() {
            self.pending = match self.rx.recv_timeout(self.read_timeout) {
                Ok(datagram) => {
                    self.datagrams += 1;
                    datagram
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!(addr = %self.addr, "udp read timed out");
                    return Err(AvpipeError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            };
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<i64> {
        Err(AvpipeError::io("seek", "udp input is not seekable"))
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown();
        tracing::debug!(addr = %self.addr, datagrams = self.datagrams, "closed udp input");
        Ok(())
    }

    fn size(&self) -> Option<i64> {
        None
    }
}

impl Drop for UdpInput {
    fn drop(&mut self) {
        self.shutdown();
    }
}
