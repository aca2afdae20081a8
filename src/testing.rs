//! In-process stand-in for raw sockets: echo requests come back as replies.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::icmp::{EchoPacket, Family, RawSocket, Received, SocketOpener};

type Message = (Vec<u8>, IpAddr);

#[derive(Default)]
struct Shared {
    opened: AtomicUsize,
    closed: AtomicUsize,
    attempts: AtomicUsize,
    enobufs: AtomicUsize,
    fail_open: AtomicBool,
    fail_sends: AtomicBool,
    silent: Mutex<HashSet<IpAddr>>,
    inboxes: Mutex<HashMap<Family, mpsc::UnboundedSender<Message>>>,
}

#[derive(Default)]
pub(crate) struct LoopbackSockets {
    shared: Arc<Shared>,
}

impl LoopbackSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Sockets currently open.
    pub fn open_count(&self) -> usize {
        self.opened() - self.closed()
    }

    pub fn send_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` writes with ENOBUFS.
    pub fn fail_sends_with_enobufs(&self, count: usize) {
        self.shared.enobufs.store(count, Ordering::SeqCst);
    }

    /// Fail every write with a non-retryable error.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Never answer requests sent to `addr`.
    pub fn silence(&self, addr: IpAddr) {
        self.shared.silent.lock().insert(addr);
    }

    /// Deliver arbitrary bytes to the open socket of `family`.
    pub fn inject(&self, family: Family, bytes: Vec<u8>, source: IpAddr) {
        if let Some(inbox) = self.shared.inboxes.lock().get(&family) {
            let _ = inbox.send((bytes, source));
        }
    }
}

impl SocketOpener for LoopbackSockets {
    fn open(&self, family: Family) -> io::Result<Arc<dyn RawSocket>> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "raw sockets not permitted",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.inboxes.lock().insert(family, tx.clone());
        self.shared.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(LoopbackSocket {
            family,
            shared: self.shared.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct LoopbackSocket {
    family: Family,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RawSocket for LoopbackSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<Received> {
        let (bytes, source) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        // Keeps the receive stamp strictly after the send stamp
        tokio::time::sleep(Duration::from_millis(1)).await;

        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(Received {
            len,
            source,
            // Replies are addressed to this host
            destination: Some(match self.family {
                Family::V4 => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                Family::V6 => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            }),
            ttl: Some(64),
        })
    }

    async fn send_to(&self, buf: &[u8], destination: IpAddr) -> io::Result<usize> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let pending = self.shared.enobufs.load(Ordering::SeqCst);
        if pending > 0 {
            self.shared.enobufs.store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "network unreachable"));
        }

        if !self.shared.silent.lock().contains(&destination) {
            let request = EchoPacket::from_bytes(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let reply = request.into_reply(self.family).to_bytes();
            let _ = self.tx.send((reply, destination));
        }
        Ok(buf.len())
    }
}
