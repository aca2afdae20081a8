use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DispatchPolicy;
use crate::dispatch::{Datagram, Dispatcher, PacketSink};
use crate::error::PingError;
use crate::icmp::{self, Family, RawSocket, SocketOpener};

/// Large enough for any ICMP message the kernel can hand us
const RECV_BUFFER_SIZE: usize = 65536;

/// Pause between attempts while the socket's output buffer is full
const BUFFER_FULL_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Clone)]
struct Running {
    socket: Arc<dyn RawSocket>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// The raw socket of one address family and the tasks reading from it.
pub struct Transport {
    family: Family,
    payload_size: usize,
    opener: Arc<dyn SocketOpener>,
    running: Mutex<Option<Running>>,
}

impl Transport {
    pub fn new(family: Family, payload_size: usize, opener: Arc<dyn SocketOpener>) -> Self {
        Self {
            family,
            payload_size,
            opener,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of tasks alive in the current scope.
    pub fn task_count(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.tracker.len())
            .unwrap_or(0)
    }

    /// Open the socket and start the receive loop. Returns false if the
    /// transport was already running.
    pub fn run(&self, policy: DispatchPolicy, sink: Arc<dyn PacketSink>) -> Result<bool, PingError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(false);
        }

        let socket = self.opener.open(self.family).map_err(PingError::Open)?;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Dispatcher::start(policy, sink, cancel.clone(), tracker.clone());
        tracker.spawn(receive_loop(
            self.family,
            socket.clone(),
            dispatcher,
            cancel.clone(),
        ));

        log::debug!("{} transport running", self.family);
        *running = Some(Running {
            socket,
            cancel,
            tracker,
        });
        Ok(true)
    }

    /// Run an auxiliary task inside the current scope, so `stop` joins it.
    pub fn spawn<F, Fut>(&self, task: F) -> Result<(), PingError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(PingError::NotRunning)?;
        running.tracker.spawn(task(running.cancel.clone()));
        Ok(())
    }

    /// Cancel the scope, wait for every task in it to exit, then close the
    /// socket.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        drop(running.socket);
        log::debug!("{} transport stopped", self.family);
    }

    /// Stamp, encode and write one echo request. Returns the send time
    /// carried in its payload.
    pub async fn send(&self, destination: IpAddr, identifier: u16, sequence: u16) -> Result<SystemTime, PingError> {
        let Running { socket, cancel, .. } = self
            .running
            .lock()
            .clone()
            .ok_or(PingError::NotRunning)?;

        loop {
            let sent = SystemTime::now();
            let bytes = icmp::encode(self.family, identifier, sequence, sent, self.payload_size);

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PingError::NotRunning),
                written = socket.send_to(&bytes, destination) => written,
            };

            match written {
                Ok(_) => return Ok(sent),
                Err(e) if is_buffer_full(&e) => {
                    log::trace!("{}: output buffer full, retrying seq={}", destination, sequence);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PingError::NotRunning),
                        _ = tokio::time::sleep(BUFFER_FULL_BACKOFF) => {}
                    }
                }
                Err(e) => return Err(PingError::Send(e)),
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            running.tracker.close();
        }
    }
}

async fn receive_loop(
    family: Family,
    socket: Arc<dyn RawSocket>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buffer) => received,
        };

        let received = match received {
            Ok(received) => received,
            Err(e) => {
                log::debug!("{} receive loop exiting: {}", family, e);
                break;
            }
        };

        let datagram = Datagram {
            bytes: buffer[..received.len].to_vec(),
            source: received.source,
            destination: received.destination,
            ttl: received.ttl,
            received: SystemTime::now(),
        };
        if !dispatcher.submit(datagram).await {
            break;
        }
    }

    log::trace!("{} receive loop done, {} dispatch workers started", family, dispatcher.workers());
}

fn is_buffer_full(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOBUFS)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
