//! Hand-off of received datagrams from the receive loop to route handling.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DispatchPolicy;

/// One ICMP message read off a raw socket.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub source: IpAddr,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub received: SystemTime,
}

/// Consumer of received datagrams.
pub trait PacketSink: Send + Sync + 'static {
    fn deliver(&self, datagram: Datagram);
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Datagram>>>;

enum Mode {
    Inline,
    Spawn,
    Queue {
        tx: mpsc::Sender<Datagram>,
        rx: SharedReceiver,
        elastic: bool,
    },
}

pub(crate) struct Dispatcher {
    mode: Mode,
    sink: Arc<dyn PacketSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    workers: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Set up `policy`, spawning any persistent workers on `tracker`. All of
    /// them exit once `cancel` fires.
    pub fn start(
        policy: DispatchPolicy,
        sink: Arc<dyn PacketSink>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let (mode, initial_workers) = match policy {
            DispatchPolicy::Inline => (Mode::Inline, 0),
            DispatchPolicy::Spawn => (Mode::Spawn, 0),
            // One worker up front so a queue that never fills is still drained
            DispatchPolicy::Elastic { queue } => (queue_mode(queue, true), 1),
            DispatchPolicy::Fixed { workers, queue } => (queue_mode(queue, false), workers.max(1)),
        };

        let dispatcher = Self {
            mode,
            sink,
            cancel,
            tracker,
            workers: Arc::new(AtomicUsize::new(0)),
        };
        for _ in 0..initial_workers {
            dispatcher.spawn_worker();
        }
        log::debug!("dispatcher started: {:?}", policy);
        dispatcher
    }

    /// Number of persistent workers started so far.
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    /// Hand `datagram` to route handling. Returns false once the dispatcher
    /// has been cancelled.
    pub async fn submit(&self, datagram: Datagram) -> bool {
        match &self.mode {
            Mode::Inline => {
                self.sink.deliver(datagram);
                true
            }
            Mode::Spawn => {
                let sink = self.sink.clone();
                self.tracker.spawn(async move { sink.deliver(datagram) });
                true
            }
            Mode::Queue { tx, elastic, .. } => {
                let datagram = if *elastic {
                    match tx.try_send(datagram) {
                        Ok(()) => return true,
                        Err(mpsc::error::TrySendError::Full(datagram)) => {
                            self.spawn_worker();
                            datagram
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return false,
                    }
                } else {
                    datagram
                };

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    sent = tx.send(datagram) => sent.is_ok(),
                }
            }
        }
    }

    fn spawn_worker(&self) {
        let Mode::Queue { rx, .. } = &self.mode else {
            return;
        };
        let id = self.workers.fetch_add(1, Ordering::Relaxed);
        log::trace!("starting dispatch worker {}", id);
        self.tracker
            .spawn(worker(rx.clone(), self.sink.clone(), self.cancel.clone()));
    }
}

fn queue_mode(capacity: usize, elastic: bool) -> Mode {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Mode::Queue {
        tx,
        rx: Arc::new(Mutex::new(rx)),
        elastic,
    }
}

async fn worker(rx: SharedReceiver, sink: Arc<dyn PacketSink>, cancel: CancellationToken) {
    loop {
        let next = {
            let mut queue = tokio::select! {
                _ = cancel.cancelled() => return,
                queue = rx.lock() => queue,
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                datagram = queue.recv() => datagram,
            }
        };

        match next {
            Some(datagram) => sink.deliver(datagram),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        seen: SyncMutex<Vec<u8>>,
        delay: Option<Duration>,
    }

    impl PacketSink for Collect {
        fn deliver(&self, datagram: Datagram) {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.seen.lock().push(datagram.bytes[0]);
        }
    }

    fn datagram(tag: u8) -> Datagram {
        Datagram {
            bytes: vec![tag],
            source: IpAddr::V4(Ipv4Addr::LOCALHOST),
            destination: None,
            ttl: Some(64),
            received: SystemTime::now(),
        }
    }

    async fn run_policy(policy: DispatchPolicy, sink: Arc<Collect>, count: u8) -> usize {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let dispatcher = Dispatcher::start(policy, sink.clone(), cancel.clone(), tracker.clone());

        for tag in 0..count {
            assert!(dispatcher.submit(datagram(tag)).await);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.seen.lock().len() < count as usize && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
        dispatcher.workers()
    }

    #[tokio::test]
    async fn test_inline_preserves_order() {
        let sink = Arc::new(Collect::default());
        run_policy(DispatchPolicy::Inline, sink.clone(), 10).await;
        assert_eq!(*sink.seen.lock(), (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_spawn_delivers_everything() {
        let sink = Arc::new(Collect::default());
        run_policy(DispatchPolicy::Spawn, sink.clone(), 10).await;
        let mut seen = sink.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_fixed_pool_delivers_everything() {
        let sink = Arc::new(Collect::default());
        let policy = DispatchPolicy::Fixed {
            workers: 3,
            queue: 2,
        };
        let workers = run_policy(policy, sink.clone(), 20).await;
        assert_eq!(workers, 3);
        assert_eq!(sink.seen.lock().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_elastic_pool_grows_when_full() {
        let sink = Arc::new(Collect {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let workers = run_policy(DispatchPolicy::Elastic { queue: 1 }, sink.clone(), 20).await;
        assert!(workers > 1);
        assert_eq!(sink.seen.lock().len(), 20);
    }

    #[tokio::test]
    async fn test_cancelled_queue_rejects_submit() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sink = Arc::new(Collect::default());
        let policy = DispatchPolicy::Fixed {
            workers: 1,
            queue: 1,
        };
        let dispatcher = Dispatcher::start(policy, sink, cancel.clone(), tracker.clone());

        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        assert!(!dispatcher.submit(datagram(1)).await);
        assert!(!dispatcher.submit(datagram(2)).await);
    }
}
