//! Outstanding probes of one endpoint, keyed by sequence number.
//!
//! Every probe is resolved exactly once: whichever of reply, timeout or
//! teardown pops the entry first hands it to the handler, the others get
//! `NotFound`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ExhaustionPolicy;
use crate::error::PingError;
use crate::icmp::Probe;

/// Receives every probe sent on a connection once it is resolved.
pub trait ReplyHandler: Send + Sync + 'static {
    fn on_reply(&self, probe: Probe, result: Result<(), PingError>);
}

impl<F> ReplyHandler for F
where
    F: Fn(Probe, Result<(), PingError>) + Send + Sync + 'static,
{
    fn on_reply(&self, probe: Probe, result: Result<(), PingError>) {
        self(probe, result)
    }
}

pub struct SequenceIndex {
    addr: IpAddr,
    identifier: u16,
    timeout: Duration,
    policy: ExhaustionPolicy,
    handler: Arc<dyn ReplyHandler>,
    state: Mutex<SequenceState>,
    changed: Notify,
    closed: CancellationToken,
}

struct SequenceState {
    next: u64,
    entries: HashMap<u16, Probe>,
    /// Popped entries whose handler has not returned yet
    resolving: usize,
}

/// A freshly registered probe.
pub struct Added<'a> {
    pub sequence: u16,
    pub outstanding: usize,
    /// Probe pushed out of its slot under `ExhaustionPolicy::Evict`
    pub evicted: Option<Resolution<'a>>,
}

/// A popped probe that still has to be handed to the handler.
///
/// Drain waits until every resolution is completed or dropped.
pub struct Resolution<'a> {
    index: &'a SequenceIndex,
    probe: Option<Probe>,
    pub remaining: usize,
}

impl<'a> Resolution<'a> {
    pub fn sequence(&self) -> u16 {
        self.probe.as_ref().map(|p| p.sequence).unwrap_or_default()
    }

    pub fn probe_mut(&mut self) -> Option<&mut Probe> {
        self.probe.as_mut()
    }

    /// Invoke the handler with the resolved probe.
    pub fn complete(mut self, result: Result<(), PingError>) {
        if let Some(mut probe) = self.probe.take() {
            probe.resolved = true;
            self.index.handler.on_reply(probe, result);
        }
    }
}

impl Drop for Resolution<'_> {
    fn drop(&mut self) {
        self.index.state.lock().resolving -= 1;
        self.index.changed.notify_waiters();
    }
}

enum Slot {
    Free,
    Evict,
    Busy,
}

impl SequenceIndex {
    pub fn new(
        addr: IpAddr,
        identifier: u16,
        timeout: Duration,
        policy: ExhaustionPolicy,
        handler: Arc<dyn ReplyHandler>,
    ) -> Self {
        Self {
            addr,
            identifier,
            timeout,
            policy,
            handler,
            state: Mutex::new(SequenceState {
                next: 1,
                entries: HashMap::new(),
                resolving: 0,
            }),
            changed: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a probe under the next sequence number.
    ///
    /// When that number is still outstanding the configured exhaustion
    /// policy applies: wait for it to resolve, or evict it. Waiting ends
    /// with `ConnClosed` once the index is closed.
    pub async fn add(&self) -> Result<Added<'_>, PingError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if self.closed.is_cancelled() {
                    return Err(PingError::ConnClosed);
                }

                let sequence = state.next as u16;
                let slot = match state.entries.contains_key(&sequence) {
                    false => Slot::Free,
                    true if self.policy == ExhaustionPolicy::Evict => Slot::Evict,
                    true => Slot::Busy,
                };

                let evicted = match slot {
                    Slot::Busy => None,
                    Slot::Free => Some(None),
                    Slot::Evict => {
                        let old = state.entries.remove(&sequence);
                        state.resolving += 1;
                        Some(old)
                    }
                };

                if let Some(evicted) = evicted {
                    let probe = Probe::new(self.addr, self.identifier, sequence, self.timeout);
                    state.entries.insert(sequence, probe);
                    state.next += 1;
                    let outstanding = state.entries.len();

                    let evicted = evicted.map(|probe| {
                        log::warn!(
                            "{} id={}: sequence {} still outstanding, evicting it",
                            self.addr,
                            self.identifier,
                            sequence
                        );
                        Resolution {
                            index: self,
                            probe: Some(probe),
                            remaining: outstanding,
                        }
                    });

                    return Ok(Added {
                        sequence,
                        outstanding,
                        evicted,
                    });
                }

                log::debug!(
                    "{} id={}: sequence {} still outstanding, waiting",
                    self.addr,
                    self.identifier,
                    sequence
                );
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Err(PingError::ConnClosed),
                _ = &mut notified => {}
            }
        }
    }

    /// Remove the probe with `sequence`. The caller that gets `Ok` owns its
    /// resolution.
    pub fn pop(&self, sequence: u16) -> Result<Resolution<'_>, PingError> {
        let resolution = {
            let mut state = self.state.lock();
            let probe = state
                .entries
                .remove(&sequence)
                .ok_or(PingError::NotFound { sequence })?;
            state.resolving += 1;
            Resolution {
                index: self,
                probe: Some(probe),
                remaining: state.entries.len(),
            }
        };
        self.changed.notify_waiters();
        Ok(resolution)
    }

    /// Record when the probe actually left and when it expires.
    /// Returns false if it was already resolved.
    pub fn mark_sent(&self, sequence: u16, sent: SystemTime, deadline: Instant) -> bool {
        match self.state.lock().entries.get_mut(&sequence) {
            Some(probe) => {
                probe.sent = sent;
                probe.deadline = deadline;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.state.lock().entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further probes and pop everything still outstanding.
    pub fn close(&self) -> Vec<Resolution<'_>> {
        self.closed.cancel();

        let resolutions: Vec<_> = {
            let mut state = self.state.lock();
            let probes: Vec<Probe> = state.entries.drain().map(|(_, probe)| probe).collect();
            state.resolving += probes.len();
            probes
                .into_iter()
                .map(|probe| Resolution {
                    index: self,
                    probe: Some(probe),
                    remaining: 0,
                })
                .collect()
        };
        self.changed.notify_waiters();
        resolutions
    }

    /// Wait until no probe is outstanding and no handler is still running.
    pub async fn drain(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.entries.is_empty() && state.resolving == 0 {
                    return;
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    type Log = Arc<Mutex<Vec<(u16, Option<String>)>>>;

    fn index_with_log(policy: ExhaustionPolicy) -> (Arc<SequenceIndex>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler = move |probe: Probe, result: Result<(), PingError>| {
            sink.lock()
                .push((probe.sequence, result.err().map(|e| e.to_string())));
        };
        let index = SequenceIndex::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            42,
            Duration::from_secs(1),
            policy,
            Arc::new(handler),
        );
        (Arc::new(index), log)
    }

    #[tokio::test]
    async fn test_sequences_start_at_one() {
        let (index, _) = index_with_log(ExhaustionPolicy::Block);
        for expected in 1..=3u16 {
            let added = index.add().await.unwrap();
            assert_eq!(added.sequence, expected);
            assert_eq!(added.outstanding, expected as usize);
            assert!(added.evicted.is_none());
        }
    }

    #[tokio::test]
    async fn test_pop_resolves_once() {
        let (index, log) = index_with_log(ExhaustionPolicy::Block);
        let sequence = index.add().await.unwrap().sequence;

        let resolution = index.pop(sequence).unwrap();
        assert_eq!(resolution.remaining, 0);
        assert!(matches!(index.pop(sequence), Err(PingError::NotFound { .. })));
        resolution.complete(Ok(()));

        assert_eq!(log.lock().clone(), vec![(sequence, None::<String>)]);
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_handler() {
        let (index, _) = index_with_log(ExhaustionPolicy::Block);
        let sequence = index.add().await.unwrap().sequence;
        let resolution = index.pop(sequence).unwrap();

        let drained = tokio::time::timeout(Duration::from_millis(20), index.drain()).await;
        assert!(drained.is_err());

        resolution.complete(Ok(()));
        tokio::time::timeout(Duration::from_millis(100), index.drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_pops_outstanding() {
        let (index, log) = index_with_log(ExhaustionPolicy::Block);
        index.add().await.unwrap();
        index.add().await.unwrap();

        for resolution in index.close() {
            resolution.complete(Err(PingError::ConnClosed));
        }

        assert!(index.is_empty());
        assert_eq!(log.lock().len(), 2);
        assert!(matches!(index.add().await, Err(PingError::ConnClosed)));
        index.drain().await;
    }

    async fn fill(index: &SequenceIndex) {
        for _ in 0..=u16::MAX as u32 {
            assert!(index.add().await.unwrap().evicted.is_none());
        }
        assert_eq!(index.len(), 65536);
    }

    #[tokio::test]
    async fn test_exhaustion_blocks_until_resolved() {
        let (index, _) = index_with_log(ExhaustionPolicy::Block);
        fill(&index).await;

        let waiter = tokio::spawn({
            let index = index.clone();
            async move { index.add().await.map(|added| added.sequence) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(index.len(), 65536);

        index.pop(1).unwrap().complete(Ok(()));
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(index.len(), 65536);
    }

    #[tokio::test]
    async fn test_blocked_add_cancelled_by_close() {
        let (index, _) = index_with_log(ExhaustionPolicy::Block);
        fill(&index).await;

        let waiter = tokio::spawn({
            let index = index.clone();
            async move { index.add().await.map(|added| added.sequence) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(index.close());
        assert!(matches!(waiter.await.unwrap(), Err(PingError::ConnClosed)));
    }

    #[tokio::test]
    async fn test_exhaustion_evicts_colliding_entry() {
        let (index, log) = index_with_log(ExhaustionPolicy::Evict);
        fill(&index).await;

        let added = index.add().await.unwrap();
        assert_eq!(added.sequence, 1);
        assert_eq!(added.outstanding, 65536);
        let evicted = added.evicted.unwrap();
        assert_eq!(evicted.sequence(), 1);
        evicted.complete(Err(PingError::SequenceExhausted { sequence: 1 }));

        assert_eq!(index.len(), 65536);
        assert!(index.contains(0));
        assert!(index.contains(2));
        assert_eq!(log.lock().len(), 1);
        assert_eq!(log.lock()[0].0, 1);
    }
}
