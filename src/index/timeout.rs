//! Expiry of outstanding probes across all endpoints of one protocol.
//!
//! Only the earliest deadline is ever armed. Adding or removing an entry
//! re-arms the waiter when that earliest deadline moves.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeoutKey {
    pub addr: IpAddr,
    pub identifier: u16,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub key: TimeoutKey,
    pub deadline: Instant,
}

#[derive(Default)]
struct TimeoutState {
    order: BTreeSet<(Instant, TimeoutKey)>,
    deadlines: HashMap<TimeoutKey, Instant>,
    next: Option<Instant>,
}

impl TimeoutState {
    /// Recompute the earliest deadline, reporting whether it moved.
    fn refresh(&mut self) -> bool {
        let next = self.order.first().map(|(deadline, _)| *deadline);
        let changed = next != self.next;
        self.next = next;
        changed
    }
}

#[derive(Default)]
pub struct TimeoutIndex {
    state: Mutex<TimeoutState>,
    rearm: Notify,
}

impl TimeoutIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: TimeoutKey, deadline: Instant) {
        let changed = {
            let mut state = self.state.lock();
            if let Some(old) = state.deadlines.insert(key, deadline) {
                state.order.remove(&(old, key));
            }
            state.order.insert((deadline, key));
            state.refresh()
        };
        if changed {
            self.rearm.notify_waiters();
        }
    }

    pub fn del(&self, key: &TimeoutKey) -> bool {
        let (removed, changed) = {
            let mut state = self.state.lock();
            match state.deadlines.remove(key) {
                Some(deadline) => {
                    state.order.remove(&(deadline, *key));
                    (true, state.refresh())
                }
                None => (false, false),
            }
        };
        if changed {
            self.rearm.notify_waiters();
        }
        removed
    }

    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.order.clear();
            state.deadlines.clear();
            state.next = None;
        }
        self.rearm.notify_waiters();
    }

    pub fn contains(&self, key: &TimeoutKey) -> bool {
        self.state.lock().deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().next
    }

    /// Wait for the earliest deadline to pass, remove its entry and return
    /// it. Returns `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Expired> {
        loop {
            let rearm = self.rearm.notified();
            tokio::pin!(rearm);
            rearm.as_mut().enable();

            let armed = self.state.lock().next;
            let timer = async move {
                match armed {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut rearm => continue,
                _ = timer => {
                    let mut state = self.state.lock();
                    // Superseded by an add or del since the timer was armed
                    if state.next != armed {
                        continue;
                    }
                    let Some(&(deadline, key)) = state.order.first() else {
                        continue;
                    };
                    if deadline > Instant::now() {
                        continue;
                    }

                    state.order.remove(&(deadline, key));
                    state.deadlines.remove(&key);
                    state.refresh();
                    return Some(Expired { key, deadline });
                }
            }
        }
    }
}
