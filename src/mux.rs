//! Many logical ping connections over one raw socket per address family.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchPolicy, MuxConfig};
use crate::dispatch::{Datagram, PacketSink};
use crate::error::PingError;
use crate::icmp::{self, Family, SocketOpener, SystemSockets};
use crate::index::{Added, EndpointIndex, Expired, ReplyHandler, SequenceIndex, TimeoutIndex, TimeoutKey};
use crate::transport::Transport;
use crate::utils::generate_identifier;

/// Random identifiers tried before `new_conn` gives up
const MAX_IDENTIFIER_ATTEMPTS: usize = 1024;

/// Routes replies and expiries of one family to their sequence indexes.
struct Router {
    family: Family,
    endpoints: EndpointIndex,
    timeouts: TimeoutIndex,
}

impl Router {
    fn new(family: Family) -> Self {
        Self {
            family,
            endpoints: EndpointIndex::new(family),
            timeouts: TimeoutIndex::new(),
        }
    }

    fn route(&self, datagram: Datagram) {
        let echo = match icmp::decode(&datagram.bytes, self.family.echo_reply_type()) {
            Ok(echo) => echo,
            Err(e) => {
                log::trace!(
                    "dropping {} bytes from {} to {:?}: {}",
                    datagram.bytes.len(),
                    datagram.source,
                    datagram.destination,
                    e
                );
                return;
            }
        };

        let Some(seqs) = self.endpoints.get(datagram.source, echo.identifier) else {
            log::trace!(
                "dropping reply from {} id={}: no such endpoint",
                datagram.source,
                echo.identifier
            );
            return;
        };

        let mut resolution = match seqs.pop(echo.sequence) {
            Ok(resolution) => resolution,
            Err(e) => {
                log::trace!("dropping reply from {} id={}: {}", datagram.source, echo.identifier, e);
                return;
            }
        };

        self.timeouts.del(&TimeoutKey {
            addr: datagram.source,
            identifier: echo.identifier,
            sequence: echo.sequence,
        });

        if let Some(probe) = resolution.probe_mut() {
            probe.sent = echo.sent;
            probe.received = Some(datagram.received);
            probe.ttl = datagram.ttl;
            probe.len = datagram.bytes.len();
        }
        resolution.complete(Ok(()));
    }

    fn expire(&self, expired: Expired) {
        let key = expired.key;
        let Some(seqs) = self.endpoints.get(key.addr, key.identifier) else {
            return;
        };
        match seqs.pop(key.sequence) {
            Ok(resolution) => resolution.complete(Err(PingError::Timeout)),
            Err(e) => log::trace!("{} id={}: expiry lost the race: {}", key.addr, key.identifier, e),
        }
    }
}

impl PacketSink for Router {
    fn deliver(&self, datagram: Datagram) {
        self.route(datagram);
    }
}

async fn expire_loop(router: Arc<Router>, cancel: CancellationToken) {
    while let Some(expired) = router.timeouts.next(&cancel).await {
        router.expire(expired);
    }
}

/// Endpoints, transport and lifecycle of one address family.
struct Protocol {
    router: Arc<Router>,
    transport: Transport,
    policy: parking_lot::Mutex<DispatchPolicy>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Protocol {
    fn new(family: Family, config: &MuxConfig, opener: Arc<dyn SocketOpener>) -> Self {
        let policy = match family {
            Family::V4 => config.dispatch_v4,
            Family::V6 => config.dispatch_v6,
        };
        Self {
            router: Arc::new(Router::new(family)),
            transport: Transport::new(family, config.payload_size, opener),
            policy: parking_lot::Mutex::new(policy),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring the transport in line with the endpoint count: running while
    /// any endpoint is registered, stopped otherwise.
    async fn reconcile(&self) -> Result<(), PingError> {
        let _lifecycle = self.lifecycle.lock().await;
        let wanted = !self.router.endpoints.is_empty();

        if wanted && !self.transport.is_running() {
            let policy = *self.policy.lock();
            self.transport.run(policy, self.router.clone())?;
            let router = self.router.clone();
            self.transport
                .spawn(move |cancel| expire_loop(router, cancel))?;
        } else if !wanted && self.transport.is_running() {
            self.transport.stop().await;
            self.router.timeouts.clear();
        }
        Ok(())
    }
}

/// A registered (destination, identifier) pair.
#[derive(Clone)]
pub struct PingConn {
    family: Family,
    seqs: Arc<SequenceIndex>,
}

impl PingConn {
    pub fn addr(&self) -> IpAddr {
        self.seqs.addr()
    }

    pub fn identifier(&self) -> u16 {
        self.seqs.identifier()
    }

    pub fn timeout(&self) -> Duration {
        self.seqs.timeout()
    }

    /// Probes sent on this connection that are not resolved yet.
    pub fn outstanding(&self) -> usize {
        self.seqs.len()
    }
}

impl std::fmt::Debug for PingConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingConn")
            .field("addr", &self.addr())
            .field("identifier", &self.identifier())
            .finish()
    }
}

/// Result of a successful `send_ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub sequence: u16,
    /// Probes outstanding on the connection, this one included
    pub outstanding: usize,
}

/// Resolves a registered sequence whose write was abandoned, so a dropped
/// `send_ping` future never leaves an entry without an expiry.
struct Unsent<'a> {
    seqs: &'a SequenceIndex,
    sequence: u16,
    armed: bool,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(resolution) = self.seqs.pop(self.sequence) {
            log::debug!(
                "{} id={} seq={}: send cancelled",
                self.seqs.addr(),
                self.seqs.identifier(),
                self.sequence
            );
            resolution.complete(Err(PingError::Send(io::Error::new(
                io::ErrorKind::Interrupted,
                "send cancelled",
            ))));
        }
    }
}

pub struct Multiplexer {
    config: MuxConfig,
    v4: Protocol,
    v6: Protocol,
}

impl Multiplexer {
    /// A multiplexer over the operating system's raw ICMP sockets.
    pub fn new(config: MuxConfig) -> Self {
        Self::with_opener(config, Arc::new(SystemSockets))
    }

    pub fn with_opener(config: MuxConfig, opener: Arc<dyn SocketOpener>) -> Self {
        let v4 = Protocol::new(Family::V4, &config, opener.clone());
        let v6 = Protocol::new(Family::V6, &config, opener);
        Self { config, v4, v6 }
    }

    fn protocol(&self, family: Family) -> &Protocol {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    /// Dispatcher policy for the next start of `family`'s transport.
    pub fn set_dispatch(&self, family: Family, policy: DispatchPolicy) {
        *self.protocol(family).policy.lock() = policy;
    }

    pub fn is_running(&self, family: Family) -> bool {
        self.protocol(family).transport.is_running()
    }

    pub fn endpoint_count(&self, family: Family) -> usize {
        self.protocol(family).router.endpoints.len()
    }

    /// Probes of `family` waiting for their deadline.
    pub fn pending_timeouts(&self, family: Family) -> usize {
        self.protocol(family).router.timeouts.len()
    }

    /// Tasks alive in `family`'s transport scope.
    pub fn task_count(&self, family: Family) -> usize {
        self.protocol(family).transport.task_count()
    }

    /// Register `destination` under a random free identifier.
    pub async fn new_conn<H: ReplyHandler>(
        &self,
        destination: IpAddr,
        handler: H,
        timeout: Duration,
    ) -> Result<PingConn, PingError> {
        let handler: Arc<dyn ReplyHandler> = Arc::new(handler);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let identifier = generate_identifier();
            match self
                .register(destination, identifier, handler.clone(), timeout)
                .await
            {
                Err(PingError::AlreadyExists { .. }) if attempts < MAX_IDENTIFIER_ATTEMPTS => {
                    log::trace!("{} id={} taken, picking another", destination, identifier);
                }
                result => return result,
            }
        }
    }

    /// Register `destination` under a caller-chosen identifier.
    pub async fn new_conn_with_id<H: ReplyHandler>(
        &self,
        destination: IpAddr,
        identifier: u16,
        handler: H,
        timeout: Duration,
    ) -> Result<PingConn, PingError> {
        self.register(destination, identifier, Arc::new(handler), timeout)
            .await
    }

    async fn register(
        &self,
        destination: IpAddr,
        identifier: u16,
        handler: Arc<dyn ReplyHandler>,
        timeout: Duration,
    ) -> Result<PingConn, PingError> {
        let family = Family::of(destination);
        let protocol = self.protocol(family);

        let seqs = Arc::new(SequenceIndex::new(
            destination,
            identifier,
            timeout,
            self.config.exhaustion,
            handler,
        ));
        let count = protocol.router.endpoints.add(seqs.clone())?;

        if let Err(e) = protocol.reconcile().await {
            if let Err(rollback) = protocol.router.endpoints.pop(destination, identifier) {
                log::trace!("rollback of {} id={}: {}", destination, identifier, rollback);
            }
            if let Err(retry) = protocol.reconcile().await {
                log::debug!("{} transport still unavailable: {}", family, retry);
            }
            return Err(e);
        }

        log::debug!(
            "registered {} id={} ({} {} endpoints)",
            destination,
            identifier,
            count,
            family
        );
        Ok(PingConn { family, seqs })
    }

    /// Deregister `conn`. Probes still outstanding are resolved with
    /// `ConnClosed`; returns once every handler call for them has finished.
    pub async fn close(&self, conn: &PingConn) -> Result<(), PingError> {
        let protocol = self.protocol(conn.family);
        let (seqs, remaining) = protocol
            .router
            .endpoints
            .pop(conn.addr(), conn.identifier())?;

        for resolution in seqs.close() {
            protocol.router.timeouts.del(&TimeoutKey {
                addr: seqs.addr(),
                identifier: seqs.identifier(),
                sequence: resolution.sequence(),
            });
            resolution.complete(Err(PingError::ConnClosed));
        }
        seqs.drain().await;

        log::debug!(
            "closed {} id={} ({} {} endpoints left)",
            seqs.addr(),
            seqs.identifier(),
            remaining,
            conn.family
        );
        if remaining == 0 {
            protocol.reconcile().await?;
        }
        Ok(())
    }

    /// Send one echo request on `conn`.
    ///
    /// Write failures are delivered to the handler rather than returned.
    pub async fn send_ping(&self, conn: &PingConn) -> Result<Sent, PingError> {
        let protocol = self.protocol(conn.family);
        let router = &protocol.router;
        let seqs = &conn.seqs;

        let Added {
            sequence,
            outstanding,
            evicted,
        } = seqs.add().await?;

        let key = TimeoutKey {
            addr: seqs.addr(),
            identifier: seqs.identifier(),
            sequence,
        };

        if let Some(evicted) = evicted {
            router.timeouts.del(&key);
            evicted.complete(Err(PingError::SequenceExhausted { sequence }));
        }

        let mut unsent = Unsent {
            seqs,
            sequence,
            armed: true,
        };
        let written = protocol
            .transport
            .send(seqs.addr(), seqs.identifier(), sequence)
            .await;
        unsent.armed = false;

        match written {
            Ok(sent) => {
                let deadline = icmp::deadline_after(seqs.timeout());
                if seqs.mark_sent(sequence, sent, deadline) {
                    router.timeouts.add(key, deadline);
                    // The reply may have been routed before the expiry existed
                    if !seqs.contains(sequence) {
                        router.timeouts.del(&key);
                    }
                }
            }
            Err(e) => {
                log::debug!("{} id={} seq={}: {}", key.addr, key.identifier, sequence, e);
                if let Ok(resolution) = seqs.pop(sequence) {
                    resolution.complete(Err(e));
                }
            }
        }

        Ok(Sent {
            sequence,
            outstanding,
        })
    }
}
