pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

use socket2::{Domain, Protocol};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

/// Address family of a transport. One raw socket exists per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn echo_request_type(self) -> u8 {
        match self {
            Family::V4 => ICMP_ECHO_REQUEST,
            Family::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    pub fn echo_reply_type(self) -> u8 {
        match self {
            Family::V4 => ICMP_ECHO_REPLY,
            Family::V6 => ICMPV6_ECHO_REPLY,
        }
    }

    pub(crate) fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    pub(crate) fn protocol(self) -> Protocol {
        match self {
            Family::V4 => Protocol::ICMPV4,
            Family::V6 => Protocol::ICMPV6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// Furthest deadline ever scheduled, about thirty years out
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating at a far-future instant for timeouts too
/// large to represent.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// One echo request and, once resolved, what came back for it.
#[derive(Debug, Clone)]
pub struct Probe {
    pub addr: IpAddr,
    pub identifier: u16,
    pub sequence: u16,
    pub sent: SystemTime,
    pub received: Option<SystemTime>,
    pub deadline: Instant,
    /// TTL (IPv4) or hop limit (IPv6) of the reply, when the socket reported it
    pub ttl: Option<u8>,
    /// Length of the reply's ICMP message
    pub len: usize,
    pub resolved: bool,
}

impl Probe {
    pub fn new(addr: IpAddr, identifier: u16, sequence: u16, timeout: Duration) -> Self {
        Self {
            addr,
            identifier,
            sequence,
            sent: SystemTime::now(),
            received: None,
            deadline: deadline_after(timeout),
            ttl: None,
            len: 0,
            resolved: false,
        }
    }

    /// Round trip time, if a reply was received.
    pub fn rtt(&self) -> Option<Duration> {
        self.received
            .and_then(|received| received.duration_since(self.sent).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > before + Duration::from_secs(86400 * 365));

        let near = deadline_after(Duration::from_millis(10));
        assert!(near >= before + Duration::from_millis(10));
        assert!(near < deadline);
    }

    #[test]
    fn test_echo_with_unbounded_timeout() {
        let probe = Probe::new("127.0.0.1".parse().unwrap(), 1, 1, Duration::MAX);
        assert!(probe.deadline > Instant::now());
        assert!(probe.rtt().is_none());
    }
}
