use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::error::PingError;
use crate::icmp::Family;
use crate::index::SequenceIndex;

/// IPv4 address followed by the big-endian identifier
type V4Key = [u8; 6];
/// IPv6 address followed by the big-endian identifier
type V6Key = [u8; 18];

fn v4_key(addr: Ipv4Addr, identifier: u16) -> V4Key {
    let mut key = [0u8; 6];
    key[..4].copy_from_slice(&addr.octets());
    key[4..].copy_from_slice(&identifier.to_be_bytes());
    key
}

fn v6_key(addr: Ipv6Addr, identifier: u16) -> V6Key {
    let mut key = [0u8; 18];
    key[..16].copy_from_slice(&addr.octets());
    key[16..].copy_from_slice(&identifier.to_be_bytes());
    key
}

pub(crate) struct EndpointMap<K> {
    entries: RwLock<HashMap<K, Arc<SequenceIndex>>>,
}

impl<K: Eq + Hash> EndpointMap<K> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn add(&self, key: K, index: Arc<SequenceIndex>) -> Option<usize> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(key, index);
        Some(entries.len())
    }

    fn pop(&self, key: &K) -> Option<(Arc<SequenceIndex>, usize)> {
        let mut entries = self.entries.write();
        let index = entries.remove(key)?;
        Some((index, entries.len()))
    }

    fn get(&self, key: &K) -> Option<Arc<SequenceIndex>> {
        self.entries.read().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Registered endpoints of one protocol, keyed by (address, identifier).
pub(crate) enum EndpointIndex {
    V4(EndpointMap<V4Key>),
    V6(EndpointMap<V6Key>),
}

impl EndpointIndex {
    pub fn new(family: Family) -> Self {
        match family {
            Family::V4 => EndpointIndex::V4(EndpointMap::new()),
            Family::V6 => EndpointIndex::V6(EndpointMap::new()),
        }
    }

    /// Register `index` under its address and identifier. Returns the number
    /// of endpoints afterwards.
    pub fn add(&self, index: Arc<SequenceIndex>) -> Result<usize, PingError> {
        let (addr, identifier) = (index.addr(), index.identifier());
        let count = match (self, addr) {
            (EndpointIndex::V4(map), IpAddr::V4(v4)) => map.add(v4_key(v4, identifier), index),
            (EndpointIndex::V6(map), IpAddr::V6(v6)) => map.add(v6_key(v6, identifier), index),
            _ => return Err(PingError::DoesNotExist { addr, identifier }),
        };
        count.ok_or(PingError::AlreadyExists { addr, identifier })
    }

    /// Deregister an endpoint. Returns its sequence index and the number of
    /// endpoints left.
    pub fn pop(&self, addr: IpAddr, identifier: u16) -> Result<(Arc<SequenceIndex>, usize), PingError> {
        let popped = match (self, addr) {
            (EndpointIndex::V4(map), IpAddr::V4(v4)) => map.pop(&v4_key(v4, identifier)),
            (EndpointIndex::V6(map), IpAddr::V6(v6)) => map.pop(&v6_key(v6, identifier)),
            _ => None,
        };
        popped.ok_or(PingError::DoesNotExist { addr, identifier })
    }

    pub fn get(&self, addr: IpAddr, identifier: u16) -> Option<Arc<SequenceIndex>> {
        match (self, addr) {
            (EndpointIndex::V4(map), IpAddr::V4(v4)) => map.get(&v4_key(v4, identifier)),
            (EndpointIndex::V6(map), IpAddr::V6(v6)) => map.get(&v6_key(v6, identifier)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EndpointIndex::V4(map) => map.len(),
            EndpointIndex::V6(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExhaustionPolicy;
    use crate::icmp::Probe;
    use std::time::Duration;

    fn sequence_index(addr: IpAddr, identifier: u16) -> Arc<SequenceIndex> {
        let handler = |_: Probe, _: Result<(), PingError>| {};
        Arc::new(SequenceIndex::new(
            addr,
            identifier,
            Duration::from_secs(1),
            ExhaustionPolicy::Block,
            Arc::new(handler),
        ))
    }

    #[test]
    fn test_key_packing() {
        let key = v4_key(Ipv4Addr::new(10, 0, 0, 1), 0x1234);
        assert_eq!(key, [10, 0, 0, 1, 0x12, 0x34]);

        let key = v6_key(Ipv6Addr::LOCALHOST, 0xABCD);
        assert_eq!(key[15], 1);
        assert_eq!(&key[16..], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_duplicate_registration() {
        let endpoints = EndpointIndex::new(Family::V4);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        let first = sequence_index(addr, 7);
        assert_eq!(endpoints.add(first.clone()).unwrap(), 1);

        let second = sequence_index(addr, 7);
        assert!(matches!(
            endpoints.add(second),
            Err(PingError::AlreadyExists { identifier: 7, .. })
        ));
        assert_eq!(endpoints.len(), 1);
        assert!(Arc::ptr_eq(&endpoints.get(addr, 7).unwrap(), &first));
    }

    #[test]
    fn test_counts_follow_registrations() {
        let endpoints = EndpointIndex::new(Family::V6);
        let addr: IpAddr = "::1".parse().unwrap();

        assert_eq!(endpoints.add(sequence_index(addr, 1)).unwrap(), 1);
        assert_eq!(endpoints.add(sequence_index(addr, 2)).unwrap(), 2);

        let (_, left) = endpoints.pop(addr, 1).unwrap();
        assert_eq!(left, 1);
        let (_, left) = endpoints.pop(addr, 2).unwrap();
        assert_eq!(left, 0);

        assert!(matches!(
            endpoints.pop(addr, 2),
            Err(PingError::DoesNotExist { .. })
        ));
        assert!(endpoints.get(addr, 1).is_none());
    }

    #[test]
    fn test_wrong_family_is_rejected() {
        let endpoints = EndpointIndex::new(Family::V4);
        let addr: IpAddr = "::1".parse().unwrap();
        assert!(endpoints.add(sequence_index(addr, 1)).is_err());
        assert!(endpoints.get(addr, 1).is_none());
        assert!(endpoints.is_empty());
    }
}
