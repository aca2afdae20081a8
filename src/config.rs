use crate::icmp::DEFAULT_PAYLOAD_SIZE;

/// Default capacity of the dispatcher queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// How received packets are handed from the receive loop to route handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Route on the receive loop before the next read
    Inline,
    /// One short-lived task per packet, no backpressure
    Spawn,
    /// Bounded queue; a new persistent worker is started whenever it is full
    Elastic { queue: usize },
    /// Fixed number of persistent workers; a full queue blocks the receive loop
    Fixed { workers: usize, queue: usize },
}

impl DispatchPolicy {
    /// Map the numeric worker setting onto a policy: below -1 is inline,
    /// -1 elastic, 0 one task per packet, and a positive value that many
    /// fixed workers.
    pub fn from_value(value: i32, queue: usize) -> Self {
        match value {
            v if v < -1 => DispatchPolicy::Inline,
            -1 => DispatchPolicy::Elastic { queue },
            0 => DispatchPolicy::Spawn,
            v => DispatchPolicy::Fixed {
                workers: v as usize,
                queue,
            },
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy::Elastic {
            queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// What `send_ping` does when the next sequence number is still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Wait until the outstanding probe is resolved
    #[default]
    Block,
    /// Resolve the outstanding probe with `SequenceExhausted` and reuse its slot
    Evict,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Echo payload size in bytes, never less than the 8-byte timestamp
    pub payload_size: usize,
    pub exhaustion: ExhaustionPolicy,
    pub dispatch_v4: DispatchPolicy,
    pub dispatch_v6: DispatchPolicy,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            payload_size: DEFAULT_PAYLOAD_SIZE,
            exhaustion: ExhaustionPolicy::default(),
            dispatch_v4: DispatchPolicy::default(),
            dispatch_v6: DispatchPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_value() {
        assert_eq!(DispatchPolicy::from_value(-5, 8), DispatchPolicy::Inline);
        assert_eq!(DispatchPolicy::from_value(-2, 8), DispatchPolicy::Inline);
        assert_eq!(DispatchPolicy::from_value(-1, 8), DispatchPolicy::Elastic { queue: 8 });
        assert_eq!(DispatchPolicy::from_value(0, 8), DispatchPolicy::Spawn);
        assert_eq!(
            DispatchPolicy::from_value(4, 8),
            DispatchPolicy::Fixed {
                workers: 4,
                queue: 8
            }
        );
    }

    #[test]
    fn test_default_config() {
        let config = MuxConfig::default();
        assert_eq!(config.payload_size, DEFAULT_PAYLOAD_SIZE);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Block);
        assert_eq!(config.dispatch_v4, DispatchPolicy::default());
    }
}
