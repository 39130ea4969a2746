//! Timing and sizing knobs of a [`Stack`](crate::Stack).

use std::{ops::RangeInclusive, time::Duration};
use thiserror::Error as ThisError;

use crate::{conduit::GraphError, message::ScopeId, wire::Ipv4Address};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// The base of the ARP retry backoff. Retry `n` waits `arp_backoff << n`.
    pub arp_backoff: Duration,
    /// Unanswered ARP requests before resolution is abandoned.
    pub arp_retries: u32,
    /// RFC 5227 PROBE_WAIT.
    pub probe_wait: Duration,
    /// RFC 5227 PROBE_NUM.
    pub probe_num: u32,
    pub probe_interval: Duration,
    /// RFC 5227 ANNOUNCE_WAIT.
    pub announce_wait: Duration,
    /// RFC 5227 ANNOUNCE_NUM.
    pub announce_num: u32,
    pub announce_interval: Duration,
    /// Ports handed out to sockets that do not bind one explicitly.
    pub ephemeral_ports: RangeInclusive<u16>,
    /// Payload bytes a datagram socket buffers before dropping.
    pub datagram_capacity: usize,
    /// Payload bytes a stream socket buffers before refusing more.
    pub stream_capacity: usize,
    pub default_ttl: u8,
    /// Neighbors kept before the ones nothing refers to are forgotten.
    pub neighbor_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            arp_backoff: Duration::from_micros(5_000_000),
            arp_retries: 6,
            probe_wait: Duration::from_secs(1),
            probe_num: 3,
            probe_interval: Duration::from_secs(1),
            announce_wait: Duration::from_secs(2),
            announce_num: 2,
            announce_interval: Duration::from_secs(2),
            ephemeral_ports: 49152..=65535,
            datagram_capacity: 128 * 1024,
            stream_capacity: 64 * 1024,
            default_ttl: 64,
            neighbor_capacity: 256,
        }
    }
}

impl StackConfig {
    pub fn arp_backoff(mut self, base: Duration) -> Self {
        self.arp_backoff = base;
        self
    }

    pub fn arp_retries(mut self, retries: u32) -> Self {
        self.arp_retries = retries;
        self
    }

    pub fn probing(mut self, wait: Duration, count: u32, interval: Duration) -> Self {
        self.probe_wait = wait;
        self.probe_num = count;
        self.probe_interval = interval;
        self
    }

    pub fn announcing(mut self, wait: Duration, count: u32, interval: Duration) -> Self {
        self.announce_wait = wait;
        self.announce_num = count;
        self.announce_interval = interval;
        self
    }

    pub fn ephemeral_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.ephemeral_ports = ports;
        self
    }

    pub fn datagram_capacity(mut self, bytes: usize) -> Self {
        self.datagram_capacity = bytes;
        self
    }

    pub fn stream_capacity(mut self, bytes: usize) -> Self {
        self.stream_capacity = bytes;
        self
    }

    pub fn default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn neighbor_capacity(mut self, neighbors: usize) -> Self {
        self.neighbor_capacity = neighbors;
        self
    }

    /// How long resolving a neighbor can take before it is given up on.
    pub fn resolution_time(&self) -> Duration {
        let waits: u32 = (1..=self.arp_retries.min(16)).map(|n| 1u32 << n).sum();
        self.arp_backoff * (waits + 1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ephemeral_ports.is_empty() || *self.ephemeral_ports.start() == 0 {
            Err(ConfigError::PortRange)?
        }
        let capacities = [
            self.datagram_capacity,
            self.stream_capacity,
            self.neighbor_capacity,
        ];
        if capacities.contains(&0) {
            Err(ConfigError::ZeroCapacity)?
        }
        if self.default_ttl == 0 {
            Err(ConfigError::ZeroTtl)?
        }
        Ok(())
    }
}

/// Errors from configuring a stack or its address table.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("The ephemeral port range is empty or includes port 0")]
    PortRange,
    #[error("Socket buffers and the neighbor table need a nonzero capacity")]
    ZeroCapacity,
    #[error("The default TTL must be nonzero")]
    ZeroTtl,
    #[error("There is no interface with scope {0}")]
    UnknownScope(ScopeId),
    #[error("{0} is already in the address table for scope {1}")]
    AddressExists(Ipv4Address, ScopeId),
    #[error("{0} is not in the address table for scope {1}")]
    UnknownAddress(Ipv4Address, ScopeId),
    #[error("{0} cannot be assigned to an interface")]
    Unassignable(Ipv4Address),
    #[error("Prefix length {0} is longer than 32")]
    Prefix(u8),
    #[error(transparent)]
    Graph(#[from] GraphError),
}
