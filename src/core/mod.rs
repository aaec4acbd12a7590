//! Core abstractions: server identity, the per-server connection, the hash
//! ring and the pool that owns them
pub mod connection;
pub mod pool;
pub mod ring;

pub use connection::{
    CommandId, ConnEvent, Connection, ConnectionOptions, ConnectionState, ConnectionStats,
    QueuedCommand, Wakeup,
};
pub use pool::{ConfigureReport, ServerPool};
pub use ring::HashRing;

use crate::error::ConfigError;
use crate::health::{Liveness, ServerState};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Stable identifier of a server inside one pool; never reused
pub type ServerId = u32;

/// Port used when a server address omits one
pub const DEFAULT_PORT: u16 = 11211;

/// Address and weight of a cache server, as configured
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl ServerSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port` label; IPv6 hosts are bracketed
    pub fn label(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse `host[:port[:weight]]`, with `[v6addr]` for IPv6 hosts
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let invalid = |reason: &str| {
            ConfigError::ValidationError(format!("Invalid server '{}': {}", input, reason))
        };

        let (host, rest) = if let Some(stripped) = input.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| invalid("missing ']'"))?;
            (&stripped[..end], &stripped[end + 1..])
        } else {
            match input.find(':') {
                Some(idx) => (&input[..idx], &input[idx..]),
                None => (input, ""),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let mut spec = ServerSpec::new(host, DEFAULT_PORT);
        if !rest.is_empty() {
            let rest = rest.strip_prefix(':').ok_or_else(|| invalid("unexpected characters"))?;
            let mut parts = rest.split(':');
            if let Some(port) = parts.next() {
                spec.port = port.parse().map_err(|_| invalid("bad port"))?;
            }
            if let Some(weight) = parts.next() {
                spec.weight = weight.parse().map_err(|_| invalid("bad weight"))?;
            }
            if parts.next().is_some() {
                return Err(invalid("too many ':' separated fields"));
            }
        }

        if spec.weight == 0 {
            return Err(invalid("weight must be greater than 0"));
        }
        Ok(spec)
    }

    /// Parse a comma separated server list
    pub fn parse_list(input: &str) -> Result<Vec<Self>, ConfigError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl FromStr for ServerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Command counters kept per server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub reconnects: u64,
}

/// A configured cache server and its connection
#[derive(Debug)]
pub struct Server {
    pub id: ServerId,
    pub spec: ServerSpec,
    pub liveness: Liveness,
    pub connection: Connection,
    pub counters: ServerCounters,
}

impl Server {
    pub fn new(id: ServerId, spec: ServerSpec, options: ConnectionOptions) -> Self {
        let connection = Connection::new(id, spec.label(), options);
        Self {
            id,
            spec,
            liveness: Liveness::new(),
            connection,
            counters: ServerCounters::default(),
        }
    }

    pub fn label(&self) -> String {
        self.spec.label()
    }

    pub fn state(&self) -> ServerState {
        self.liveness.state()
    }

    pub fn stats(&self, ring_points: usize) -> ServerStats {
        ServerStats {
            id: self.id,
            address: self.label(),
            weight: self.spec.weight,
            state: self.liveness.state(),
            connection: self.connection.state(),
            consecutive_failures: self.liveness.consecutive_failures(),
            last_failure: self.liveness.last_failure(),
            ring_points,
            pending: self.connection.pending_len(),
            in_flight: self.connection.in_flight_len(),
            counters: self.counters.clone(),
            io: self.connection.stats().clone(),
        }
    }
}

/// Snapshot of one server returned by `stats()`
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub id: ServerId,
    pub address: String,
    pub weight: u32,
    pub state: ServerState,
    pub connection: ConnectionState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub ring_points: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub counters: ServerCounters,
    pub io: ConnectionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_spec() {
        assert_eq!(
            ServerSpec::parse("cache1:11212").unwrap(),
            ServerSpec::new("cache1", 11212)
        );
        assert_eq!(
            ServerSpec::parse("cache1").unwrap(),
            ServerSpec::new("cache1", DEFAULT_PORT)
        );
        assert_eq!(
            ServerSpec::parse("10.0.0.1:11211:3").unwrap(),
            ServerSpec::new("10.0.0.1", 11211).with_weight(3)
        );
        assert_eq!(
            ServerSpec::parse("[::1]:11213").unwrap(),
            ServerSpec::new("::1", 11213)
        );
        assert_eq!(ServerSpec::new("::1", 11213).label(), "[::1]:11213");
    }

    #[test]
    fn test_parse_server_spec_errors() {
        assert!(ServerSpec::parse("").is_err());
        assert!(ServerSpec::parse(":11211").is_err());
        assert!(ServerSpec::parse("host:port").is_err());
        assert!(ServerSpec::parse("host:1:0").is_err());
        assert!(ServerSpec::parse("host:1:2:3").is_err());
        assert!(ServerSpec::parse("[::1").is_err());
    }

    #[test]
    fn test_parse_server_list() {
        let specs = ServerSpec::parse_list("a:1, b:2 ,c").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].label(), "b:2");
        assert_eq!(specs[2].port, DEFAULT_PORT);
        assert!(ServerSpec::parse_list("").unwrap().is_empty());
    }
}
