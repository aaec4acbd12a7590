//! Server set management
//!
//! The pool owns every configured server together with its connection and
//! the current ring snapshot. It is the only place that rebuilds the ring.
use super::connection::{ConnEvent, ConnectionOptions};
use super::{HashRing, Server, ServerId, ServerSpec, ServerStats};
use crate::error::{ConfigError, MemringError, MemringResult};
use crate::health::{Backoff, ServerState};
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Changes applied by [`ServerPool::configure`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reweighted: Vec<String>,
    pub ring_rebuilt: bool,
}

#[derive(Debug)]
pub struct ServerPool {
    servers: FnvHashMap<ServerId, Server>,
    ring: Arc<HashRing>,
    next_id: ServerId,
    points_per_weight: u32,
    backoff: Backoff,
    options: ConnectionOptions,
}

impl ServerPool {
    pub fn new(points_per_weight: u32, backoff: Backoff, options: ConnectionOptions) -> Self {
        Self {
            servers: FnvHashMap::default(),
            ring: Arc::new(HashRing::default()),
            next_id: 0,
            points_per_weight,
            backoff,
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.get_mut(&id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn servers_mut(&mut self) -> impl Iterator<Item = &mut Server> {
        self.servers.values_mut()
    }

    pub fn find(&self, label: &str) -> Option<ServerId> {
        self.servers
            .values()
            .find(|server| server.label() == label)
            .map(|server| server.id)
    }

    /// Apply a new server list
    ///
    /// Servers are matched by `host:port`. Removed servers are drained and
    /// their commands reported through `events` for rerouting. The ring is
    /// rebuilt only when membership or weights changed.
    pub fn configure(
        &mut self,
        specs: Vec<ServerSpec>,
        events: &mut Vec<ConnEvent>,
    ) -> MemringResult<ConfigureReport> {
        let mut seen = FnvHashSet::default();
        for spec in &specs {
            if spec.weight == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "server {} has weight 0",
                    spec.label()
                ))
                .into());
            }
            if !seen.insert(spec.label()) {
                return Err(ConfigError::ValidationError(format!(
                    "server {} is listed twice",
                    spec.label()
                ))
                .into());
            }
        }

        let mut report = ConfigureReport::default();

        let removed: Vec<ServerId> = self
            .servers
            .values()
            .filter(|server| !seen.contains(&server.label()))
            .map(|server| server.id)
            .collect();
        for id in removed {
            if let Some(mut server) = self.servers.remove(&id) {
                info!("Removing server {}", server.label());
                server
                    .connection
                    .drain("server removed from configuration", false, events);
                report.removed.push(server.label());
            }
        }

        for spec in specs {
            let label = spec.label();
            match self.find(&label) {
                Some(id) => {
                    if let Some(server) = self.servers.get_mut(&id) {
                        if server.spec.weight != spec.weight {
                            debug!(
                                "Server {} weight {} -> {}",
                                label, server.spec.weight, spec.weight
                            );
                            server.spec.weight = spec.weight;
                            report.reweighted.push(label);
                        }
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    info!("Adding server {} (weight {})", label, spec.weight);
                    self.servers
                        .insert(id, Server::new(id, spec, self.options.clone()));
                    report.added.push(label);
                }
            }
        }

        if !report.added.is_empty() || !report.removed.is_empty() || !report.reweighted.is_empty()
        {
            self.rebuild_ring();
            report.ring_rebuilt = true;
        }
        Ok(report)
    }

    fn rebuild_ring(&mut self) {
        let mut members: Vec<(ServerId, &ServerSpec)> = self
            .servers
            .values()
            .map(|server| (server.id, &server.spec))
            .collect();
        members.sort_by_key(|(id, _)| *id);
        let ring = HashRing::build(members, self.points_per_weight);
        debug!(
            "Rebuilt ring: {} servers, {} points",
            self.servers.len(),
            ring.len()
        );
        self.ring = Arc::new(ring);
    }

    /// Ring owner of `key`, whatever its state
    pub fn route(&self, key: &[u8]) -> MemringResult<ServerId> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }
        self.ring
            .lookup(key)
            .ok_or_else(|| MemringError::Config(ConfigError::NoServers))
    }

    /// First server clockwise from `key` that is up
    pub fn route_live(&self, key: &[u8]) -> MemringResult<ServerId> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }
        self.ring
            .lookup_with(key, |id| {
                self.servers
                    .get(&id)
                    .map_or(false, |server| server.liveness.is_up())
            })
            .ok_or_else(|| MemringError::Config(ConfigError::AllServersDown))
    }

    /// Record a failure; returns the backoff before the next probe
    pub fn mark_failed(&mut self, id: ServerId, now: Instant) -> Option<Duration> {
        let backoff = self.backoff;
        let server = self.servers.get_mut(&id)?;
        if server.state() == ServerState::Down {
            return None;
        }
        let delay = server.liveness.mark_failed(now, &backoff);
        warn!(
            "Server {} marked down ({} consecutive failures), next probe in {:?}",
            server.label(),
            server.liveness.consecutive_failures(),
            delay
        );
        Some(delay)
    }

    pub fn mark_recovered(&mut self, id: ServerId) {
        if let Some(server) = self.servers.get_mut(&id) {
            if server.state() != ServerState::Up {
                info!("Server {} is back up", server.label());
            }
            server.liveness.mark_recovered();
        }
    }

    /// Start reconnecting to down servers whose backoff has elapsed
    pub fn start_due_probes(&mut self, now: Instant) -> Vec<ServerId> {
        let mut probed = Vec::new();
        for server in self.servers.values_mut() {
            if server.liveness.probe_due(now) {
                debug!("Probing server {}", server.label());
                server.liveness.begin_probe();
                server.counters.reconnects += 1;
                server.connection.connect(now);
                probed.push(server.id);
            }
        }
        probed
    }

    /// Earliest connection deadline, or probe time when `probes` is set
    pub fn next_deadline(&self, probes: bool) -> Option<Instant> {
        self.servers
            .values()
            .flat_map(|server| {
                let probe = match server.state() {
                    ServerState::Down if probes => server.liveness.retry_at(),
                    _ => None,
                };
                server.connection.next_deadline().into_iter().chain(probe)
            })
            .min()
    }

    /// Per-server snapshot, ordered by server id
    pub fn stats(&self) -> Vec<ServerStats> {
        let mut stats: Vec<ServerStats> = self
            .servers
            .values()
            .map(|server| server.stats(self.ring.points_for(server.id)))
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }
}
