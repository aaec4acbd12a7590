//! Event loop driving every server connection
//!
//! The dispatcher runs as a single task that owns the server pool. Callers
//! talk to it through [`Client`] over an unbounded channel. Each tick waits
//! for a message, socket readiness or the next deadline, then flushes,
//! reads, sweeps deadlines, starts due probes and finally settles the
//! resulting events (completions, failures, server state changes).
pub mod retry;

pub use retry::{RetryDecision, RetryPolicy};

use crate::client::Client;
use crate::config::Config;
use crate::core::{
    CommandId, ConfigureReport, ConnEvent, QueuedCommand, ServerId, ServerPool, ServerSpec,
    ServerStats, Wakeup,
};
use crate::error::{ConfigError, MemringError, MemringResult};
use crate::health::ServerState;
use crate::protocol::Routing;
use fnv::FnvHashMap;
use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Messages accepted per tick before socket work resumes
const MAX_MESSAGES_PER_TICK: usize = 1024;

/// Requests sent from clients to the event loop
#[derive(Debug)]
pub enum Message {
    Submit(QueuedCommand),
    Cancel(CommandId),
    Configure(
        Vec<ServerSpec>,
        oneshot::Sender<MemringResult<ConfigureReport>>,
    ),
    Stats(oneshot::Sender<Vec<ServerStats>>),
    Stop,
}

/// What ended a wait
enum Trigger {
    Message(Option<Message>),
    Wakeup(Wakeup),
    Timer,
}

pub struct Dispatcher {
    pool: ServerPool,
    retry: RetryPolicy,
    requests: mpsc::UnboundedReceiver<Message>,
    requests_closed: bool,
    stopping: bool,
    /// Server each queued command currently sits on
    locations: FnvHashMap<CommandId, ServerId>,
    events: Vec<ConnEvent>,
}

impl Dispatcher {
    /// Build a dispatcher for `config` and the client connected to it
    pub fn new(config: &Config) -> MemringResult<(Self, Client)> {
        config.validate_settings()?;
        let retry = RetryPolicy::new(config.max_retries, config.backoff());
        let mut pool = ServerPool::new(
            config.ring_points_per_weight,
            retry.backoff(),
            config.connection_options(),
        );

        let mut events = Vec::new();
        pool.configure(config.server_specs()?, &mut events)?;

        let (sender, requests) = mpsc::unbounded_channel();
        let dispatcher = Self {
            pool,
            retry,
            requests,
            requests_closed: false,
            stopping: false,
            locations: FnvHashMap::default(),
            events,
        };
        Ok((dispatcher, Client::new(sender, config.command_timeout())))
    }

    /// Run the event loop on the current tokio runtime
    pub fn spawn(config: &Config) -> MemringResult<(Client, JoinHandle<()>)> {
        let (dispatcher, client) = Self::new(config)?;
        Ok((client, tokio::spawn(dispatcher.run())))
    }

    /// Run the event loop on a dedicated thread for blocking callers
    pub fn spawn_thread(config: &Config) -> MemringResult<(Client, std::thread::JoinHandle<()>)> {
        let (dispatcher, client) = Self::new(config)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MemringError::Runtime(format!("cannot build runtime: {}", e)))?;
        let handle = std::thread::Builder::new()
            .name("memring-dispatcher".to_string())
            .spawn(move || runtime.block_on(dispatcher.run()))
            .map_err(|e| MemringError::Runtime(format!("cannot spawn dispatcher thread: {}", e)))?;
        Ok((client, handle))
    }

    /// Drive connections until stopped
    ///
    /// The loop ends after a stop request (or once every client is gone)
    /// when no written command is still waiting for its response.
    pub async fn run(mut self) {
        info!("Dispatcher started with {} servers", self.pool.len());
        self.connect_idle(Instant::now());

        loop {
            if self.stopping && self.is_drained() {
                break;
            }

            let deadline = self.pool.next_deadline(!self.stopping);
            let accept_messages = !self.requests_closed;
            let trigger = tokio::select! {
                message = self.requests.recv(), if accept_messages => Trigger::Message(message),
                wakeup = next_wakeup(&mut self.pool) => Trigger::Wakeup(wakeup),
                _ = sleep_until(deadline) => Trigger::Timer,
            };
            self.tick(trigger);
        }

        info!("Dispatcher stopped");
    }

    fn tick(&mut self, trigger: Trigger) {
        let now = Instant::now();
        match trigger {
            Trigger::Message(Some(message)) => {
                self.handle_message(message, now);
                self.receive_backlog(now);
            }
            Trigger::Message(None) => {
                debug!("All clients dropped");
                self.requests_closed = true;
                self.begin_stop();
            }
            Trigger::Wakeup(Wakeup::Connected(id, result)) => {
                if let Some(server) = self.pool.get_mut(id) {
                    server.connection.on_connected(result, &mut self.events);
                }
            }
            Trigger::Wakeup(Wakeup::Ready(id, Err(e))) => {
                if let Some(server) = self.pool.get_mut(id) {
                    let reason = format!("poll failed: {}", e);
                    server.connection.drain(&reason, true, &mut self.events);
                }
            }
            Trigger::Wakeup(Wakeup::Ready(_, Ok(()))) | Trigger::Timer => {}
        }

        for server in self.pool.servers_mut() {
            server.connection.flush(&mut self.events);
        }
        for server in self.pool.servers_mut() {
            server.connection.ingest(&mut self.events);
        }

        let now = Instant::now();
        for server in self.pool.servers_mut() {
            server.connection.sweep(now, &mut self.events);
        }
        if !self.stopping {
            self.pool.start_due_probes(now);
        }

        self.settle(now);
    }

    /// Handle messages that queued up behind the one that woke us
    fn receive_backlog(&mut self, now: Instant) {
        for _ in 0..MAX_MESSAGES_PER_TICK {
            match self.requests.try_recv() {
                Ok(message) => self.handle_message(message, now),
                Err(_) => return,
            }
        }
    }

    fn handle_message(&mut self, message: Message, now: Instant) {
        match message {
            Message::Submit(queued) => self.submit(queued, now),
            Message::Cancel(id) => self.cancel(id),
            Message::Configure(specs, reply) => {
                let result = self.pool.configure(specs, &mut self.events);
                if let Ok(report) = &result {
                    info!(
                        "Reconfigured pool: {} added, {} removed, {} reweighted",
                        report.added.len(),
                        report.removed.len(),
                        report.reweighted.len()
                    );
                    self.connect_idle(now);
                }
                let _ = reply.send(result);
            }
            Message::Stats(reply) => {
                let _ = reply.send(self.pool.stats());
            }
            Message::Stop => self.begin_stop(),
        }
    }

    fn submit(&mut self, queued: QueuedCommand, now: Instant) {
        if self.stopping {
            queued.complete(Err(MemringError::Cancelled));
            return;
        }
        if let Err(e) = queued.command.validate() {
            queued.complete(Err(e));
            return;
        }
        self.route(queued, false, now);
    }

    /// Place a command on its target connection
    ///
    /// First attempts go to the ring owner; retries skip servers that are
    /// not up. A target that is not up fails the attempt immediately.
    fn route(&mut self, queued: QueuedCommand, retry: bool, now: Instant) {
        let target = match &queued.command.routing {
            Routing::Server(label) => self.pool.find(label).ok_or_else(|| {
                MemringError::invalid_command(format!("unknown server {}", label))
            }),
            Routing::Key if retry => self.pool.route_live(&queued.command.key),
            Routing::Key => self.pool.route(&queued.command.key),
        };
        let id = match target {
            Ok(id) => id,
            Err(e) => {
                queued.complete(Err(e));
                return;
            }
        };
        let Some(server) = self.pool.get_mut(id) else {
            queued.complete(Err(ConfigError::NoServers.into()));
            return;
        };

        server.counters.submitted += 1;
        if server.state() != ServerState::Up {
            let error =
                MemringError::connection(server.label(), format!("server is {}", server.state()));
            self.events.push(ConnEvent::Failed(id, queued, error));
            return;
        }

        server.connection.connect(now);
        self.locations.insert(queued.id, id);
        server.connection.enqueue(queued);
    }

    fn cancel(&mut self, id: CommandId) {
        let Some(server_id) = self.locations.remove(&id) else {
            return;
        };
        if let Some(server) = self.pool.get_mut(server_id) {
            if let Some(queued) = server.connection.cancel(id) {
                debug!("Cancelled command {} on {}", id, server.label());
                server.counters.cancelled += 1;
                queued.complete(Err(MemringError::Cancelled));
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("Dispatcher stopping");
        for server in self.pool.servers_mut() {
            for queued in server.connection.take_pending() {
                self.locations.remove(&queued.id);
                server.counters.cancelled += 1;
                queued.complete(Err(MemringError::Cancelled));
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.events.is_empty() && self.pool.servers().all(|s| s.connection.is_idle())
    }

    /// Connect every up server that has no connection
    fn connect_idle(&mut self, now: Instant) {
        for server in self.pool.servers_mut() {
            if server.liveness.is_up() {
                server.connection.connect(now);
            }
        }
    }

    /// Apply collected events until none are left
    ///
    /// Server state changes go first so that rerouted commands already see
    /// servers that just failed as down.
    fn settle(&mut self, now: Instant) {
        while !self.events.is_empty() {
            let events = std::mem::take(&mut self.events);
            let mut outcomes = Vec::with_capacity(events.len());
            for event in events {
                match event {
                    ConnEvent::Ready(id) => self.pool.mark_recovered(id),
                    ConnEvent::Closed {
                        server,
                        reason,
                        mark_down,
                    } => {
                        if mark_down {
                            self.pool.mark_failed(server, now);
                        } else {
                            debug!("Connection to server {} closed: {}", server, reason);
                        }
                    }
                    outcome => outcomes.push(outcome),
                }
            }

            for outcome in outcomes {
                match outcome {
                    ConnEvent::Completed(id, queued, response) => {
                        self.locations.remove(&queued.id);
                        if let Some(server) = self.pool.get_mut(id) {
                            server.counters.completed += 1;
                        }
                        queued.complete(Ok(response));
                    }
                    ConnEvent::Failed(id, queued, error) => self.fail(id, queued, error, now),
                    _ => {}
                }
            }
        }
    }

    fn fail(&mut self, id: ServerId, mut queued: QueuedCommand, error: MemringError, now: Instant) {
        self.locations.remove(&queued.id);
        if let Some(server) = self.pool.get_mut(id) {
            if matches!(error, MemringError::Timeout { .. }) {
                server.counters.timeouts += 1;
            } else {
                server.counters.failed += 1;
            }
        }

        match self.retry.decide(&queued, &error, self.stopping) {
            RetryDecision::Retry => {
                queued.next_attempt(now);
                debug!(
                    "Retrying {} (attempt {}/{}): {}",
                    queued.command.describe(),
                    queued.retries,
                    self.retry.max_retries(),
                    error
                );
                self.route(queued, true, now);
            }
            RetryDecision::Fail => {
                error.log(&format!("{} failed", queued.command.describe()));
                queued.complete(Err(error));
            }
        }
    }
}

/// Wait until any connection needs attention
async fn next_wakeup(pool: &mut ServerPool) -> Wakeup {
    let mut waits: FuturesUnordered<_> = pool
        .servers_mut()
        .filter_map(|server| server.connection.wait())
        .collect();
    match waits.next().await {
        Some(wakeup) => wakeup,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("servers", &self.pool.len())
            .field("queued", &self.locations.len())
            .field("stopping", &self.stopping)
            .finish()
    }
}
