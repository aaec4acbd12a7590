//! Caller-facing API
//!
//! [`Client`] is a cheap, cloneable handle onto a running dispatcher. Raw
//! commands go through [`Client::submit`] / [`Client::execute`]; the typed
//! helpers below map server statuses onto [`MemringError`] variants.
use crate::core::{CommandId, ConfigureReport, QueuedCommand, ServerSpec, ServerStats};
use crate::dispatcher::Message;
use crate::error::{MemringError, MemringResult};
use crate::protocol::{Command, Response, DELTA_NO_ADD};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Pending result of a submitted command
///
/// Await it from async code or call [`CommandHandle::wait_blocking`] from a
/// thread outside the runtime. Dropping the handle abandons the result.
#[derive(Debug)]
pub struct CommandHandle {
    id: CommandId,
    rx: oneshot::Receiver<MemringResult<Response>>,
}

impl CommandHandle {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Block the current thread until the command completes
    ///
    /// Panics when called from within an async execution context.
    pub fn wait_blocking(self) -> MemringResult<Response> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(MemringError::Cancelled))
    }
}

impl Future for CommandHandle {
    type Output = MemringResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(MemringError::Cancelled)))
    }
}

/// Value and metadata of a stored item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// Expiration, flags and CAS guard of a storage command
///
/// A non-zero `cas` makes the store conditional: it fails with `KeyExists`
/// when the item changed since that CAS was read, and with `NotFound` when
/// the item is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub expiration: u32,
    pub flags: u32,
    pub cas: u64,
}

impl StoreOptions {
    pub fn expiring(expiration: u32) -> Self {
        Self {
            expiration,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    sender: mpsc::UnboundedSender<Message>,
    next_id: Arc<AtomicU64>,
    command_timeout: Duration,
}

impl Client {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Message>, command_timeout: Duration) -> Self {
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
            command_timeout,
        }
    }

    /// Queue a command without waiting for it
    pub fn submit(&self, command: Command) -> CommandHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let budget = command.timeout.unwrap_or(self.command_timeout);
        // a stopped dispatcher drops the message, which reads as Cancelled
        let _ = self
            .sender
            .send(Message::Submit(QueuedCommand::new(id, command, budget, tx)));
        CommandHandle { id, rx }
    }

    pub async fn execute(&self, command: Command) -> MemringResult<Response> {
        self.submit(command).await
    }

    /// Submit and block until completion; must not be called from async code
    pub fn execute_blocking(&self, command: Command) -> MemringResult<Response> {
        self.submit(command).wait_blocking()
    }

    /// Cancel a submitted command; its handle resolves to `Cancelled`
    pub fn cancel(&self, handle: &CommandHandle) {
        let _ = self.sender.send(Message::Cancel(handle.id));
    }

    pub async fn stats(&self) -> MemringResult<Vec<ServerStats>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::Stats(tx))
            .map_err(|_| MemringError::Cancelled)?;
        rx.await.map_err(|_| MemringError::Cancelled)
    }

    /// Replace the server list at runtime
    pub async fn configure(&self, servers: Vec<ServerSpec>) -> MemringResult<ConfigureReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::Configure(servers, tx))
            .map_err(|_| MemringError::Cancelled)?;
        rx.await.map_err(|_| MemringError::Cancelled)?
    }

    /// Ask the dispatcher to finish in-flight work and exit
    pub fn stop(&self) {
        let _ = self.sender.send(Message::Stop);
    }

    /// The dispatcher has exited
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn run(&self, command: Command) -> MemringResult<Response> {
        self.execute(command).await?.into_result()
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> MemringResult<Option<Bytes>> {
        Ok(self.get_item(key).await?.map(|item| item.value))
    }

    /// Like `get`, also returning flags and CAS
    pub async fn get_item(&self, key: impl Into<Bytes>) -> MemringResult<Option<Item>> {
        match self.run(Command::get(key)).await {
            Ok(response) => Ok(Some(Item {
                value: response.value,
                flags: response.flags,
                cas: response.cas,
            })),
            Err(MemringError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store unconditionally; returns the new CAS
    pub async fn set(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: u32,
    ) -> MemringResult<u64> {
        self.set_with(key, value, StoreOptions::expiring(expiration)).await
    }

    /// `set` with flags and an optional CAS guard
    pub async fn set_with(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        options: StoreOptions,
    ) -> MemringResult<u64> {
        self.store(Command::set(key, value), options).await
    }

    /// Store only if the key is absent; fails with `KeyExists` otherwise
    pub async fn add(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: u32,
    ) -> MemringResult<u64> {
        self.add_with(key, value, StoreOptions::expiring(expiration)).await
    }

    pub async fn add_with(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        options: StoreOptions,
    ) -> MemringResult<u64> {
        self.store(Command::add(key, value), options).await
    }

    /// Store only if the key exists; fails with `NotFound` otherwise
    pub async fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: u32,
    ) -> MemringResult<u64> {
        self.replace_with(key, value, StoreOptions::expiring(expiration)).await
    }

    pub async fn replace_with(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        options: StoreOptions,
    ) -> MemringResult<u64> {
        self.store(Command::replace(key, value), options).await
    }

    async fn store(&self, command: Command, options: StoreOptions) -> MemringResult<u64> {
        let command = command
            .with_expiration(options.expiration)
            .with_flags(options.flags)
            .with_cas(options.cas);
        Ok(self.run(command).await?.cas)
    }

    pub async fn append(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> MemringResult<()> {
        self.run(Command::append(key, value)).await.map(|_| ())
    }

    pub async fn prepend(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> MemringResult<()> {
        self.run(Command::prepend(key, value)).await.map(|_| ())
    }

    /// Returns false when the key did not exist
    pub async fn delete(&self, key: impl Into<Bytes>) -> MemringResult<bool> {
        match self.run(Command::delete(key)).await {
            Ok(_) => Ok(true),
            Err(MemringError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns false when the key did not exist
    pub async fn touch(&self, key: impl Into<Bytes>, expiration: u32) -> MemringResult<bool> {
        match self.run(Command::touch(key, expiration)).await {
            Ok(_) => Ok(true),
            Err(MemringError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Add `delta` to a counter; `initial` creates a missing key, `None` fails with `NotFound`
    pub async fn increment(
        &self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: Option<u64>,
    ) -> MemringResult<u64> {
        let command = arithmetic(Command::increment(key, delta, initial.unwrap_or(0)), initial);
        counter_value(self.run(command).await?)
    }

    /// Subtract `delta` from a counter, saturating at zero server-side
    pub async fn decrement(
        &self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: Option<u64>,
    ) -> MemringResult<u64> {
        let command = arithmetic(Command::decrement(key, delta, initial.unwrap_or(0)), initial);
        counter_value(self.run(command).await?)
    }

    pub async fn noop(&self, server: impl Into<String>) -> MemringResult<()> {
        self.run(Command::noop(server)).await.map(|_| ())
    }

    pub async fn version(&self, server: impl Into<String>) -> MemringResult<String> {
        let response = self.run(Command::version(server)).await?;
        Ok(String::from_utf8_lossy(&response.value).into_owned())
    }

    /// Server statistics as reported by the STAT command
    pub async fn stat(
        &self,
        server: impl Into<String>,
        group: Option<&str>,
    ) -> MemringResult<Vec<(String, String)>> {
        Ok(self.run(Command::stat(server, group)).await?.stats)
    }

    /// Flush every configured server
    pub async fn flush_all(&self, expiration: u32) -> MemringResult<()> {
        let handles: Vec<CommandHandle> = self
            .stats()
            .await?
            .into_iter()
            .map(|server| self.submit(Command::flush(server.address, expiration)))
            .collect();
        for handle in handles {
            handle.await?.into_result()?;
        }
        Ok(())
    }
}

fn arithmetic(command: Command, initial: Option<u64>) -> Command {
    match initial {
        Some(_) => command,
        None => command.with_expiration(DELTA_NO_ADD),
    }
}

fn counter_value(response: Response) -> MemringResult<u64> {
    response
        .counter()
        .ok_or_else(|| MemringError::protocol("counter reply must carry an 8-byte value"))
}
