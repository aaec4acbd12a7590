//! memring - pipelining client for memcached-style binary protocol clusters
//!
//! Keys are spread over servers with a weighted consistent hash ring. Every
//! server gets one pipelined connection; a single event loop drives all of
//! them, matches responses to requests, applies deadlines and reroutes
//! commands away from failed servers.
//!
//! ```no_run
//! use memring::{Config, Dispatcher};
//!
//! # async fn demo() -> memring::MemringResult<()> {
//! let config = Config::with_servers(["10.0.0.1:11211", "10.0.0.2:11211"]);
//! let (client, handle) = Dispatcher::spawn(&config)?;
//!
//! client.set("greeting", "hello", 0).await?;
//! assert_eq!(client.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
//!
//! client.stop();
//! let _ = handle.await;
//! # Ok(())
//! # }
//! ```
pub mod client;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod protocol;
pub mod utils;

pub use client::{Client, CommandHandle, Item, StoreOptions};
pub use config::Config;
pub use core::{ConfigureReport, HashRing, ServerSpec, ServerStats};
pub use dispatcher::{Dispatcher, RetryPolicy};
pub use error::{ConfigError, MemringError, MemringResult};
pub use health::ServerState;
pub use protocol::{Command, Opcode, Response, Routing, Status};
