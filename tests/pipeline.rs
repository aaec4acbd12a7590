//! End-to-end command pipelining against a mock server

use memring::config::Credentials;
use memring::{Command, Config, Dispatcher, MemringError, ServerState, StoreOptions};
use std::time::Duration;

mod common;
use common::MockServer;

fn config_for(servers: &[&MockServer]) -> Config {
    let mut config = Config::with_servers(servers.iter().map(|s| s.label()));
    config.command_timeout_ms = 500;
    config.connect_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_typed_operations() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();

    let cas = client.set("greeting", "hello", 0).await.unwrap();
    assert!(cas > 0);
    assert_eq!(
        client.get("greeting").await.unwrap().as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(client.get("missing").await.unwrap(), None);

    assert!(matches!(
        client.add("greeting", "again", 0).await,
        Err(MemringError::KeyExists)
    ));
    assert!(matches!(
        client.replace("missing", "x", 0).await,
        Err(MemringError::NotFound)
    ));

    client.append("greeting", " world").await.unwrap();
    client.prepend("greeting", ">> ").await.unwrap();
    let item = client.get_item("greeting").await.unwrap().unwrap();
    assert_eq!(&item.value[..], b">> hello world");

    assert!(client.touch("greeting", 60).await.unwrap());
    assert!(client.delete("greeting").await.unwrap());
    assert!(!client.delete("greeting").await.unwrap());
    assert!(!client.touch("greeting", 60).await.unwrap());

    assert_eq!(client.increment("hits", 5, Some(10)).await.unwrap(), 10);
    assert_eq!(client.increment("hits", 5, None).await.unwrap(), 15);
    assert_eq!(client.decrement("hits", 20, None).await.unwrap(), 0);
    assert!(matches!(
        client.increment("nohits", 1, None).await,
        Err(MemringError::NotFound)
    ));

    client.noop(server.label()).await.unwrap();
    assert_eq!(client.version(server.label()).await.unwrap(), "1.6.0-mock");
    let stats = client.stat(server.label(), None).await.unwrap();
    assert!(stats.iter().any(|(name, _)| name == "curr_items"));

    client.flush_all(0).await.unwrap();
    assert_eq!(client.get("hits").await.unwrap(), None);

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_flags_and_cas_guard() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();

    let options = StoreOptions::expiring(300).with_flags(0xcafe);
    let first = client.set_with("doc", "v1", options).await.unwrap();
    let item = client.get_item("doc").await.unwrap().unwrap();
    assert_eq!(item.flags, 0xcafe);
    assert_eq!(item.cas, first);

    // another writer bumps the CAS
    let second = client.set("doc", "v2", 0).await.unwrap();
    assert_ne!(second, first);

    let stale = StoreOptions::default().with_cas(first);
    assert!(matches!(
        client.set_with("doc", "lost update", stale).await,
        Err(MemringError::KeyExists)
    ));
    let fresh = StoreOptions::default().with_flags(7).with_cas(second);
    client.replace_with("doc", "v3", fresh).await.unwrap();

    let item = client.get_item("doc").await.unwrap().unwrap();
    assert_eq!(&item.value[..], b"v3");
    assert_eq!(item.flags, 7);

    assert!(matches!(
        client.set_with("gone", "x", StoreOptions::default().with_cas(1)).await,
        Err(MemringError::NotFound)
    ));

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_pipelined_responses_match_requests() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();

    let sets: Vec<_> = (0..200)
        .map(|i| client.submit(Command::set(format!("key:{}", i), format!("value:{}", i))))
        .collect();
    let gets: Vec<_> = (0..200)
        .map(|i| client.submit(Command::get(format!("key:{}", i))))
        .collect();

    for set in sets {
        assert!(set.await.unwrap().is_success());
    }
    for (i, get) in gets.into_iter().enumerate() {
        let response = get.await.unwrap();
        assert_eq!(response.value, format!("value:{}", i).into_bytes());
    }

    let stats = client.stats().await.unwrap();
    assert_eq!(stats[0].counters.completed, 400);
    assert_eq!(stats[0].io.frames_received, 401, "400 replies plus the handshake");

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_large_values_survive_partial_io() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();

    let value: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    client.set("blob", value.clone(), 0).await.unwrap();
    let fetched = client.get("blob").await.unwrap().unwrap();
    assert_eq!(fetched.len(), value.len());
    assert_eq!(&fetched[..], &value[..]);

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_timeout_drains_but_keeps_server_up() {
    let server = MockServer::start().await;
    let mut config = config_for(&[&server]);
    config.max_retries = 0;
    config.command_timeout_ms = 200;
    let (client, handle) = Dispatcher::spawn(&config).unwrap();

    client.set("k", "v", 0).await.unwrap();
    server.set_stalled(true);

    let result = client.get("k").await;
    assert!(matches!(result, Err(MemringError::Timeout { .. })));

    let stats = client.stats().await.unwrap();
    assert_eq!(stats[0].state, ServerState::Up);
    assert_eq!(stats[0].counters.timeouts, 1);
    assert_eq!(stats[0].io.drains, 1);

    // the late reply never surfaces; a fresh connection serves new commands
    server.set_stalled(false);
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
    assert_eq!(client.stats().await.unwrap()[0].io.connects, 2);

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_per_command_timeout_override() {
    let server = MockServer::start().await;
    let mut config = config_for(&[&server]);
    config.max_retries = 0;
    config.command_timeout_ms = 10_000;
    let (client, handle) = Dispatcher::spawn(&config).unwrap();

    client.noop(server.label()).await.unwrap();
    server.set_stalled(true);
    let started = std::time::Instant::now();
    let result = client
        .execute(Command::get("k").with_timeout(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(MemringError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_in_flight_command() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();

    client.noop(server.label()).await.unwrap();
    server.set_stalled(true);
    // handshakes and NOOP are not counted as requests
    let pending = client.submit(Command::get("k"));
    server.wait_for_requests(1).await;
    client.cancel(&pending);
    assert!(matches!(pending.await, Err(MemringError::Cancelled)));

    client.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_written_commands() {
    let server = MockServer::start().await;
    let (client, handle) = Dispatcher::spawn(&config_for(&[&server])).unwrap();
    client.set("k", "v", 0).await.unwrap();

    let in_flight = client.submit(Command::get("k"));
    server.wait_for_requests(2).await;
    client.stop();

    assert_eq!(&in_flight.await.unwrap().value[..], b"v");
    handle.await.unwrap();
    assert!(matches!(
        client.execute(Command::get("k")).await,
        Err(MemringError::Cancelled)
    ));
}

#[tokio::test]
async fn test_stop_cancels_unwritten_commands() {
    // accepts connections but never answers the handshake
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let label = listener.local_addr().unwrap().to_string();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut config = Config::with_servers([label]);
    config.connect_timeout_ms = 10_000;
    config.command_timeout_ms = 10_000;
    let (client, handle) = Dispatcher::spawn(&config).unwrap();

    let queued = client.submit(Command::get("k"));
    let stats = client.stats().await.unwrap();
    assert_eq!(stats[0].pending, 1, "the command waits for the handshake");

    client.stop();
    assert!(matches!(queued.await, Err(MemringError::Cancelled)));
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    silent.abort();
}

#[tokio::test]
async fn test_sasl_credentials() {
    let server = MockServer::start().await;
    server.require_auth("app", "secret");

    let mut config = config_for(&[&server]);
    config.credentials = Some(Credentials {
        username: "app".to_string(),
        password: "secret".to_string(),
    });
    let (client, handle) = Dispatcher::spawn(&config).unwrap();
    client.set("k", "v", 0).await.unwrap();
    client.stop();
    handle.await.unwrap();

    let mut config = config_for(&[&server]);
    config.max_retries = 0;
    config.credentials = Some(Credentials {
        username: "app".to_string(),
        password: "wrong".to_string(),
    });
    let (client, handle) = Dispatcher::spawn(&config).unwrap();
    assert!(matches!(
        client.set("k", "v", 0).await,
        Err(MemringError::Connection { .. })
    ));
    client.stop();
    handle.await.unwrap();
}

#[test]
fn test_blocking_api_from_plain_thread() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(MockServer::start());

    let (client, thread) = Dispatcher::spawn_thread(&config_for(&[&server])).unwrap();
    let response = client
        .execute_blocking(Command::set("k", "blocking"))
        .unwrap();
    assert!(response.is_success());
    let response = client.execute_blocking(Command::get("k")).unwrap();
    assert_eq!(&response.value[..], b"blocking");

    client.stop();
    thread.join().unwrap();
    drop(server);
}
