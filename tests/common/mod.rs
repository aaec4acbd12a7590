#![allow(dead_code)]
// In-process memcached stand-in speaking the binary protocol

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memring::protocol::{Frame, FrameCodec, Opcode, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Shared {
    store: Mutex<HashMap<Vec<u8>, (Bytes, u32, u64)>>,
    next_cas: AtomicU64,
    /// Requests received, handshakes excluded
    requests: AtomicU64,
    /// Swallow requests without replying (handshakes still answered)
    stalled: AtomicBool,
    /// Expected SASL PLAIN payload, if authentication is required
    credentials: Mutex<Option<Vec<u8>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_listener(listener)
    }

    /// Start on a fixed address, e.g. to bring a killed server back
    pub async fn start_on(addr: SocketAddr) -> Self {
        for _ in 0..100 {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Self::serve_listener(listener),
                // the old listener may not be closed yet
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("cannot bind mock server to {}", addr);
    }

    fn serve_listener(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_shared = Arc::clone(&accept_shared);
                let task = tokio::spawn(serve(stream, conn_shared));
                accept_shared.tasks.lock().unwrap().push(task);
            }
        });
        shared.tasks.lock().unwrap().push(accept);

        Self { addr, shared }
    }

    /// `host:port` label as used by the client
    pub fn label(&self) -> String {
        self.addr.to_string()
    }

    pub fn require_auth(&self, username: &str, password: &str) {
        let payload = format!("\0{}\0{}", username, password).into_bytes();
        *self.shared.credentials.lock().unwrap() = Some(payload);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u64 {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.store.lock().unwrap().contains_key(key.as_bytes())
    }

    /// Wait until at least `count` requests arrived
    pub async fn wait_for_requests(&self, count: u64) {
        for _ in 0..500 {
            if self.requests() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock server saw {} requests, wanted {}", self.requests(), count);
    }

    /// Close the listener and every open connection
    pub fn kill(&self) {
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut out = BytesMut::new();
        loop {
            let frame = match FrameCodec::decode_buf(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            for reply in handle(&shared, frame) {
                FrameCodec::encode_into(&mut out, &reply).unwrap();
            }
        }
        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn reply(request: &Frame, status: Status) -> Frame {
    let mut frame = Frame::response(request.opcode, status.as_u16(), request.opaque);
    if !status.is_success() {
        frame.value = Bytes::from(status.to_string());
    }
    frame
}

fn handle(shared: &Shared, request: Frame) -> Vec<Frame> {
    let opcode = Opcode::from_u8(request.opcode);
    match opcode {
        Some(Opcode::Noop) => return vec![reply(&request, Status::NoError)],
        Some(Opcode::SaslAuth) => {
            let expected = shared.credentials.lock().unwrap().clone();
            let status = match expected {
                Some(payload) if payload[..] != request.value[..] => Status::AuthError,
                _ => Status::NoError,
            };
            return vec![reply(&request, status)];
        }
        _ => {}
    }

    shared.requests.fetch_add(1, Ordering::SeqCst);
    if shared.stalled.load(Ordering::SeqCst) {
        return Vec::new();
    }

    let mut store = shared.store.lock().unwrap();
    let key = request.key.to_vec();
    let next_cas = || shared.next_cas.fetch_add(1, Ordering::SeqCst) + 1;

    match opcode {
        Some(Opcode::Get) | Some(Opcode::GetK) => match store.get(&key) {
            Some((value, flags, cas)) => {
                let mut frame = reply(&request, Status::NoError);
                frame.extras = Bytes::copy_from_slice(&flags.to_be_bytes());
                frame.value = value.clone();
                frame.cas = *cas;
                if opcode == Some(Opcode::GetK) {
                    frame.key = request.key.clone();
                }
                vec![frame]
            }
            None => vec![reply(&request, Status::KeyNotFound)],
        },
        Some(op @ (Opcode::Set | Opcode::Add | Opcode::Replace)) => {
            let exists = store.contains_key(&key);
            if op == Opcode::Add && exists {
                return vec![reply(&request, Status::KeyExists)];
            }
            if op == Opcode::Replace && !exists {
                return vec![reply(&request, Status::KeyNotFound)];
            }
            if request.cas != 0 {
                match store.get(&key) {
                    None => return vec![reply(&request, Status::KeyNotFound)],
                    Some((_, _, current)) if *current != request.cas => {
                        return vec![reply(&request, Status::KeyExists)]
                    }
                    Some(_) => {}
                }
            }
            let flags = (&request.extras[..4]).get_u32();
            let cas = next_cas();
            store.insert(key, (request.value.clone(), flags, cas));
            let mut frame = reply(&request, Status::NoError);
            frame.cas = cas;
            vec![frame]
        }
        Some(op @ (Opcode::Append | Opcode::Prepend)) => match store.get_mut(&key) {
            Some((value, _, cas)) => {
                let mut joined = BytesMut::new();
                if op == Opcode::Append {
                    joined.put_slice(value);
                    joined.put_slice(&request.value);
                } else {
                    joined.put_slice(&request.value);
                    joined.put_slice(value);
                }
                *value = joined.freeze();
                *cas = next_cas();
                vec![reply(&request, Status::NoError)]
            }
            None => vec![reply(&request, Status::ItemNotStored)],
        },
        Some(Opcode::Delete) => match store.remove(&key) {
            Some(_) => vec![reply(&request, Status::NoError)],
            None => vec![reply(&request, Status::KeyNotFound)],
        },
        Some(Opcode::Touch) => match store.contains_key(&key) {
            true => vec![reply(&request, Status::NoError)],
            false => vec![reply(&request, Status::KeyNotFound)],
        },
        Some(op @ (Opcode::Increment | Opcode::Decrement)) => {
            let mut extras = &request.extras[..];
            let delta = extras.get_u64();
            let initial = extras.get_u64();
            let expiration = extras.get_u32();

            let current = match store.get(&key) {
                Some((value, _, _)) => {
                    match std::str::from_utf8(value).ok().and_then(|s| s.parse::<u64>().ok()) {
                        Some(number) => Some(number),
                        None => return vec![reply(&request, Status::NonNumeric)],
                    }
                }
                None => None,
            };
            let next = match current {
                Some(number) if op == Opcode::Increment => number.wrapping_add(delta),
                Some(number) => number.saturating_sub(delta),
                None if expiration == u32::MAX => {
                    return vec![reply(&request, Status::KeyNotFound)]
                }
                None => initial,
            };
            let cas = next_cas();
            store.insert(key, (Bytes::from(next.to_string()), 0, cas));
            let mut frame = reply(&request, Status::NoError);
            frame.value = Bytes::copy_from_slice(&next.to_be_bytes());
            frame.cas = cas;
            vec![frame]
        }
        Some(Opcode::Version) => {
            let mut frame = reply(&request, Status::NoError);
            frame.value = Bytes::from_static(b"1.6.0-mock");
            vec![frame]
        }
        Some(Opcode::Stat) => {
            let entries = [
                ("pid".to_string(), std::process::id().to_string()),
                ("curr_items".to_string(), store.len().to_string()),
            ];
            let mut frames: Vec<Frame> = entries
                .iter()
                .map(|(name, value)| {
                    let mut frame = reply(&request, Status::NoError);
                    frame.key = Bytes::from(name.clone());
                    frame.value = Bytes::from(value.clone());
                    frame
                })
                .collect();
            frames.push(reply(&request, Status::NoError));
            frames
        }
        Some(Opcode::Flush) => {
            store.clear();
            vec![reply(&request, Status::NoError)]
        }
        _ => vec![reply(&request, Status::UnknownCommand)],
    }
}
