// tests/integration/fixtures.rs

//! Test fixtures: an in-process mock store speaking the RESP wire protocol,
//! with an in-memory keyspace, TTLs, lists, pub/sub channels, and counters
//! for observing connection and probe behavior.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use storelink::config::ConnectionDescriptor;
use storelink::core::protocol::{WireCodec, WireFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use wildmatch::WildMatch;

/// Initializes test tracing output once per process.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

enum Value {
    Str(String),
    List(Vec<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

struct Subscriber {
    conn_id: usize,
    channel: String,
    tx: UnboundedSender<(String, String)>,
}

struct Shared {
    keys: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    connections: AtomicUsize,
    pings: AtomicUsize,
    /// While positive, `PING` answers with an error reply (and decrements).
    fail_pings: AtomicUsize,
    next_conn_id: AtomicUsize,
    /// When set, `AUTH` must present exactly this password.
    required_password: Mutex<Option<String>>,
    auth_received: Mutex<Vec<String>>,
    select_received: Mutex<Vec<String>>,
}

/// An in-process mock store bound to an ephemeral local port.
pub struct MockStore {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockStore {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock store");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            keys: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            fail_pings: AtomicUsize::new(0),
            next_conn_id: AtomicUsize::new(0),
            required_password: Mutex::new(None),
            auth_received: Mutex::new(Vec::new()),
            select_received: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    serve_connection(socket, conn_shared).await;
                });
            }
        });

        MockStore {
            addr,
            shared,
            accept_task,
        }
    }

    /// A descriptor pointing at this mock, tuned for fast tests.
    pub fn descriptor(&self) -> ConnectionDescriptor {
        let mut desc = ConnectionDescriptor::new("127.0.0.1", self.addr.port());
        desc.connect_timeout = Duration::from_secs(1);
        desc.socket_timeout = Duration::from_secs(1);
        desc
    }

    /// Total TCP connections ever accepted.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Total `PING` commands ever served (including failed ones).
    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Makes the next `n` liveness probes fail with an error reply.
    pub fn fail_next_pings(&self, n: usize) {
        self.shared.fail_pings.store(n, Ordering::SeqCst);
    }

    /// Requires clients to authenticate with exactly `password`.
    pub fn require_password(&self, password: &str) {
        *self.shared.required_password.lock().expect("password lock") =
            Some(password.to_string());
    }

    /// Passwords presented via `AUTH`, in arrival order.
    pub fn auth_received(&self) -> Vec<String> {
        self.shared.auth_received.lock().expect("auth lock").clone()
    }

    /// Database indices presented via `SELECT`, in arrival order.
    pub fn select_received(&self) -> Vec<String> {
        self.shared.select_received.lock().expect("select lock").clone()
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(socket: TcpStream, shared: Arc<Shared>) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let mut framed = Framed::new(socket, WireCodec);
    let (tx, mut rx) = unbounded_channel::<(String, String)>();

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Some(args) = parse_args(&frame) else {
                    let _ = framed
                        .send(WireFrame::Error("ERR malformed command".to_string()))
                        .await;
                    continue;
                };
                for reply in dispatch(&shared, conn_id, &tx, &args) {
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            delivery = rx.recv() => {
                let Some((channel, payload)) = delivery else { break };
                let push = WireFrame::Array(Some(vec![
                    WireFrame::Bulk(Some(Bytes::from_static(b"message"))),
                    WireFrame::Bulk(Some(Bytes::from(channel))),
                    WireFrame::Bulk(Some(Bytes::from(payload))),
                ]));
                if framed.send(push).await.is_err() {
                    break;
                }
            }
        }
    }

    // Connection gone: drop its channel registrations.
    shared
        .subscribers
        .lock()
        .expect("subscribers lock")
        .retain(|s| s.conn_id != conn_id);
}

fn parse_args(frame: &WireFrame) -> Option<Vec<String>> {
    let WireFrame::Array(Some(items)) = frame else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            WireFrame::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).to_string()),
            _ => None,
        })
        .collect()
}

fn dispatch(
    shared: &Arc<Shared>,
    conn_id: usize,
    tx: &UnboundedSender<(String, String)>,
    args: &[String],
) -> Vec<WireFrame> {
    let Some(command) = args.first() else {
        return vec![WireFrame::Error("ERR empty command".to_string())];
    };

    match command.to_ascii_uppercase().as_str() {
        "PING" => {
            shared.pings.fetch_add(1, Ordering::SeqCst);
            let failing = shared
                .fail_pings
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                vec![WireFrame::Error(
                    "LOADING store is loading the dataset in memory".to_string(),
                )]
            } else {
                vec![WireFrame::Simple("PONG".to_string())]
            }
        }
        "AUTH" => {
            let presented = args.get(1).cloned().unwrap_or_default();
            shared
                .auth_received
                .lock()
                .expect("auth lock")
                .push(presented.clone());
            let required = shared
                .required_password
                .lock()
                .expect("password lock")
                .clone();
            match required {
                Some(required) if required != presented => vec![WireFrame::Error(
                    "WRONGPASS invalid username-password pair".to_string(),
                )],
                _ => vec![WireFrame::Simple("OK".to_string())],
            }
        }
        "SELECT" => {
            shared
                .select_received
                .lock()
                .expect("select lock")
                .push(args.get(1).cloned().unwrap_or_default());
            vec![WireFrame::Simple("OK".to_string())]
        }
        "SET" => vec![handle_set(shared, args)],
        "GET" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            match args.get(1).and_then(|k| keys.get(k)) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => vec![WireFrame::Bulk(Some(Bytes::from(s.clone())))],
                _ => vec![WireFrame::Bulk(None)],
            }
        }
        "DEL" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let removed = args[1..].iter().filter(|k| keys.remove(*k).is_some()).count();
            vec![WireFrame::Integer(removed as i64)]
        }
        "EXPIRE" | "PEXPIRE" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let (Some(key), Some(amount)) = (args.get(1), args.get(2)) else {
                return vec![WireFrame::Error("ERR wrong number of arguments".to_string())];
            };
            let Ok(amount) = amount.parse::<u64>() else {
                return vec![WireFrame::Error("ERR value is not an integer".to_string())];
            };
            let ttl = if command.eq_ignore_ascii_case("PEXPIRE") {
                Duration::from_millis(amount)
            } else {
                Duration::from_secs(amount)
            };
            match keys.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    vec![WireFrame::Integer(1)]
                }
                None => vec![WireFrame::Integer(0)],
            }
        }
        "KEYS" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let pattern = WildMatch::new(args.get(1).map(String::as_str).unwrap_or("*"));
            let matched: Vec<WireFrame> = keys
                .keys()
                .filter(|k| pattern.matches(k))
                .map(|k| WireFrame::Bulk(Some(Bytes::from(k.clone()))))
                .collect();
            vec![WireFrame::Array(Some(matched))]
        }
        "RPUSH" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let Some(key) = args.get(1) else {
                return vec![WireFrame::Error("ERR wrong number of arguments".to_string())];
            };
            let entry = keys.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::List(Vec::new()),
                expires_at: None,
            });
            let Value::List(list) = &mut entry.value else {
                return vec![WireFrame::Error(
                    "WRONGTYPE Operation against a key holding the wrong kind of value"
                        .to_string(),
                )];
            };
            list.extend(args[2..].iter().cloned());
            vec![WireFrame::Integer(list.len() as i64)]
        }
        "LRANGE" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let (Some(key), Some(start), Some(stop)) = (args.get(1), args.get(2), args.get(3))
            else {
                return vec![WireFrame::Error("ERR wrong number of arguments".to_string())];
            };
            let (Ok(start), Ok(stop)) = (start.parse::<i64>(), stop.parse::<i64>()) else {
                return vec![WireFrame::Error("ERR value is not an integer".to_string())];
            };
            let elements = match keys.get(key) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => resolve_range(list.len(), start, stop)
                    .map(|(s, e)| list[s..=e].to_vec())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            vec![WireFrame::Array(Some(
                elements
                    .into_iter()
                    .map(|e| WireFrame::Bulk(Some(Bytes::from(e))))
                    .collect(),
            ))]
        }
        "LLEN" => {
            let mut keys = lock_keys(shared);
            purge_expired(&mut keys);
            let len = match args.get(1).and_then(|k| keys.get(k)) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => list.len(),
                _ => 0,
            };
            vec![WireFrame::Integer(len as i64)]
        }
        "PUBLISH" => {
            let (Some(channel), Some(payload)) = (args.get(1), args.get(2)) else {
                return vec![WireFrame::Error("ERR wrong number of arguments".to_string())];
            };
            let subscribers = shared.subscribers.lock().expect("subscribers lock");
            let mut delivered = 0i64;
            for sub in subscribers.iter().filter(|s| &s.channel == channel) {
                if sub.tx.send((channel.clone(), payload.clone())).is_ok() {
                    delivered += 1;
                }
            }
            vec![WireFrame::Integer(delivered)]
        }
        "SUBSCRIBE" => {
            let mut subscribers = shared.subscribers.lock().expect("subscribers lock");
            let mut replies = Vec::new();
            for channel in &args[1..] {
                subscribers.push(Subscriber {
                    conn_id,
                    channel: channel.clone(),
                    tx: tx.clone(),
                });
                let count = subscribers.iter().filter(|s| s.conn_id == conn_id).count();
                replies.push(ack("subscribe", channel, count as i64));
            }
            replies
        }
        "UNSUBSCRIBE" => {
            let mut subscribers = shared.subscribers.lock().expect("subscribers lock");
            let mut replies = Vec::new();
            for channel in &args[1..] {
                subscribers.retain(|s| !(s.conn_id == conn_id && &s.channel == channel));
                let count = subscribers.iter().filter(|s| s.conn_id == conn_id).count();
                replies.push(ack("unsubscribe", channel, count as i64));
            }
            replies
        }
        other => vec![WireFrame::Error(format!("ERR unknown command '{other}'"))],
    }
}

fn handle_set(shared: &Arc<Shared>, args: &[String]) -> WireFrame {
    let (Some(key), Some(value)) = (args.get(1), args.get(2)) else {
        return WireFrame::Error("ERR wrong number of arguments".to_string());
    };

    let mut ttl = None;
    let mut if_absent = false;
    let mut i = 3;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_str() {
            "EX" | "PX" => {
                let unit = args[i].to_ascii_uppercase();
                let Some(Ok(amount)) = args.get(i + 1).map(|a| a.parse::<u64>()) else {
                    return WireFrame::Error("ERR invalid expire time".to_string());
                };
                ttl = Some(if unit == "EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
                i += 2;
            }
            "NX" => {
                if_absent = true;
                i += 1;
            }
            _ => return WireFrame::Error("ERR syntax error".to_string()),
        }
    }

    let mut keys = lock_keys(shared);
    purge_expired(&mut keys);
    if if_absent && keys.contains_key(key) {
        return WireFrame::Bulk(None);
    }
    keys.insert(
        key.clone(),
        Entry {
            value: Value::Str(value.clone()),
            expires_at: ttl.map(|d| Instant::now() + d),
        },
    );
    WireFrame::Simple("OK".to_string())
}

fn ack(kind: &str, channel: &str, count: i64) -> WireFrame {
    WireFrame::Array(Some(vec![
        WireFrame::Bulk(Some(Bytes::from(kind.to_string()))),
        WireFrame::Bulk(Some(Bytes::from(channel.to_string()))),
        WireFrame::Integer(count),
    ]))
}

fn lock_keys(shared: &Arc<Shared>) -> MutexGuard<'_, HashMap<String, Entry>> {
    shared.keys.lock().expect("keys lock")
}

fn purge_expired(keys: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    keys.retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
}

/// Maps inclusive, possibly negative list bounds onto concrete indices.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let n = len as i64;
    let start = if start < 0 { (n + start).max(0) } else { start };
    let stop = if stop < 0 { n + stop } else { stop.min(n - 1) };
    if start > stop || start >= n || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}
