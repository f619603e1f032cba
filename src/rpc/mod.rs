//! Remote call client: JSON-RPC style calls to the backend over a WebSocket.

pub mod envelope;

use crate::error::RpcError;
use crate::muted_error;
pub use envelope::{Method, RpcRequest};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tungstenite::{Message, WebSocket};

/// Read timeout of the backend socket, bounds the latency of outbound frames.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type Reply = Result<Value, RpcError>;

/// Invoked once when the backend side closes or breaks the connection.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// How hard [`RpcClient::connect`] tries to reach the backend.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Calls waiting for a reply, keyed by call id.
    pending: BTreeMap<u64, mpsc::Sender<Reply>>,
    closed: bool,
    on_close: Option<CloseHook>,
}

impl Inner {
    /// Deliver a reply frame. A reply naming a pending id resolves that call,
    /// anything else resolves the oldest pending call.
    fn route_reply(&mut self, text: &str) {
        let reply: Result<Value, serde_json::Error> = serde_json::from_str(text);
        let by_id = match &reply {
            Ok(value) => value
                .get("id")
                .and_then(Value::as_u64)
                .filter(|id| self.pending.contains_key(id)),
            Err(_) => None,
        };
        let Some(id) = by_id.or_else(|| self.pending.keys().next().copied()) else {
            warn!(target: "rpc", "unsolicited backend message: {text}");
            return;
        };
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(reply.map_err(RpcError::from));
        }
    }

    /// Mark the link dead and fail every pending call.
    fn shut(&mut self) {
        self.closed = true;
        for (_, tx) in std::mem::take(&mut self.pending) {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Link {
    outbound: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

enum Exit {
    /// [`RpcClient::close`] was called.
    Local,
    Remote,
    Error(tungstenite::Error),
}

/// Client side of the backend connection, one per session.
pub struct RpcClient {
    next_id: AtomicU64,
    link: Mutex<Option<Link>>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            link: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|link| !link.shared.lock().closed)
    }

    /// Open the backend connection and issue the `start` call.
    ///
    /// Returns the reply to `start`. Fails only if the transport cannot be
    /// established or dies before `start` is answered.
    pub fn connect(&self, host: &str, port: u16, opts: ConnectOptions) -> Result<Value, RpcError> {
        self.close();

        let addr = format!("{host}:{port}");
        let stream = connect_with_retry(&addr, opts).map_err(|source| RpcError::Connect {
            addr: addr.clone(),
            source,
        })?;
        let url = format!("ws://{addr}/");
        let (ws, _) = tungstenite::client(url.as_str(), stream).map_err(|e| {
            RpcError::Handshake {
                addr: addr.clone(),
                reason: e.to_string(),
            }
        })?;
        ws.get_ref()
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|source| RpcError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let (outbound, outbound_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
        });
        thread::Builder::new()
            .name("rpc-io".to_string())
            .spawn({
                let shared = shared.clone();
                move || io_loop(ws, outbound_rx, shared)
            })
            .map_err(|source| RpcError::Connect {
                addr: addr.clone(),
                source,
            })?;

        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(Link { outbound, shared });
        info!(target: "rpc", "connected to backend at {addr}");

        self.call(Method::Start, vec![]).inspect_err(|_| self.close())
    }

    /// Run `hook` when the backend closes or breaks the connection.
    ///
    /// Runs immediately if the connection is already gone. Never runs after
    /// a local [`RpcClient::close`].
    pub fn on_disconnect(&self, hook: CloseHook) {
        let shared = match self.link.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(link) => link.shared.clone(),
            None => return,
        };
        let mut inner = shared.lock();
        if inner.closed {
            drop(inner);
            hook();
        } else {
            inner.on_close = Some(hook);
        }
    }

    /// Send a call and block until its reply arrives or the connection dies.
    pub fn call(&self, method: Method, params: Vec<Value>) -> Result<Value, RpcError> {
        let (outbound, shared) = match self.link.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(link) => (link.outbound.clone(), link.shared.clone()),
            None => return Err(RpcError::NotConnected),
        };

        let (tx, rx) = mpsc::channel();
        let id = {
            let mut inner = shared.lock();
            if inner.closed {
                return Err(RpcError::Closed);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            inner.pending.insert(id, tx);
            id
        };

        let frame = serde_json::to_string(&RpcRequest::new(method, &params, id))?;
        debug!(target: "rpc", "-> {frame}");
        if outbound.send(frame).is_err() {
            shared.lock().pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let reply = rx.recv().unwrap_or(Err(RpcError::Closed));
        if let Ok(value) = &reply {
            debug!(target: "rpc", "<- {value}");
        }
        reply
    }

    /// Drop the connection without running the disconnect hook.
    pub fn close(&self) {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            let mut inner = link.shared.lock();
            inner.on_close = None;
            inner.shut();
            debug!(target: "rpc", "backend connection closed locally");
        }
    }
}

fn connect_with_retry(addr: &str, opts: ConnectOptions) -> io::Result<TcpStream> {
    let start = Instant::now();
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if start.elapsed() >= opts.timeout {
                    return Err(err);
                }
                debug!(target: "rpc", "backend at {addr} not reachable yet: {err}");
                thread::sleep(opts.retry_delay);
            }
        }
    }
}

fn io_loop(mut ws: WebSocket<TcpStream>, outbound: mpsc::Receiver<String>, shared: Arc<Shared>) {
    let exit = 'io: loop {
        loop {
            match outbound.try_recv() {
                Ok(frame) => {
                    if let Err(e) = ws.send(Message::text(frame)) {
                        break 'io Exit::Error(e);
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    muted_error!(ws.close(None), "close backend socket:");
                    muted_error!(ws.flush(), "flush backend socket:");
                    break 'io Exit::Local;
                }
            }
        }

        match ws.read() {
            Ok(Message::Text(text)) => shared.lock().route_reply(text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => shared.lock().route_reply(text),
                Err(e) => warn!(target: "rpc", "non UTF-8 backend frame: {e}"),
            },
            Ok(Message::Close(_)) => break Exit::Remote,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                break Exit::Remote;
            }
            Err(e) => break Exit::Error(e),
        }
    };

    let hook = {
        let mut inner = shared.lock();
        inner.shut();
        inner.on_close.take()
    };
    match exit {
        Exit::Local => return,
        Exit::Remote => info!(target: "rpc", "backend closed the connection"),
        Exit::Error(e) => warn!(target: "rpc", "backend connection error: {e}"),
    }
    if let Some(hook) = hook {
        hook();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn pending_call(inner: &mut Inner, id: u64) -> mpsc::Receiver<Reply> {
        let (tx, rx) = mpsc::channel();
        inner.pending.insert(id, tx);
        rx
    }

    #[test]
    fn test_call_without_connection() {
        let client = RpcClient::new();
        assert!(matches!(
            client.call(Method::Start, vec![]),
            Err(RpcError::NotConnected)
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_route_reply_by_id() {
        let mut inner = Inner::default();
        let first = pending_call(&mut inner, 1);
        let second = pending_call(&mut inner, 2);

        inner.route_reply(r#"{"jsonrpc": "2.0", "id": 2, "result": "b"}"#);
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().unwrap()["result"], "b");

        inner.route_reply(r#"{"jsonrpc": "2.0", "id": 1, "result": "a"}"#);
        assert_eq!(first.try_recv().unwrap().unwrap()["result"], "a");
        assert!(inner.pending.is_empty());
    }

    #[test]
    fn test_route_reply_without_id_goes_to_oldest() {
        let mut inner = Inner::default();
        let first = pending_call(&mut inner, 3);
        let second = pending_call(&mut inner, 4);

        inner.route_reply(r#"{"result": 1}"#);
        inner.route_reply(r#"{"id": 99, "result": 2}"#);

        assert_eq!(first.try_recv().unwrap().unwrap(), json!({"result": 1}));
        assert_eq!(second.try_recv().unwrap().unwrap()["result"], 2);
    }

    #[test]
    fn test_route_malformed_reply() {
        let mut inner = Inner::default();
        let call = pending_call(&mut inner, 1);

        inner.route_reply("{not json");
        assert!(matches!(
            call.try_recv().unwrap(),
            Err(RpcError::MalformedReply(_))
        ));
    }

    #[test]
    fn test_unsolicited_reply_is_dropped() {
        let mut inner = Inner::default();
        inner.route_reply(r#"{"result": 1}"#);
        assert!(inner.pending.is_empty());
    }

    #[test]
    fn test_shut_fails_pending_calls() {
        let mut inner = Inner::default();
        let a = pending_call(&mut inner, 1);
        let b = pending_call(&mut inner, 2);

        inner.shut();
        assert!(inner.closed);
        assert!(matches!(a.try_recv().unwrap(), Err(RpcError::Closed)));
        assert!(matches!(b.try_recv().unwrap(), Err(RpcError::Closed)));
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RpcClient::new();
        let err = client
            .connect("127.0.0.1", port, ConnectOptions::default())
            .unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }));
        assert!(!client.is_connected());
    }
}
