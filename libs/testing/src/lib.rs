//! Test doubles for sentinel-proxy.
//!
//! - [`FakeSentinel`]: answers `SENTINEL get-master-addr-by-name` with a
//!   switchable address
//! - [`FakeRedis`]: a redis node whose reported role can be flipped and whose
//!   idle connections can be cut, like a master going away
//! - [`TcpEchoBackend`]: plain TCP echo server

pub mod resp;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Monitor name the fake sentinel answers for unless told otherwise.
pub const MONITOR_NAME: &str = "mymaster";

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Accept loop shared by the fakes. Stops when the returned sender is dropped.
fn serve<F, Fut>(listener: TcpListener, handler: F) -> oneshot::Sender<()>
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            tokio::spawn(handler(stream));
                        }
                        Err(_) => break,
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });

    shutdown_tx
}

struct SentinelState {
    monitor_name: String,
    password: Option<String>,
    master: Mutex<Option<(String, String)>>,
    queries: AtomicU64,
    reply_delay_ms: AtomicU64,
}

/// Fake Sentinel node.
pub struct FakeSentinel {
    pub addr: SocketAddr,
    state: Arc<SentinelState>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl FakeSentinel {
    /// Sentinel monitoring [`MONITOR_NAME`], reporting `master`.
    pub async fn spawn(master: SocketAddr) -> io::Result<Self> {
        Self::spawn_with(MONITOR_NAME, master, None).await
    }

    /// Sentinel that requires `AUTH <password>` before anything else.
    pub async fn spawn_with_password(master: SocketAddr, password: &str) -> io::Result<Self> {
        Self::spawn_with(MONITOR_NAME, master, Some(password.to_string())).await
    }

    pub async fn spawn_with(
        monitor_name: &str,
        master: SocketAddr,
        password: Option<String>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(SentinelState {
            monitor_name: monitor_name.to_string(),
            password,
            master: Mutex::new(Some(split_addr(master))),
            queries: AtomicU64::new(0),
            reply_delay_ms: AtomicU64::new(0),
        });

        let handler_state = Arc::clone(&state);
        let shutdown_tx = serve(listener, move |stream| {
            serve_sentinel(stream, Arc::clone(&handler_state))
        });

        Ok(Self {
            addr,
            state,
            _shutdown_tx: shutdown_tx,
        })
    }

    /// Report a different master from now on (a failover).
    pub fn set_master(&self, master: SocketAddr) {
        self.set_master_reply(&master.ip().to_string(), &master.port().to_string());
    }

    /// Report an arbitrary host and port, valid or not.
    pub fn set_master_reply(&self, host: &str, port: &str) {
        *self.state.master.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((host.to_string(), port.to_string()));
    }

    /// Answer with a nil reply, as Sentinel does for an unknown monitor.
    pub fn forget_master(&self) {
        *self.state.master.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Hold every get-master-addr-by-name answer back by `delay`.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of get-master-addr-by-name queries answered.
    pub fn query_count(&self) -> u64 {
        self.state.queries.load(Ordering::SeqCst)
    }
}

fn split_addr(addr: SocketAddr) -> (String, String) {
    (addr.ip().to_string(), addr.port().to_string())
}

fn check_auth(args: &[String], password: Option<&str>) -> Result<(), Vec<u8>> {
    match (password, args.last()) {
        (Some(expected), Some(given)) if args.len() >= 2 && given == expected => Ok(()),
        (Some(_), _) => Err(resp::error(
            "WRONGPASS invalid username-password pair or user is disabled.",
        )),
        (None, _) => Err(resp::error(
            "ERR AUTH <password> called without any password configured for the default user.",
        )),
    }
}

async fn serve_sentinel(stream: TcpStream, state: Arc<SentinelState>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut authenticated = state.password.is_none();

    while let Ok(Some(args)) = resp::read_command(&mut reader).await {
        let name = args
            .first()
            .map(|a| a.to_ascii_uppercase())
            .unwrap_or_default();

        let reply = match name.as_str() {
            "AUTH" => match check_auth(&args, state.password.as_deref()) {
                Ok(()) => {
                    authenticated = true;
                    resp::simple("OK")
                }
                Err(reply) => reply,
            },
            _ if !authenticated => resp::error("NOAUTH Authentication required."),
            "SENTINEL"
                if args
                    .get(1)
                    .is_some_and(|sub| sub.eq_ignore_ascii_case("get-master-addr-by-name")) =>
            {
                state.queries.fetch_add(1, Ordering::SeqCst);
                let delay = state.reply_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let master = state
                    .master
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match (args.get(2), master) {
                    (Some(monitor), Some((host, port))) if *monitor == state.monitor_name => {
                        resp::array(&[host.as_str(), port.as_str()])
                    }
                    _ => resp::nil_array(),
                }
            }
            "PING" => resp::simple("PONG"),
            _ => resp::simple("OK"),
        };

        if write.write_all(&reply).await.is_err() {
            break;
        }
    }
}

struct RedisState {
    master: AtomicBool,
    connections: AtomicU64,
    idle: AtomicU64,
    info_queries: AtomicU64,
    info_delay_ms: AtomicU64,
    kill_idle: Mutex<CancellationToken>,
}

/// Fake redis node.
///
/// Answers `INFO`, `PING`, `ECHO` and `QUIT`; everything else gets `+OK`.
/// Connections that have not sent a command yet count as idle, which is what
/// a proxy's monitoring connection looks like.
pub struct FakeRedis {
    pub addr: SocketAddr,
    state: Arc<RedisState>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl FakeRedis {
    /// A node reporting `role:master`.
    pub async fn spawn_master() -> io::Result<Self> {
        Self::spawn(true).await
    }

    /// A node reporting `role:slave`.
    pub async fn spawn_replica() -> io::Result<Self> {
        Self::spawn(false).await
    }

    pub async fn spawn(is_master: bool) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(RedisState {
            master: AtomicBool::new(is_master),
            connections: AtomicU64::new(0),
            idle: AtomicU64::new(0),
            info_queries: AtomicU64::new(0),
            info_delay_ms: AtomicU64::new(0),
            kill_idle: Mutex::new(CancellationToken::new()),
        });

        let handler_state = Arc::clone(&state);
        let shutdown_tx = serve(listener, move |stream| {
            serve_redis(stream, Arc::clone(&handler_state))
        });

        Ok(Self {
            addr,
            state,
            _shutdown_tx: shutdown_tx,
        })
    }

    /// Start reporting `role:master`.
    pub fn promote(&self) {
        self.state.master.store(true, Ordering::SeqCst);
    }

    /// Start reporting `role:slave`.
    pub fn demote(&self) {
        self.state.master.store(false, Ordering::SeqCst);
    }

    /// Hold every `INFO` answer back by `delay`.
    pub fn set_info_delay(&self, delay: Duration) {
        self.state
            .info_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Close every connection that has not sent a command yet.
    pub fn disconnect_idle(&self) {
        let mut token = self
            .state
            .kill_idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *token, CancellationToken::new()).cancel();
    }

    /// Total connections accepted.
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Open connections that have not sent a command yet.
    pub fn idle_connection_count(&self) -> u64 {
        self.state.idle.load(Ordering::SeqCst)
    }

    /// Number of `INFO` commands answered.
    pub fn info_query_count(&self) -> u64 {
        self.state.info_queries.load(Ordering::SeqCst)
    }
}

fn replication_info(is_master: bool) -> String {
    if is_master {
        "# Replication\r\nrole:master\r\nconnected_slaves:0\r\n".to_string()
    } else {
        "# Replication\r\nrole:slave\r\nmaster_host:127.0.0.1\r\nmaster_link_status:up\r\n"
            .to_string()
    }
}

async fn serve_redis(stream: TcpStream, state: Arc<RedisState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.idle.fetch_add(1, Ordering::SeqCst);

    let kill = state
        .kill_idle
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut idle = true;

    loop {
        let command = if idle {
            tokio::select! {
                _ = kill.cancelled() => break,
                command = resp::read_command(&mut reader) => command,
            }
        } else {
            resp::read_command(&mut reader).await
        };

        let Ok(Some(args)) = command else {
            break;
        };
        if idle {
            idle = false;
            state.idle.fetch_sub(1, Ordering::SeqCst);
        }

        let name = args
            .first()
            .map(|a| a.to_ascii_uppercase())
            .unwrap_or_default();

        let (reply, quit) = match name.as_str() {
            "INFO" => {
                state.info_queries.fetch_add(1, Ordering::SeqCst);
                let delay = state.info_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let info = replication_info(state.master.load(Ordering::SeqCst));
                (resp::bulk(&info), false)
            }
            "PING" => (resp::simple("PONG"), false),
            "ECHO" => (resp::bulk(args.get(1).map(String::as_str).unwrap_or("")), false),
            "QUIT" => (resp::simple("OK"), true),
            _ => (resp::simple("OK"), false),
        };

        if write.write_all(&reply).await.is_err() || quit {
            break;
        }
    }

    if idle {
        state.idle.fetch_sub(1, Ordering::SeqCst);
    }
}

/// TCP echo server.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on("127.0.0.1:0".parse().expect("valid address")).await
    }

    /// Echo server on a specific address, e.g. one a test reserved earlier.
    pub async fn spawn_on(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let conn_clone = Arc::clone(&connections);
        let shutdown_tx = serve(listener, move |mut stream| {
            conn_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}
