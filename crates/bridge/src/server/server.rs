//! TCP server for the REPL protocol.
//!
//! Binds to `bind_address:port` and handles JSONL messages, one thread per
//! connection. Sessions evaluate Lua on their own thread; anything touching
//! host state goes through the callback queue.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use prepl_protocol::*;

use super::discovery::DiscoveryManager;
use crate::bridge::Mode;
use crate::host::HostState;
use crate::queue::CallbackQueue;
use crate::scripting::{EvalLimits, LuaEvalResult, LuaRuntime};

/// Maximum consecutive parse failures before disconnecting a client.
const MAX_PARSE_FAILURES: u32 = 3;

/// Read timeout on session sockets; bounds how long a session takes to
/// notice shutdown.
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Listener sleep between accept attempts when idle or after an accept error.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default maximum concurrent sessions.
pub const MAX_CONNECTIONS: usize = 8;

/// Configuration for the REPL server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// 0 = OS-assigned.
    pub port: u16,
    pub max_connections: usize,
    /// Where to write the discovery file. `None` writes none.
    pub discovery_dir: Option<PathBuf>,
    /// Shown by `prepl servers`.
    pub host_title: String,
    pub mode: Mode,
    pub limits: EvalLimits,
    /// How long `host:get` / `host:keys` wait for a drain.
    pub host_reply_timeout: Duration,
    /// Longest accepted request line in bytes, newline excluded.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: MAX_CONNECTIONS,
            discovery_dir: None,
            host_title: "prepl".to_string(),
            mode: Mode::Edit,
            limits: EvalLimits::default(),
            host_reply_timeout: Duration::from_secs(2),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &prepl_config::Settings, mode: Mode, host_title: &str) -> Self {
        Self {
            bind_address: settings.bind_address.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            discovery_dir: settings
                .write_discovery_file
                .then(prepl_config::discovery_dir),
            host_title: host_title.to_string(),
            mode,
            limits: EvalLimits::from_settings(settings),
            host_reply_timeout: settings.host_reply_timeout(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Operational metrics for the REPL server.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    /// Sessions currently connected.
    pub active_sessions: Arc<AtomicU64>,
    pub sessions_opened: Arc<AtomicU64>,
    /// Connections refused due to connection limit.
    pub sessions_refused_limit: Arc<AtomicU64>,
    /// Sessions closed due to parse failure limit.
    pub sessions_closed_parse_failures: Arc<AtomicU64>,
    /// Sessions closed due to oversized message.
    pub sessions_closed_oversize: Arc<AtomicU64>,
    pub evals: Arc<AtomicU64>,
    pub eval_errors: Arc<AtomicU64>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, id: String, queue_depth: usize, callbacks_enqueued: u64) -> StatsResultMessage {
        StatsResultMessage {
            id,
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_refused_limit: self.sessions_refused_limit.load(Ordering::Relaxed),
            sessions_closed_parse_failures: self
                .sessions_closed_parse_failures
                .load(Ordering::Relaxed),
            sessions_closed_oversize: self.sessions_closed_oversize.load(Ordering::Relaxed),
            evals: self.evals.load(Ordering::Relaxed),
            eval_errors: self.eval_errors.load(Ordering::Relaxed),
            queue_depth: queue_depth as u64,
            callbacks_enqueued,
        }
    }
}

/// Decrements the active session count when a session thread exits,
/// including by panic.
struct ActiveSession(Arc<AtomicU64>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears the listener's liveness flag when its thread exits,
/// including by panic.
struct ListenerAlive(Arc<AtomicBool>);

impl Drop for ListenerAlive {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Source of incoming connections for the listener thread.
trait Incoming: Send + 'static {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Incoming for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Everything a session thread needs.
struct SessionContext<H> {
    server_id: String,
    limits: EvalLimits,
    host_reply_timeout: Duration,
    max_message_size: usize,
    queue: CallbackQueue<H>,
    metrics: ServerMetrics,
    shutdown: Arc<AtomicBool>,
}

impl<H> Clone for SessionContext<H> {
    fn clone(&self) -> Self {
        Self {
            server_id: self.server_id.clone(),
            limits: self.limits,
            host_reply_timeout: self.host_reply_timeout,
            max_message_size: self.max_message_size,
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

/// A running REPL server. Stops on drop.
pub struct ReplServer {
    server_id: String,
    bound_addr: SocketAddr,
    discovery: Option<DiscoveryManager>,
    listener_handle: Option<JoinHandle<()>>,
    /// Cleared when the listener thread exits for any reason.
    listener_alive: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    metrics: ServerMetrics,
}

impl ReplServer {
    /// Bind and start accepting sessions on a background thread.
    /// Returns as soon as the listener is bound.
    pub fn start<H: HostState + 'static>(
        config: ServerConfig,
        queue: CallbackQueue<H>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))?;
        let addr = listener.local_addr()?;

        // Set non-blocking so we can check shutdown flag
        listener.set_nonblocking(true)?;

        Ok(Self::start_on(listener, addr, config, queue))
    }

    fn start_on<H: HostState + 'static, L: Incoming>(
        listener: L,
        addr: SocketAddr,
        config: ServerConfig,
        queue: CallbackQueue<H>,
    ) -> Self {
        let server_id = uuid::Uuid::new_v4().to_string();

        let discovery = match &config.discovery_dir {
            Some(dir) => match DiscoveryManager::new(
                dir,
                &server_id,
                addr.port(),
                &config.host_title,
                config.mode.as_str(),
            ) {
                Ok(manager) => Some(manager),
                Err(e) => {
                    log::warn!("Could not write discovery file in {}: {}", dir.display(), e);
                    None
                }
            },
            None => None,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = ServerMetrics::new();
        let ctx = SessionContext {
            server_id: server_id.clone(),
            limits: config.limits,
            host_reply_timeout: config.host_reply_timeout,
            max_message_size: config.max_message_size,
            queue,
            metrics: metrics.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let max_connections = config.max_connections;

        let listener_alive = Arc::new(AtomicBool::new(true));
        let alive = ListenerAlive(Arc::clone(&listener_alive));

        let listener_handle = thread::spawn(move || {
            let _alive = alive;
            run_listener(listener, max_connections, ctx);
        });

        log::info!(
            "REPL server {} listening on {} ({} mode)",
            server_id,
            addr,
            config.mode.as_str()
        );

        Self {
            server_id,
            bound_addr: addr,
            discovery,
            listener_handle: Some(listener_handle),
            listener_alive,
            shutdown,
            metrics,
        }
    }

    /// Stop accepting, join the listener, and remove the discovery file.
    ///
    /// Open sessions notice at their next read timeout and close.
    pub fn stop(&mut self) {
        let Some(handle) = self.listener_handle.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            log::error!("REPL server {} listener thread panicked", self.server_id);
        }

        if let Some(discovery) = self.discovery.take() {
            if let Err(e) = discovery.cleanup() {
                log::warn!("Could not remove discovery file: {}", e);
            }
        }

        log::info!("REPL server {} stopped", self.server_id);
    }

    /// False once stopped, or if the listener thread died on its own.
    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some()
            && self.listener_alive.load(Ordering::SeqCst)
            && !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn discovery_path(&self) -> Option<&Path> {
        self.discovery.as_ref().map(|d| d.path())
    }
}

impl Drop for ReplServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the listener loop in a separate thread.
///
/// Accept errors (aborted handshakes, fd exhaustion) are logged and retried;
/// only shutdown ends the loop.
fn run_listener<H: HostState + 'static, L: Incoming>(
    listener: L,
    max_connections: usize,
    ctx: SessionContext<H>,
) {
    let mut next_session: u64 = 1;

    while !ctx.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let active = ctx.metrics.active_sessions.load(Ordering::SeqCst);
                if active as usize >= max_connections {
                    log::warn!(
                        "Connection refused from {}: limit of {} reached",
                        addr,
                        max_connections
                    );
                    ctx.metrics
                        .sessions_refused_limit
                        .fetch_add(1, Ordering::Relaxed);
                    drop(stream);
                    continue;
                }

                let session = next_session;
                next_session += 1;
                ctx.metrics.active_sessions.fetch_add(1, Ordering::SeqCst);
                ctx.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
                log::debug!("Session {} accepted from {}", session, addr);

                let ctx = ctx.clone();
                thread::spawn(move || {
                    let _active = ActiveSession(Arc::clone(&ctx.metrics.active_sessions));
                    match handle_connection(stream, session, &ctx) {
                        Ok(()) => log::debug!("Session {} closed", session),
                        Err(e) => log::warn!("Session {} ({}) error: {}", session, addr, e),
                    }
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::warn!("Accept error: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Handle a single client connection.
fn handle_connection<H: HostState + 'static>(
    mut stream: TcpStream,
    session: u64,
    ctx: &SessionContext<H>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SESSION_POLL_INTERVAL))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    // Lua state is per session and lives on this thread.
    let runtime = match LuaRuntime::new(ctx.limits)
        .and_then(|rt| rt.register_host(ctx.queue.clone(), ctx.host_reply_timeout).map(|_| rt))
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Session {}: could not create Lua runtime: {}", session, e);
            send_error(&mut stream, None, ProtocolError::InternalError)?;
            return Ok(());
        }
    };

    send_message(
        &mut stream,
        &ServerMessage::Welcome(WelcomeMessage {
            session,
            server_id: ctx.server_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }),
    )?;

    let mut reader = LineReader::new(stream.try_clone()?, ctx.max_message_size);
    let mut parse_failures: u32 = 0;

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let parsed = match reader.next_frame()? {
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => {
                serde_json::from_str::<ClientMessage>(&line).map_err(|e| e.to_string())
            }
            Frame::NotUtf8 => Err("line is not valid UTF-8".to_string()),
            Frame::Idle => continue,
            Frame::Closed => return Ok(()),
            Frame::TooLarge => {
                send_error(&mut stream, None, ProtocolError::MessageTooLarge)?;
                log::warn!("Session {} sent oversized message, disconnecting", session);
                ctx.metrics
                    .sessions_closed_oversize
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let msg = match parsed {
            Ok(m) => {
                parse_failures = 0;
                m
            }
            Err(e) => {
                parse_failures += 1;
                log::debug!(
                    "Session {}: malformed message ({}/{}): {}",
                    session,
                    parse_failures,
                    MAX_PARSE_FAILURES,
                    e
                );
                send_error(&mut stream, None, ProtocolError::MalformedMessage)?;

                if parse_failures >= MAX_PARSE_FAILURES {
                    log::warn!("Session {} exceeded parse failure limit, disconnecting", session);
                    ctx.metrics
                        .sessions_closed_parse_failures
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
        };

        let response = handle_message(msg, &runtime, ctx);
        send_message(&mut stream, &response)?;
    }
}

fn handle_message<H: HostState + 'static>(
    msg: ClientMessage,
    runtime: &LuaRuntime,
    ctx: &SessionContext<H>,
) -> ServerMessage {
    match msg {
        ClientMessage::Eval(eval) => {
            ctx.metrics.evals.fetch_add(1, Ordering::Relaxed);
            let result = runtime.eval(&eval.code);
            if result.error.is_some() {
                ctx.metrics.eval_errors.fetch_add(1, Ordering::Relaxed);
            }
            eval_response(eval.id, result)
        }
        ClientMessage::Ping(ping) => ServerMessage::Pong(PongMessage { id: ping.id }),
        ClientMessage::Stats(stats) => ServerMessage::StatsResult(ctx.metrics.snapshot(
            stats.id,
            ctx.queue.len(),
            ctx.queue.enqueued_total(),
        )),
    }
}

/// Map an evaluation result to its wire response.
fn eval_response(id: String, result: LuaEvalResult) -> ServerMessage {
    match result.error {
        None => ServerMessage::EvalResult(EvalResultMessage {
            id,
            value: result.returned,
            output: result.output,
            deferred: result.deferred,
            output_truncated: result.output_truncated,
        }),
        Some(message) => {
            let code = if result.timed_out {
                ProtocolError::EvalTimeout
            } else if result.instruction_limit_exceeded {
                ProtocolError::InstructionLimit
            } else {
                ProtocolError::EvalError
            };
            ServerMessage::Error(ErrorMessage {
                id: Some(id),
                code: code.code().to_string(),
                message,
                output: result.output,
            })
        }
    }
}

/// Send a message to the client.
fn send_message(stream: &mut TcpStream, msg: &ServerMessage) -> io::Result<()> {
    let json = serde_json::to_string(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(stream, "{}", json)?;
    stream.flush()
}

/// Send an error message to the client.
fn send_error(stream: &mut TcpStream, id: Option<String>, error: ProtocolError) -> io::Result<()> {
    send_message(stream, &ServerMessage::Error(error.to_error_message(id)))
}

// ============================================================================
// Framing
// ============================================================================

#[derive(Debug, PartialEq)]
enum Frame {
    Line(String),
    /// A complete line that is not valid UTF-8.
    NotUtf8,
    /// Read timed out; any partial line is kept for the next call.
    Idle,
    Closed,
    TooLarge,
}

/// Newline-delimited reader with a per-line size cap.
///
/// The partial line lives in `buf` across calls, so a read timeout in the
/// middle of a line loses nothing.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: Read> LineReader<R> {
    fn new(inner: R, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            max_len,
        }
    }

    fn next_frame(&mut self) -> io::Result<Frame> {
        // One extra byte for the newline itself
        let limit = (self.max_len + 1 - self.buf.len()) as u64;

        match (&mut self.reader).take(limit).read_until(b'\n', &mut self.buf) {
            Ok(0) => Ok(Frame::Closed),
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                    let bytes = std::mem::take(&mut self.buf);
                    Ok(String::from_utf8(bytes).map_or(Frame::NotUtf8, Frame::Line))
                } else if self.buf.len() > self.max_len {
                    self.buf.clear();
                    Ok(Frame::TooLarge)
                } else {
                    Ok(Frame::Idle)
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Frame::Idle)
            }
            Err(e) => Err(e),
        }
    }
}
