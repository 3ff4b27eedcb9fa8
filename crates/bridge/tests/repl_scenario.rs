//! End-to-end: host bridge + REPL server + callback queue over real sockets.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use prepl_bridge::{
    CallbackQueue, HostBridge, HostState, HostValue, IdleCallback, InitGuard, InitOutcome,
    MapHost, Mode, ReplRuntime, ServerConfig, TickScheduler,
};
use prepl_protocol::{EvalResultMessage, ServerMessage, WelcomeMessage};

/// Stand-in for an editor's idle notification.
#[derive(Default)]
struct EditorLoop {
    subscribers: Vec<IdleCallback<MapHost>>,
}

impl EditorLoop {
    fn tick(&mut self, host: &mut MapHost) {
        for callback in self.subscribers.iter_mut() {
            callback(host);
        }
    }
}

impl TickScheduler<MapHost> for EditorLoop {
    fn subscribe_idle(&mut self, callback: IdleCallback<MapHost>) {
        self.subscribers.push(callback);
    }
}

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_id: u64,
}

impl Client {
    fn connect(addr: SocketAddr) -> (Self, WelcomeMessage) {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        let mut client = Self {
            stream,
            reader,
            next_id: 0,
        };
        match client.recv() {
            ServerMessage::Welcome(w) => (client, w),
            other => panic!("Expected Welcome, got {:?}", other),
        }
    }

    fn recv(&mut self) -> ServerMessage {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn eval(&mut self, code: &str) -> ServerMessage {
        self.next_id += 1;
        let msg = serde_json::json!({ "type": "eval", "id": self.next_id.to_string(), "code": code });
        writeln!(self.stream, "{}", msg).unwrap();
        self.recv()
    }

    fn eval_ok(&mut self, code: &str) -> EvalResultMessage {
        match self.eval(code) {
            ServerMessage::EvalResult(r) => r,
            other => panic!("Expected EvalResult for {:?}, got {:?}", code, other),
        }
    }
}

fn leak_guard() -> &'static InitGuard {
    Box::leak(Box::new(InitGuard::new()))
}

fn start_edit_bridge(
    host: &mut MapHost,
    editor: &mut EditorLoop,
) -> (HostBridge<MapHost>, CallbackQueue<MapHost>, SocketAddr) {
    let runtime = ReplRuntime::new(ServerConfig::default(), CallbackQueue::new());
    let queue = runtime.queue();
    let mut bridge = HostBridge::new(Mode::Edit, runtime.entry_points()).with_guard(leak_guard());

    let addr = match bridge.initialize(host, editor).unwrap() {
        InitOutcome::Started { addr } => addr,
        other => panic!("Expected Started, got {:?}", other),
    };
    // A second lifecycle hook firing is a no-op
    assert_eq!(
        bridge.initialize(host, editor).unwrap(),
        InitOutcome::AlreadyInitialized
    );
    assert_eq!(editor.subscribers.len(), 1);

    (bridge, queue, addr)
}

#[test]
fn eval_mutate_drain_and_independent_sessions() {
    let mut host = MapHost::new();
    let mut editor = EditorLoop::default();
    let (mut bridge, queue, addr) = start_edit_bridge(&mut host, &mut editor);

    let (mut first, welcome) = Client::connect(addr);
    assert_eq!(welcome.session, 1);
    assert_eq!(first.eval_ok("1 + 1").value.as_deref(), Some("2"));

    // Mutation is queued, not applied on the session thread
    let result = first.eval_ok("host:set('score', 10)");
    assert_eq!(result.deferred, 1);
    assert!(host.get("score").is_none());
    assert_eq!(queue.len(), 1);

    editor.tick(&mut host);
    assert_eq!(host.get("score"), Some(HostValue::Integer(10)));
    assert_eq!(host.writes(), 1);

    // Exactly once
    editor.tick(&mut host);
    assert_eq!(host.writes(), 1);

    first.eval_ok("x = 1");
    assert_eq!(first.eval_ok("x").value.as_deref(), Some("1"));
    drop(first);

    let (mut second, welcome) = Client::connect(addr);
    assert_eq!(welcome.session, 2);
    assert_eq!(second.eval_ok("x").value.as_deref(), Some("nil"));

    bridge.shutdown();
}

#[test]
fn host_reads_wait_for_the_next_tick() {
    let mut host = MapHost::new();
    host.set("level", HostValue::from("cave")).unwrap();
    let mut editor = EditorLoop::default();
    let (mut bridge, _queue, addr) = start_edit_bridge(&mut host, &mut editor);

    let client = thread::spawn(move || {
        let (mut client, _) = Client::connect(addr);
        client.eval_ok("host:get('level')").value
    });

    // The host keeps ticking; the session blocks only its own thread
    let deadline = Instant::now() + Duration::from_secs(10);
    while !client.is_finished() && Instant::now() < deadline {
        editor.tick(&mut host);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.join().unwrap().as_deref(), Some("cave"));

    bridge.shutdown();
}

#[test]
fn disconnect_does_not_disturb_other_sessions_or_queue() {
    let mut host = MapHost::new();
    let mut editor = EditorLoop::default();
    let (mut bridge, queue, addr) = start_edit_bridge(&mut host, &mut editor);

    let (mut a, _) = Client::connect(addr);
    let (mut b, _) = Client::connect(addr);

    a.eval_ok("host:set('from_a', true)");
    b.eval_ok("y = 7");
    drop(a);

    // Give the server a moment to notice the disconnect
    thread::sleep(Duration::from_millis(200));

    assert_eq!(queue.len(), 1);
    assert_eq!(b.eval_ok("y * 6").value.as_deref(), Some("42"));

    editor.tick(&mut host);
    assert_eq!(host.get("from_a"), Some(HostValue::Bool(true)));

    bridge.shutdown();
}

#[test]
fn erroring_eval_reports_and_keeps_session() {
    let mut host = MapHost::new();
    let mut editor = EditorLoop::default();
    let (mut bridge, _queue, addr) = start_edit_bridge(&mut host, &mut editor);

    let (mut client, _) = Client::connect(addr);
    match client.eval("host:set('t', {})") {
        ServerMessage::Error(e) => {
            assert_eq!(e.code, "eval_error");
            assert_eq!(e.id.as_deref(), Some("1"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }
    assert_eq!(client.eval_ok("'still here'").value.as_deref(), Some("still here"));

    bridge.shutdown();
}

#[test]
fn failing_callback_does_not_block_the_batch() {
    let mut host = MapHost::new();
    let mut editor = EditorLoop::default();
    let (mut bridge, _queue, addr) = start_edit_bridge(&mut host, &mut editor);

    let (mut client, _) = Client::connect(addr);
    // MapHost rejects the empty key when the callback runs on the host
    let result = client.eval_ok("host:set('a', 1); host:set('', 2); host:set('b', 3)");
    assert_eq!(result.deferred, 3);

    editor.tick(&mut host);
    assert_eq!(host.get("a"), Some(HostValue::Integer(1)));
    assert_eq!(host.get("b"), Some(HostValue::Integer(3)));
    assert_eq!(host.len(), 2);

    bridge.shutdown();
}
