//! Blocking client for a prepl server.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use prepl_protocol::{
    ClientMessage, EvalMessage, EvalResultMessage, PingMessage, ServerMessage, StatsMessage,
    StatsResultMessage, WelcomeMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough to cover the server's own evaluation timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ReplClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    welcome: WelcomeMessage,
    next_id: u64,
}

impl ReplClient {
    /// Connect and wait for the server's `welcome`.
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?,
        );
        let writer = BufWriter::new(stream);

        let welcome = match receive(&mut reader)? {
            ServerMessage::Welcome(w) => w,
            ServerMessage::Error(err) => {
                return Err(ClientError::ServerError {
                    code: err.code,
                    message: err.message,
                })
            }
            _ => return Err(ClientError::ProtocolError("expected welcome".into())),
        };
        if welcome.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::ProtocolError(format!(
                "server speaks protocol v{}, client v{}",
                welcome.protocol_version, PROTOCOL_VERSION
            )));
        }

        Ok(Self {
            reader,
            writer,
            welcome,
            next_id: 1,
        })
    }

    pub fn welcome(&self) -> &WelcomeMessage {
        &self.welcome
    }

    /// Evaluate code in this connection's session.
    ///
    /// An evaluation error from the server comes back as
    /// [`ClientError::ServerError`] and leaves the connection usable.
    pub fn eval(&mut self, code: &str) -> Result<EvalResultMessage, ClientError> {
        let msg = ClientMessage::Eval(EvalMessage {
            id: self.next_request_id(),
            code: code.to_string(),
        });
        match self.request(&msg)? {
            ServerMessage::EvalResult(result) => Ok(result),
            _ => Err(ClientError::ProtocolError("unexpected response to eval".into())),
        }
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        let msg = ClientMessage::Ping(PingMessage {
            id: self.next_request_id(),
        });
        match self.request(&msg)? {
            ServerMessage::Pong(_) => Ok(()),
            _ => Err(ClientError::ProtocolError("unexpected response to ping".into())),
        }
    }

    pub fn stats(&mut self) -> Result<StatsResultMessage, ClientError> {
        let msg = ClientMessage::Stats(StatsMessage {
            id: self.next_request_id(),
        });
        match self.request(&msg)? {
            ServerMessage::StatsResult(stats) => Ok(stats),
            _ => Err(ClientError::ProtocolError("unexpected response to stats".into())),
        }
    }

    fn next_request_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    /// Send one request and read its response, turning `error` into `Err`.
    fn request(&mut self, msg: &ClientMessage) -> Result<ServerMessage, ClientError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ClientError::ProtocolError(e.to_string()))?;
        writeln!(self.writer, "{}", json).map_err(|e| ClientError::IoError(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| ClientError::IoError(e.to_string()))?;

        match receive(&mut self.reader)? {
            ServerMessage::Error(err) => Err(ClientError::ServerError {
                code: err.code,
                message: if err.output.is_empty() {
                    err.message
                } else {
                    format!("{}\n{}", err.output.join("\n"), err.message)
                },
            }),
            other if response_id(&other) != Some(msg.id()) => Err(ClientError::ProtocolError(
                format!("response id does not match request {}", msg.id()),
            )),
            other => Ok(other),
        }
    }
}

fn response_id(msg: &ServerMessage) -> Option<&str> {
    match msg {
        ServerMessage::EvalResult(m) => Some(&m.id),
        ServerMessage::Pong(m) => Some(&m.id),
        ServerMessage::StatsResult(m) => Some(&m.id),
        ServerMessage::Error(m) => m.id.as_deref(),
        ServerMessage::Welcome(_) => None,
    }
}

fn receive(reader: &mut impl Read) -> Result<ServerMessage, ClientError> {
    let line = read_line_bounded(reader, MAX_MESSAGE_SIZE)?;
    serde_json::from_str(&line)
        .map_err(|e| ClientError::ProtocolError(format!("invalid JSON: {}", e)))
}

/// Read one `\n`-terminated line of at most `max_bytes`.
fn read_line_bounded(reader: &mut impl Read, max_bytes: usize) -> Result<String, ClientError> {
    let mut buf = Vec::with_capacity(4096);

    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(if buf.is_empty() {
                    ClientError::ConnectionClosed
                } else {
                    ClientError::ProtocolError("connection closed mid-frame (no newline)".into())
                });
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
                if buf.len() > max_bytes {
                    return Err(ClientError::ProtocolError(format!(
                        "message exceeds {} byte limit",
                        max_bytes
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ClientError::IoError(e.to_string())),
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| ClientError::ProtocolError(format!("invalid UTF-8: {}", e)))
}

#[derive(Debug)]
pub enum ClientError {
    ConnectionFailed(String),
    ConnectionClosed,
    IoError(String),
    ProtocolError(String),
    ServerError { code: String, message: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            ClientError::ConnectionClosed => write!(f, "Connection closed by server"),
            ClientError::IoError(msg) => write!(f, "I/O error: {}", msg),
            ClientError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::ServerError { code, message } => write!(f, "[{}] {}", code, message),
        }
    }
}

impl std::error::Error for ClientError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Cursor};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_bounded_read_normal() {
        let mut data = Cursor::new(b"{\"type\":\"pong\",\"id\":\"1\"}\r\nrest".to_vec());
        let line = read_line_bounded(&mut data, 1024).unwrap();
        assert_eq!(line, "{\"type\":\"pong\",\"id\":\"1\"}");
    }

    #[test]
    fn test_bounded_read_oversize() {
        let mut data = vec![b'x'; 100];
        data.push(b'\n');
        match read_line_bounded(&mut Cursor::new(data), 50) {
            Err(ClientError::ProtocolError(msg)) => assert!(msg.contains("exceeds")),
            other => panic!("Expected ProtocolError, got {:?}", other),
        }
    }

    #[test]
    fn test_bounded_read_close() {
        assert!(matches!(
            read_line_bounded(&mut Cursor::new(Vec::new()), 1024),
            Err(ClientError::ConnectionClosed)
        ));
        match read_line_bounded(&mut Cursor::new(b"{\"type\"".to_vec()), 1024) {
            Err(ClientError::ProtocolError(msg)) => assert!(msg.contains("mid-frame")),
            other => panic!("Expected ProtocolError, got {:?}", other),
        }
    }

    /// One-connection fake server that answers from a script.
    fn fake_server(replies: Vec<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            writeln!(
                writer,
                r#"{{"type":"welcome","session":1,"server_id":"s","protocol_version":1,"capabilities":["eval"]}}"#
            )
            .unwrap();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                writeln!(writer, "{}", reply).unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_eval_and_error_over_socket() {
        let addr = fake_server(vec![
            r#"{"type":"eval_result","id":"1","value":"2","deferred":0}"#,
            r#"{"type":"error","id":"2","code":"eval_error","message":"boom","output":["before"]}"#,
            r#"{"type":"pong","id":"3"}"#,
        ]);

        let mut client = ReplClient::connect(addr).unwrap();
        assert_eq!(client.welcome().session, 1);
        assert_eq!(client.eval("1 + 1").unwrap().value.as_deref(), Some("2"));

        match client.eval("error('boom')") {
            Err(ClientError::ServerError { code, message }) => {
                assert_eq!(code, "eval_error");
                assert_eq!(message, "before\nboom");
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }
        client.ping().unwrap();
    }

    #[test]
    fn test_mismatched_response_id() {
        let addr = fake_server(vec![r#"{"type":"pong","id":"99"}"#]);
        let mut client = ReplClient::connect(addr).unwrap();
        assert!(matches!(client.ping(), Err(ClientError::ProtocolError(_))));
    }
}
