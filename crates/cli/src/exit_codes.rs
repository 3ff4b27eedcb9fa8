//! CLI exit codes. Scripts rely on these.
//!
//! | Range | Meaning                                   |
//! |-------|-------------------------------------------|
//! | 0     | Success                                   |
//! | 1     | Evaluation error reported by the server   |
//! | 2     | Usage error (bad args, no server found)   |
//! | 20-29 | Connection and protocol failures          |

use crate::client::ClientError;

// =============================================================================
// Universal (0-2)
// =============================================================================

pub const EXIT_SUCCESS: u8 = 0;

/// The server evaluated the code and reported an error.
pub const EXIT_EVAL_ERROR: u8 = 1;

/// Bad arguments, or the requested server could not be found.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Connection (20-29)
// =============================================================================

/// Cannot connect, or the server closed the connection.
pub const EXIT_CONNECT: u8 = 20;

/// Bad framing, version mismatch, malformed message.
pub const EXIT_PROTOCOL: u8 = 21;

/// Evaluation hit the server's time or instruction limit.
pub const EXIT_LIMIT: u8 = 22;

/// Failed to read local state (discovery directory, stdin).
pub const EXIT_IO: u8 = 23;

/// Map a client error to its exit code.
pub fn client_exit_code(err: &ClientError) -> u8 {
    match err {
        ClientError::ConnectionFailed(_) | ClientError::ConnectionClosed => EXIT_CONNECT,
        ClientError::IoError(_) => EXIT_CONNECT,
        ClientError::ProtocolError(_) => EXIT_PROTOCOL,
        ClientError::ServerError { code, .. } => match code.as_str() {
            "eval_error" => EXIT_EVAL_ERROR,
            "eval_timeout" | "instruction_limit" => EXIT_LIMIT,
            "malformed_message" | "message_too_large" => EXIT_PROTOCOL,
            _ => EXIT_EVAL_ERROR,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_codes() {
        let err = |code: &str| ClientError::ServerError {
            code: code.to_string(),
            message: String::new(),
        };
        assert_eq!(client_exit_code(&err("eval_error")), EXIT_EVAL_ERROR);
        assert_eq!(client_exit_code(&err("eval_timeout")), EXIT_LIMIT);
        assert_eq!(client_exit_code(&err("message_too_large")), EXIT_PROTOCOL);
        assert_eq!(client_exit_code(&ClientError::ConnectionClosed), EXIT_CONNECT);
    }
}
