use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::DialectCodec;
use crate::error::ProtocolError;
use crate::event::{Direction, ProtocolEvent};
use crate::frame::{Frame, FrameScan, FramingRule, PostgresFramingRule};

const SSL_REQUEST_CODE: u32 = 80877103;
const STARTUP_VERSION_3_0: u32 = 196608;
const CANCEL_REQUEST_CODE: u32 = 80877102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// First message from the client — no tag byte.
    AwaitingStartup,
    /// We replied 'N' to SSLRequest, waiting for the real StartupMessage.
    AwaitingStartupAfterSslReject,
    Ready,
}

/// PostgreSQL v3 wire protocol codec. One instance per connection.
pub struct PostgresCodec {
    phase: Phase,
    current_db: Option<String>,
    username: Option<String>,
    /// Prepared statements: stmt_name -> SQL text.
    statements: HashMap<String, Vec<u8>>,
    /// Bound portals: portal_name -> stmt_name.
    portals: HashMap<String, String>,
}

impl PostgresCodec {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingStartup,
            current_db: None,
            username: None,
            statements: HashMap::new(),
            portals: HashMap::new(),
        }
    }

    fn decode_startup(&mut self, buf: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        if buf.len() < 8 {
            return Err(ProtocolError::MalformedStartup("startup message shorter than version field".into()));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        match version {
            SSL_REQUEST_CODE => {
                // `intercept_startup` should have already answered this; if
                // we get here the interception was skipped (e.g. replay in
                // a test) and there's nothing to extract.
                Ok(ProtocolEvent::Opaque)
            }
            STARTUP_VERSION_3_0 => {
                let (user, database) = parse_startup_params(&buf[8..]);
                debug!("Postgres StartupMessage: user={user:?} database={database:?}");
                if let Some(db) = database {
                    self.current_db = Some(db);
                }
                self.phase = Phase::Ready;
                if let Some(user) = user {
                    self.username = Some(user.clone());
                    Ok(ProtocolEvent::Login { username: user })
                } else {
                    Ok(ProtocolEvent::Opaque)
                }
            }
            CANCEL_REQUEST_CODE => Ok(ProtocolEvent::Opaque),
            other => {
                warn!("Postgres: unknown startup version {other}");
                Ok(ProtocolEvent::Opaque)
            }
        }
    }

    fn decode_regular(&mut self, tag: u8, payload: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        match tag {
            b'Q' => {
                let sql = extract_cstring(payload)
                    .ok_or_else(|| ProtocolError::TruncatedField("Simple Query not null-terminated".into()))?;
                trace!("Postgres Query: {}", String::from_utf8_lossy(&sql));
                Ok(ProtocolEvent::Query { sql })
            }
            b'P' => {
                // stmt_name\0 sql\0 param_count(i16) param_types...
                let name_end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| ProtocolError::TruncatedField("Parse statement name not null-terminated".into()))?;
                let stmt_name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
                let rest = &payload[name_end + 1..];
                let sql = extract_cstring(rest)
                    .ok_or_else(|| ProtocolError::TruncatedField("Parse SQL not null-terminated".into()))?;
                trace!("Postgres Parse: stmt={stmt_name:?}");
                self.statements.insert(stmt_name, sql.clone());
                Ok(ProtocolEvent::Query { sql })
            }
            b'B' => {
                let portal_end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| ProtocolError::TruncatedField("Bind portal name not null-terminated".into()))?;
                let portal = String::from_utf8_lossy(&payload[..portal_end]).into_owned();
                let rest = &payload[portal_end + 1..];
                if let Some(stmt) = extract_cstring(rest) {
                    let stmt = String::from_utf8_lossy(&stmt).into_owned();
                    self.portals.insert(portal, stmt);
                }
                Ok(ProtocolEvent::Opaque)
            }
            b'E' => {
                let portal = extract_cstring(payload).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
                let sql = self
                    .portals
                    .get(&portal)
                    .and_then(|stmt| self.statements.get(stmt))
                    .cloned();
                match sql {
                    Some(sql) => Ok(ProtocolEvent::Query { sql }),
                    None => Ok(ProtocolEvent::Opaque),
                }
            }
            b'C' => {
                if !payload.is_empty() {
                    let close_type = payload[0];
                    if let Some(name) = extract_cstring(&payload[1..]) {
                        let name = String::from_utf8_lossy(&name).into_owned();
                        match close_type {
                            b'S' => {
                                self.statements.remove(&name);
                            }
                            b'P' => {
                                self.portals.remove(&name);
                            }
                            _ => {}
                        }
                    }
                }
                Ok(ProtocolEvent::Opaque)
            }
            b'X' => Ok(ProtocolEvent::EndOfRequest),
            _ => Ok(ProtocolEvent::Opaque),
        }
    }
}

/// Extract a null-terminated C string from a byte slice.
fn extract_cstring(buf: &[u8]) -> Option<Vec<u8>> {
    let end = buf.iter().position(|&b| b == 0)?;
    Some(buf[..end].to_vec())
}

/// Parse the StartupMessage's null-terminated key/value pairs, returning
/// `(user, database)`.
fn parse_startup_params(mut buf: &[u8]) -> (Option<String>, Option<String>) {
    let mut user = None;
    let mut database = None;
    loop {
        let Some(key) = extract_cstring(buf) else { break };
        if key.is_empty() {
            break;
        }
        buf = &buf[key.len() + 1..];
        let Some(value) = extract_cstring(buf) else { break };
        buf = &buf[value.len() + 1..];

        match key.as_slice() {
            b"user" => user = Some(String::from_utf8_lossy(&value).into_owned()),
            b"database" => database = Some(String::from_utf8_lossy(&value).into_owned()),
            _ => {}
        }
    }
    (user, database)
}

impl DialectCodec for PostgresCodec {
    fn scan(&self, buf: &[u8], direction: Direction) -> FrameScan {
        let startup = direction == Direction::Frontend
            && matches!(self.phase, Phase::AwaitingStartup | Phase::AwaitingStartupAfterSslReject);
        PostgresFramingRule { startup }.scan(buf)
    }

    fn decode(&mut self, frame: &Frame, direction: Direction) -> Result<ProtocolEvent, ProtocolError> {
        if direction == Direction::Backend {
            // Server-originated frames carry no query information; the
            // firewall only needs to forward them.
            return Ok(ProtocolEvent::Opaque);
        }

        match self.phase {
            Phase::AwaitingStartup | Phase::AwaitingStartupAfterSslReject => self.decode_startup(&frame.bytes),
            Phase::Ready => {
                if frame.bytes.is_empty() {
                    return Err(ProtocolError::TruncatedField("regular message missing tag byte".into()));
                }
                self.decode_regular(frame.bytes[0], &frame.bytes[1..])
            }
        }
    }

    fn current_db(&self) -> Option<&str> {
        self.current_db.as_deref()
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn intercept_startup(&mut self, buf: &[u8], direction: Direction) -> Option<Vec<u8>> {
        if direction != Direction::Frontend {
            return None;
        }
        if !matches!(self.phase, Phase::AwaitingStartup | Phase::AwaitingStartupAfterSslReject) {
            return None;
        }
        if buf.len() < 8 {
            return None;
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version == SSL_REQUEST_CODE {
            debug!("Postgres: intercepting SSLRequest, replying 'N'");
            self.phase = Phase::AwaitingStartupAfterSslReject;
            Some(vec![b'N'])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn startup_message(version: u32) -> Vec<u8> {
        let length: u32 = 8;
        let mut buf = Vec::new();
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&version.to_be_bytes());
        buf
    }

    fn startup_message_with_params(user: &str, database: &str) -> Vec<u8> {
        let mut params = Vec::new();
        params.extend_from_slice(b"user");
        params.push(0);
        params.extend_from_slice(user.as_bytes());
        params.push(0);
        params.extend_from_slice(b"database");
        params.push(0);
        params.extend_from_slice(database.as_bytes());
        params.push(0);
        params.push(0); // terminating empty key

        let length = (8 + params.len()) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&STARTUP_VERSION_3_0.to_be_bytes());
        buf.extend_from_slice(&params);
        buf
    }

    fn query_message(sql: &str) -> Vec<u8> {
        let payload_len = sql.len() + 1;
        let length = (payload_len + 4) as u32;
        let mut buf = vec![b'Q'];
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(sql.as_bytes());
        buf.push(0);
        buf
    }

    fn frame_of(kind: u8, bytes: Vec<u8>) -> Frame {
        Frame { kind, bytes: Bytes::from(bytes) }
    }

    #[test]
    fn ssl_request_is_intercepted() {
        let mut codec = PostgresCodec::new();
        let buf = startup_message(SSL_REQUEST_CODE);
        let response = codec.intercept_startup(&buf, Direction::Frontend);
        assert_eq!(response, Some(vec![b'N']));
        assert_eq!(codec.phase, Phase::AwaitingStartupAfterSslReject);
    }

    #[test]
    fn startup_message_extracts_user_and_database() {
        let mut codec = PostgresCodec::new();
        let buf = startup_message_with_params("alice", "billing");
        let frame = frame_of(0, buf);
        match codec.decode(&frame, Direction::Frontend).unwrap() {
            ProtocolEvent::Login { username } => assert_eq!(username, "alice"),
            other => panic!("expected Login, got {other:?}"),
        }
        assert_eq!(codec.current_db(), Some("billing"));
        assert_eq!(codec.phase, Phase::Ready);
    }

    #[test]
    fn simple_query_is_extracted() {
        let mut codec = PostgresCodec::new();
        codec.phase = Phase::Ready;
        let buf = query_message("SELECT 1;");
        let frame = frame_of(b'Q', buf);
        match codec.decode(&frame, Direction::Frontend).unwrap() {
            ProtocolEvent::Query { sql } => assert_eq!(sql, b"SELECT 1;"),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn terminate_ends_request() {
        let mut codec = PostgresCodec::new();
        codec.phase = Phase::Ready;
        let frame = frame_of(b'X', vec![b'X', 0, 0, 0, 4]);
        assert_eq!(codec.decode(&frame, Direction::Frontend).unwrap(), ProtocolEvent::EndOfRequest);
    }

    fn parse_message(stmt_name: &str, sql: &str) -> Vec<u8> {
        let payload_len = stmt_name.len() + 1 + sql.len() + 1 + 2;
        let length = (payload_len + 4) as u32;
        let mut buf = vec![b'P'];
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(stmt_name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(sql.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    fn bind_message(portal: &str, stmt_name: &str) -> Vec<u8> {
        let payload_len = portal.len() + 1 + stmt_name.len() + 1 + 2 + 2 + 2;
        let length = (payload_len + 4) as u32;
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(portal.as_bytes());
        buf.push(0);
        buf.extend_from_slice(stmt_name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    fn execute_message(portal: &str) -> Vec<u8> {
        let payload_len = portal.len() + 1 + 4;
        let length = (payload_len + 4) as u32;
        let mut buf = vec![b'E'];
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(portal.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf
    }

    #[test]
    fn extended_protocol_parse_bind_execute_yields_query() {
        let mut codec = PostgresCodec::new();
        codec.phase = Phase::Ready;

        let parse = parse_message("s1", "SELECT * FROM users");
        let frame = frame_of(b'P', parse);
        match codec.decode(&frame, Direction::Frontend).unwrap() {
            ProtocolEvent::Query { sql } => assert_eq!(sql, b"SELECT * FROM users"),
            other => panic!("expected Query from Parse, got {other:?}"),
        }

        let bind = bind_message("p1", "s1");
        let frame = frame_of(b'B', bind);
        assert_eq!(codec.decode(&frame, Direction::Frontend).unwrap(), ProtocolEvent::Opaque);

        let exec = execute_message("p1");
        let frame = frame_of(b'E', exec);
        match codec.decode(&frame, Direction::Frontend).unwrap() {
            ProtocolEvent::Query { sql } => assert_eq!(sql, b"SELECT * FROM users"),
            other => panic!("expected Query from Execute, got {other:?}"),
        }
    }

    #[test]
    fn close_statement_evicts_table_entry() {
        let mut codec = PostgresCodec::new();
        codec.phase = Phase::Ready;

        codec.decode(&frame_of(b'P', parse_message("s1", "SELECT 1")), Direction::Frontend).unwrap();
        assert!(codec.statements.contains_key("s1"));

        let close = {
            let payload_len = 1 + "s1".len() + 1;
            let length = (payload_len + 4) as u32;
            let mut buf = vec![b'C'];
            buf.extend_from_slice(&length.to_be_bytes());
            buf.push(b'S');
            buf.extend_from_slice(b"s1");
            buf.push(0);
            buf
        };
        codec.decode(&frame_of(b'C', close), Direction::Frontend).unwrap();
        assert!(!codec.statements.contains_key("s1"));
    }

    #[test]
    fn backend_frames_are_opaque() {
        let mut codec = PostgresCodec::new();
        codec.phase = Phase::Ready;
        let frame = frame_of(b'Z', vec![b'Z', 0, 0, 0, 5, b'I']);
        assert_eq!(codec.decode(&frame, Direction::Backend).unwrap(), ProtocolEvent::Opaque);
    }
}
