use tracing::{debug, trace};

use super::DialectCodec;
use crate::error::ProtocolError;
use crate::event::{Direction, ProtocolEvent};
use crate::frame::{Frame, FrameScan, FramingRule, MySqlFramingRule};

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;

/// Offset of the username C-string in a HandshakeResponse packet: 4-byte
/// capability flags + 4-byte max-packet-size + 1-byte charset + 23 filler
/// bytes.
const HANDSHAKE_USERNAME_OFFSET: usize = 4 + 4 + 1 + 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the client's HandshakeResponse (the first frontend frame).
    AwaitingHandshakeResponse,
    Ready,
}

/// MySQL client/server protocol codec. One instance per connection.
pub struct MySqlCodec {
    rule: MySqlFramingRule,
    phase: Phase,
    current_db: Option<String>,
    username: Option<String>,
}

impl MySqlCodec {
    pub fn new() -> Self {
        Self {
            rule: MySqlFramingRule,
            phase: Phase::AwaitingHandshakeResponse,
            current_db: None,
            username: None,
        }
    }

    fn decode_handshake_response(&mut self, payload: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        if payload.len() < HANDSHAKE_USERNAME_OFFSET {
            return Err(ProtocolError::TruncatedField(
                "HandshakeResponse shorter than fixed header".into(),
            ));
        }
        let rest = &payload[HANDSHAKE_USERNAME_OFFSET..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::TruncatedField("HandshakeResponse username not null-terminated".into()))?;
        let username = String::from_utf8_lossy(&rest[..end]).into_owned();
        debug!("MySQL Login: username={username:?}");
        self.username = Some(username.clone());
        self.phase = Phase::Ready;
        Ok(ProtocolEvent::Login { username })
    }

    fn decode_command(&mut self, payload: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        if payload.is_empty() {
            return Ok(ProtocolEvent::Opaque);
        }
        match payload[0] {
            COM_INIT_DB => {
                let db = String::from_utf8_lossy(&payload[1..]).into_owned();
                debug!("MySQL COM_INIT_DB: {db:?}");
                self.current_db = Some(db.clone());
                Ok(ProtocolEvent::Connect { service_name: db })
            }
            COM_QUERY => {
                let sql = payload[1..].to_vec();
                trace!("MySQL Query: {}", String::from_utf8_lossy(&sql));
                Ok(ProtocolEvent::Query { sql })
            }
            COM_QUIT => Ok(ProtocolEvent::EndOfRequest),
            _ => Ok(ProtocolEvent::Opaque),
        }
    }
}

impl DialectCodec for MySqlCodec {
    fn scan(&self, buf: &[u8], _direction: Direction) -> FrameScan {
        self.rule.scan(buf)
    }

    fn initial_direction(&self) -> Direction {
        // The server's Initial Handshake Packet arrives unprompted; the
        // client only speaks once it has parsed that greeting.
        Direction::Backend
    }

    fn decode(&mut self, frame: &Frame, direction: Direction) -> Result<ProtocolEvent, ProtocolError> {
        if direction == Direction::Backend {
            // Server-originated frames (initial handshake, OK/ERR packets)
            // carry no query information this firewall acts on.
            return Ok(ProtocolEvent::Opaque);
        }

        match self.phase {
            Phase::AwaitingHandshakeResponse => self.decode_handshake_response(&frame.bytes),
            Phase::Ready => self.decode_command(&frame.bytes),
        }
    }

    fn current_db(&self) -> Option<&str> {
        self.current_db.as_deref()
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn name(&self) -> &'static str {
        "mysql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn handshake_response_payload(username: &str) -> Vec<u8> {
        let mut payload = vec![0u8; HANDSHAKE_USERNAME_OFFSET];
        payload.extend_from_slice(username.as_bytes());
        payload.push(0);
        payload
    }

    fn frame(payload: Vec<u8>) -> Frame {
        Frame { kind: payload.first().copied().unwrap_or(0), bytes: Bytes::from(payload) }
    }

    #[test]
    fn handshake_response_extracts_username() {
        let mut codec = MySqlCodec::new();
        let f = frame(handshake_response_payload("root"));
        match codec.decode(&f, Direction::Frontend).unwrap() {
            ProtocolEvent::Login { username } => assert_eq!(username, "root"),
            other => panic!("expected Login, got {other:?}"),
        }
        assert_eq!(codec.phase, Phase::Ready);
    }

    #[test]
    fn com_query_extracts_sql() {
        let mut codec = MySqlCodec::new();
        codec.phase = Phase::Ready;
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(b"SELECT 1 FROM dual");
        let f = frame(payload);
        match codec.decode(&f, Direction::Frontend).unwrap() {
            ProtocolEvent::Query { sql } => assert_eq!(sql, b"SELECT 1 FROM dual"),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn com_init_db_updates_current_db() {
        let mut codec = MySqlCodec::new();
        codec.phase = Phase::Ready;
        let mut payload = vec![COM_INIT_DB];
        payload.extend_from_slice(b"accounts");
        let f = frame(payload);
        codec.decode(&f, Direction::Frontend).unwrap();
        assert_eq!(codec.current_db(), Some("accounts"));
    }

    #[test]
    fn backend_frames_are_opaque() {
        let mut codec = MySqlCodec::new();
        codec.phase = Phase::Ready;
        let f = frame(vec![0x00, 1, 2, 3]);
        assert_eq!(codec.decode(&f, Direction::Backend).unwrap(), ProtocolEvent::Opaque);
    }

    #[test]
    fn framing_rule_reports_command_byte_as_kind() {
        let rule = MySqlFramingRule;
        let payload = b"\x03SELECT 1";
        let mut buf = vec![(payload.len() & 0xff) as u8, 0, 0, 0];
        buf.extend_from_slice(payload);
        assert_eq!(rule.scan(&buf), FrameScan::Ready { len: buf.len(), kind: 0x03 });
    }
}
