use tracing::{debug, trace, warn};

use super::DialectCodec;
use crate::error::ProtocolError;
use crate::event::{Direction, ProtocolEvent};
use crate::frame::{Frame, FrameScan, OracleFramingRule, FramingRule};

const PACKET_TYPE_CONNECT: u8 = 0x01;
const PACKET_TYPE_DATA: u8 = 0x06;
const TTC_FUNCTION_OPERATION: u8 = 0x03;
const TTC_SUBCODE_EXECUTE: u8 = 0x5e;
const TTC_SUBCODE_LOGIN: u8 = 0x76;
const TTC_MARKER: u8 = 0x40;

/// Oracle TNS/TTC dialect codec. One instance per connection.
///
/// The wire layer is Oracle's Transparent Network Substrate (TNS); SQL
/// requests travel inside TNS `Data` packets as Two-Task Common (TTC)
/// messages.
pub struct OracleCodec {
    rule: OracleFramingRule,
    current_db: Option<String>,
    username: Option<String>,
}

impl OracleCodec {
    pub fn new() -> Self {
        Self {
            rule: OracleFramingRule,
            current_db: None,
            username: None,
        }
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        if body.len() < 26 {
            return Err(ProtocolError::TruncatedField("Connect packet shorter than connect-data length field".into()));
        }
        let connect_data_len = (body[24] as usize) * 256 + body[25] as usize;
        if connect_data_len > body.len() {
            return Err(ProtocolError::TruncatedField("connect-data length exceeds packet size".into()));
        }
        let connect_data = &body[body.len() - connect_data_len..];
        let text = String::from_utf8_lossy(connect_data);

        let marker = "SERVICE_NAME=";
        let service_name = text
            .find(marker)
            .and_then(|start| {
                let after = &text[start + marker.len()..];
                after.find(')').map(|end| after[..end].to_string())
            })
            .unwrap_or_default();

        debug!("Oracle Connect: service_name={service_name:?}");
        self.current_db = Some(service_name.clone());
        Ok(ProtocolEvent::Connect { service_name })
    }

    fn decode_data(&mut self, body: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
        // The 8-byte TNS common header is stripped by the caller; `body` here
        // is the packet starting at byte [8) of the original frame per
        // `SPEC_FULL.md` §4.2 ("the TTC sub-payload starts at byte [8]").
        if body.len() < 2 {
            return Err(ProtocolError::TruncatedField("TTC data packet too short".into()));
        }
        if body[1] == TTC_MARKER {
            return Ok(ProtocolEvent::EndOfRequest);
        }

        let mut payload = &body[2..];

        // Some vendor builds insert an extra 15-byte TTC preamble ahead of
        // the function code. The detection heuristic and the 15-byte skip
        // are carried over unchanged from the source this firewall's
        // behaviour is grounded on; see DESIGN.md for the open question
        // about whether 15 or 17 is the intended skip distance.
        if payload.len() > 16 && payload[0] == 0x11 && payload[15] == 0x03 && payload[16] == 0x5e {
            payload = &payload[15..];
        }

        if payload.is_empty() {
            return Ok(ProtocolEvent::Opaque);
        }

        if payload[0] != TTC_FUNCTION_OPERATION || payload.len() < 2 {
            return Ok(ProtocolEvent::Opaque);
        }

        match payload[1] {
            TTC_SUBCODE_EXECUTE => {
                if payload.len() < 70 {
                    return Err(ProtocolError::TruncatedField("TTC execute payload shorter than query offset".into()));
                }
                let (query, _) = pascal_string(&payload[70..])?;
                trace!("Oracle Query: {}", String::from_utf8_lossy(&query));
                Ok(ProtocolEvent::Query { sql: query })
            }
            TTC_SUBCODE_LOGIN => {
                if payload.len() < 19 {
                    return Err(ProtocolError::TruncatedField("TTC login payload shorter than username offset".into()));
                }
                let (username, _) = pascal_string(&payload[19..])?;
                let username = String::from_utf8_lossy(&username).into_owned();
                debug!("Oracle Login: username={username:?}");
                self.username = Some(username.clone());
                Ok(ProtocolEvent::Login { username })
            }
            _ => Ok(ProtocolEvent::Opaque),
        }
    }
}

/// Decode a Pascal-style length-prefixed string: byte [0] is length `n`
/// (0..255); if `n == 0xFE` a 4-byte little-endian length follows. Returns
/// the payload and the number of bytes consumed.
fn pascal_string(buf: &[u8]) -> Result<(Vec<u8>, usize), ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::TruncatedField("pascal string missing length byte".into()));
    }
    let (len, header_len) = if buf[0] == 0xFE {
        if buf.len() < 5 {
            return Err(ProtocolError::TruncatedField("pascal string 4-byte length truncated".into()));
        }
        let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        (len, 5)
    } else {
        (buf[0] as usize, 1)
    };
    if buf.len() < header_len + len {
        return Err(ProtocolError::TruncatedField("pascal string payload truncated".into()));
    }
    Ok((buf[header_len..header_len + len].to_vec(), header_len + len))
}

impl DialectCodec for OracleCodec {
    fn scan(&self, buf: &[u8], _direction: Direction) -> FrameScan {
        self.rule.scan(buf)
    }

    fn decode(&mut self, frame: &Frame, _direction: Direction) -> Result<ProtocolEvent, ProtocolError> {
        match frame.kind {
            PACKET_TYPE_CONNECT => self.decode_connect(&frame.bytes),
            PACKET_TYPE_DATA => {
                if frame.bytes.len() < 8 {
                    return Err(ProtocolError::TruncatedField("Data packet shorter than TNS header".into()));
                }
                self.decode_data(&frame.bytes[8..])
            }
            other => {
                warn!("Oracle: unrecognised packet type 0x{other:02x}, passing through");
                Ok(ProtocolEvent::Opaque)
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
        "oracle"
    }
}
