pub mod mysql;
pub mod oracle;
pub mod postgres;

use std::fmt;

use crate::error::ProtocolError;
use crate::event::{Direction, ProtocolEvent};
use crate::frame::{Frame, FrameScan};

/// Which backend dialect a session speaks. Selects the codec constructed for
/// that connection; set once from config and never changed afterward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Oracle,
    MySql,
    Postgres,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbType::Oracle => "oracle",
            DbType::MySql => "mysql",
            DbType::Postgres => "postgres",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DbType {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oracle" => Ok(DbType::Oracle),
            "mysql" => Ok(DbType::MySql),
            "postgres" | "postgresql" => Ok(DbType::Postgres),
            other => Err(crate::error::ConfigError::UnknownDbType(other.to_string())),
        }
    }
}

/// One implementation per supported DBMS. A codec owns the framing rule *and*
/// the small per-connection state machine (`SPEC_FULL.md` §4.2); the Session
/// Proxy drives it with raw bytes from one side of the connection and gets
/// back events plus the state the policy engine needs.
pub trait DialectCodec: Send {
    /// Inspect the buffer's leading bytes for a complete frame, per this
    /// dialect's framing rule. Does not consume anything.
    fn scan(&self, buf: &[u8], direction: Direction) -> FrameScan;

    /// Decode a complete frame, updating internal state (`current_db`,
    /// `username`, prepared-statement tables, ...) and returning the event
    /// the Session Proxy and Policy Engine act on.
    fn decode(&mut self, frame: &Frame, direction: Direction) -> Result<ProtocolEvent, ProtocolError>;

    /// Logical database named by the most recent Connect/Login event, if any.
    fn current_db(&self) -> Option<&str>;

    /// Username named by the most recent Login event, if any.
    fn username(&self) -> Option<&str>;

    fn name(&self) -> &'static str;

    /// Which side speaks first on a fresh connection. Oracle and Postgres
    /// clients open with Connect/StartupMessage, so the default is
    /// `Frontend`; MySQL's server sends an unprompted Initial Handshake
    /// Packet immediately after accept, so that codec overrides this to
    /// `Backend` and the Session Proxy reads from the backend before ever
    /// reading from the client.
    fn initial_direction(&self) -> Direction {
        Direction::Frontend
    }

    /// Offered a chance to answer a startup-phase probe (currently only
    /// Postgres' SSLRequest) without forwarding it upstream. `None` means
    /// "nothing to intercept, forward as usual".
    fn intercept_startup(&mut self, _buf: &[u8], _direction: Direction) -> Option<Vec<u8>> {
        None
    }
}

/// Build the codec for a configured dialect.
pub fn new_codec(db_type: DbType) -> Box<dyn DialectCodec> {
    match db_type {
        DbType::Oracle => Box::new(oracle::OracleCodec::new()),
        DbType::MySql => Box::new(mysql::MySqlCodec::new()),
        DbType::Postgres => Box::new(postgres::PostgresCodec::new()),
    }
}
