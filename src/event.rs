use std::fmt;
use std::net::IpAddr;

/// Direction of a message in the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client -> Server
    Frontend,
    /// Server -> Client
    Backend,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Frontend => write!(f, "->"),
            Direction::Backend => write!(f, "<-"),
        }
    }
}

/// Coarse protocol event a Dialect Codec emits for one wire frame. This is
/// the vocabulary the Session Proxy and Policy Engine operate on; finer
/// per-dialect bookkeeping (prepared statements, transaction status, ...)
/// stays private to the codec that needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Connection-establishment message that names the logical database
    /// (Oracle's `SERVICE_NAME=`, Postgres' `database` startup parameter).
    Connect { service_name: String },
    /// Authentication message that names the connecting user.
    Login { username: String },
    /// A SQL statement is about to execute.
    Query { sql: Vec<u8> },
    /// The current client request is complete; the session should end
    /// (Oracle TTC marker, Postgres Terminate).
    EndOfRequest,
    /// Recognised frame that carries no information the firewall acts on.
    Opaque,
}

/// Everything the Policy Engine needs to decide and fingerprint a query.
/// Constructed once per `Query` event.
#[derive(Clone, Debug)]
pub struct QueryContext {
    pub query: Vec<u8>,
    pub database: String,
    pub username: String,
    pub client_ip: IpAddr,
    pub epoch_seconds: u64,
}

impl QueryContext {
    pub fn new(query: Vec<u8>, database: String, username: String, client_ip: IpAddr) -> Self {
        let epoch_seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            query,
            database,
            username,
            client_ip,
            epoch_seconds,
        }
    }
}
