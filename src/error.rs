/// Errors that terminate a single session. Never crosses a session boundary —
/// the listener logs these and keeps accepting (see `SPEC_FULL.md` §7).
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("policy action failed: {0}")]
    Policy(String),

    #[error("per-frame read deadline exceeded")]
    Timeout,
}

/// Malformed or hostile wire-protocol input. Carries a hex dump of the first
/// bytes of the offending frame for the `warning`-level log line.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size ({size} > {max})")]
    OversizedFrame { size: usize, max: usize },

    #[error("truncated length-prefixed field: {0}")]
    TruncatedField(String),

    #[error("malformed startup packet: {0}")]
    MalformedStartup(String),

    #[error("connection ended mid-frame")]
    ShortRead,
}

impl ProtocolError {
    /// Hex dump of up to 64 bytes, for the `warning`-level log line §7 calls for.
    pub fn hex_dump(buf: &[u8]) -> String {
        let n = buf.len().min(64);
        buf[..n].iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
    }
}

/// Store (embedded key/value database) failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("value encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Startup-fatal configuration problems (§7). The CLI boundary maps these to
/// exit code 1.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown db_type: {0}")]
    UnknownDbType(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unreadable config file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unreadable certificate: {0}")]
    Certificate(String),

    #[error("tls_cert/tls_key are only supported for db_type = \"oracle\", got {0:?}")]
    TlsNotSupported(String),
}
