//! The Session Proxy: one task per accepted connection, driving the
//! strictly sequential client-read/server-read loop of `SPEC_FULL.md` §4.5.
//! Unlike a full-duplex relay there is no per-session concurrency, so the
//! codec needs no lock — one task owns it start to finish.

use std::net::IpAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::dialect::DialectCodec;
use crate::error::{ProtocolError, SessionError};
use crate::event::{Direction, ProtocolEvent, QueryContext};
use crate::frame::{take_frame, Frame, FrameScan};
use crate::policy::PolicyEngine;
use crate::stream::Stream;

/// Per-frame read deadline. Bounds how long a stalled peer can tie up a task
/// (§5).
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a session needs beyond the two sockets: identical for every
/// connection, so it is built once and shared.
pub struct SessionDeps {
    pub codec: Box<dyn DialectCodec>,
    pub policy: PolicyEngine,
}

/// One accumulate-then-scan buffer per direction, paired with the framing
/// side the Dialect Codec should consult for that direction.
struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    /// Read from `io` until a complete frame is buffered, then take it.
    /// `scan` is called after every read with the accumulated bytes.
    async fn next_frame<R, F>(&mut self, io: &mut R, mut scan: F) -> Result<Frame, SessionError>
    where
        R: tokio::io::AsyncRead + Unpin,
        F: FnMut(&[u8]) -> FrameScan,
    {
        loop {
            match scan(&self.buf) {
                FrameScan::Ready { len, kind } => {
                    let frame = take_frame(&self.buf, len, kind);
                    let _ = self.buf.split_to(len);
                    return Ok(frame);
                }
                FrameScan::Oversized { declared } => {
                    return Err(SessionError::Protocol(ProtocolError::OversizedFrame {
                        size: declared,
                        max: crate::frame::MAX_FRAME_SIZE,
                    }));
                }
                FrameScan::NeedMoreBytes => {
                    let mut chunk = [0u8; 4096];
                    let n = tokio::time::timeout(FRAME_READ_TIMEOUT, io.read(&mut chunk))
                        .await
                        .map_err(|_| SessionError::Timeout)??;
                    if n == 0 {
                        return Err(SessionError::Protocol(ProtocolError::ShortRead));
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Drive one connection to completion. Errors are logged by the caller; this
/// function never panics on protocol input (malformed frames surface as
/// `Err`, not `panic!`).
pub async fn run(
    mut client: Box<dyn Stream>,
    mut server: TcpStream,
    client_ip: IpAddr,
    deps: &mut SessionDeps,
) -> Result<(), SessionError> {
    let mut client_reader = FrameReader::new();
    let mut server_reader = FrameReader::new();

    // MySQL's server greets first: read and forward its Initial Handshake
    // Packet before ever reading from the client (Oracle/Postgres skip this,
    // since their codecs report `Direction::Frontend`).
    if deps.codec.initial_direction() == Direction::Backend {
        let greeting = {
            let codec = &deps.codec;
            server_reader
                .next_frame(&mut server, |buf| codec.scan(buf, Direction::Backend))
                .await?
        };
        if let Err(e) = deps.codec.decode(&greeting, Direction::Backend) {
            warn!(frame = %ProtocolError::hex_dump(&greeting.bytes), "backend greeting decode failed: {e}");
            return Err(SessionError::Protocol(e));
        }
        client.write_all(&greeting.bytes).await?;
    }

    loop {
        // 1. Read a complete frame from the client.
        let client_frame = {
            let codec = &deps.codec;
            client_reader
                .next_frame(&mut client, |buf| codec.scan(buf, Direction::Frontend))
                .await?
        };

        // Give the codec a chance to answer a startup-phase probe (Postgres
        // SSLRequest) without forwarding it upstream.
        if let Some(reply) = deps.codec.intercept_startup(&client_frame.bytes, Direction::Frontend) {
            client.write_all(&reply).await?;
            continue;
        }

        // 2. Hand it to the Dialect Codec.
        let event = match deps.codec.decode(&client_frame, Direction::Frontend) {
            Ok(event) => event,
            Err(e) => {
                warn!(frame = %ProtocolError::hex_dump(&client_frame.bytes), "frontend frame decode failed: {e}");
                return Err(SessionError::Protocol(e));
            }
        };
        debug!(?event, "frontend event");

        // 3. Consult the Policy Engine on Query events.
        if let ProtocolEvent::Query { sql } = &event {
            let ctx = QueryContext::new(
                sql.clone(),
                deps.codec.current_db().unwrap_or("").to_string(),
                deps.codec.username().unwrap_or("").to_string(),
                client_ip,
            );
            let decision = deps.policy.evaluate(&ctx, client.as_mut()).await;
            if decision == crate::policy::Decision::Block {
                info!(database = %ctx.database, username = %ctx.username, "session blocked by policy");
                return Ok(());
            }
        }

        // 4. Write the frame verbatim to the server.
        server.write_all(&client_frame.bytes).await?;

        // 5. EndOfRequest ends the session.
        if event == ProtocolEvent::EndOfRequest {
            return Ok(());
        }

        // 6. Read a complete frame from the server, feed through the codec,
        // forward to the client.
        let server_frame = {
            let codec = &deps.codec;
            server_reader
                .next_frame(&mut server, |buf| codec.scan(buf, Direction::Backend))
                .await?
        };
        let server_event = match deps.codec.decode(&server_frame, Direction::Backend) {
            Ok(event) => event,
            Err(e) => {
                warn!(frame = %ProtocolError::hex_dump(&server_frame.bytes), "backend frame decode failed: {e}");
                return Err(SessionError::Protocol(e));
            }
        };
        debug!(?server_event, "backend event");
        client.write_all(&server_frame.bytes).await?;

        if server_event == ProtocolEvent::EndOfRequest {
            return Ok(());
        }
    }
}

/// Run one session and log the outcome. The panic boundary itself is
/// `tokio::spawn` (§4.5 notes this is "the same place `tokio::spawn` already
/// isolates a panicking task from the rest of the process") — the listener
/// spawns this function and inspects the `JoinHandle` for a panic; this
/// wrapper only needs to turn a clean `Err` into a log line.
pub async fn run_guarded(conn_id: u64, client: Box<dyn Stream>, server: TcpStream, client_ip: IpAddr, mut deps: SessionDeps) {
    match run(client, server, client_ip, &mut deps).await {
        Ok(()) => debug!(conn_id, "session ended cleanly"),
        Err(e) => warn!(conn_id, error = %e, "session ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionOutcome};
    use crate::policy::{Mode, PolicyEngine};
    use crate::store::FingerprintStore;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    const KIND_QUERY: u8 = 1;
    const KIND_END: u8 = 2;
    const KIND_OPAQUE: u8 = 0;

    /// Three-byte header (kind, payload length, reserved) codec used only to
    /// exercise the session loop's control flow independent of any real wire
    /// format.
    struct StubCodec;

    impl DialectCodec for StubCodec {
        fn scan(&self, buf: &[u8], _direction: Direction) -> FrameScan {
            if buf.len() < 3 {
                return FrameScan::NeedMoreBytes;
            }
            let len = 3 + buf[1] as usize;
            if buf.len() < len {
                return FrameScan::NeedMoreBytes;
            }
            FrameScan::Ready { len, kind: buf[0] }
        }

        fn decode(&mut self, frame: &Frame, _direction: Direction) -> Result<ProtocolEvent, ProtocolError> {
            match frame.kind {
                KIND_END => Ok(ProtocolEvent::EndOfRequest),
                KIND_QUERY => Ok(ProtocolEvent::Query { sql: frame.bytes[3..].to_vec() }),
                _ => Ok(ProtocolEvent::Opaque),
            }
        }

        fn current_db(&self) -> Option<&str> {
            Some("testdb")
        }

        fn username(&self) -> Option<&str> {
            Some("tester")
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    /// Same framing as `StubCodec` but reports `Backend` as the side that
    /// speaks first, exercising the MySQL-style greeting path.
    struct ServerFirstStubCodec(StubCodec);

    impl DialectCodec for ServerFirstStubCodec {
        fn scan(&self, buf: &[u8], direction: Direction) -> FrameScan {
            self.0.scan(buf, direction)
        }

        fn decode(&mut self, frame: &Frame, direction: Direction) -> Result<ProtocolEvent, ProtocolError> {
            self.0.decode(frame, direction)
        }

        fn current_db(&self) -> Option<&str> {
            self.0.current_db()
        }

        fn username(&self) -> Option<&str> {
            self.0.username()
        }

        fn name(&self) -> &'static str {
            "stub-server-first"
        }

        fn initial_direction(&self) -> Direction {
            Direction::Backend
        }
    }

    fn query_frame(sql: &[u8]) -> Vec<u8> {
        let mut out = vec![KIND_QUERY, sql.len() as u8, 0];
        out.extend_from_slice(sql);
        out
    }

    fn end_frame() -> Vec<u8> {
        vec![KIND_END, 0, 0]
    }

    fn opaque_frame() -> Vec<u8> {
        vec![KIND_OPAQUE, 0, 0]
    }

    async fn server_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server.unwrap())
    }

    async fn test_deps(mode: Mode) -> (SessionDeps, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FingerprintStore::open(&dir.path().join("t.db")).unwrap());
        let training_tx = crate::policy::spawn_training_writer(store.clone());
        let policy = PolicyEngine { mode, store, training_tx, action: None };
        (SessionDeps { codec: Box::new(StubCodec), policy }, dir)
    }

    #[tokio::test]
    async fn forwards_query_then_ends_on_terminate() {
        let (client_side, mut driver) = duplex(4096);
        let (server_side, mut upstream) = server_pair().await;
        let (deps, _dir) = test_deps(Mode::Learning).await;
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let handle = tokio::spawn(async move {
            let mut deps = deps;
            run(Box::new(client_side), server_side, ip, &mut deps).await
        });

        driver.write_all(&query_frame(b"SELECT 1")).await.unwrap();

        let q = query_frame(b"SELECT 1");
        let mut got = vec![0u8; q.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, q);

        upstream.write_all(&opaque_frame()).await.unwrap();
        let mut got_opaque = vec![0u8; 3];
        driver.read_exact(&mut got_opaque).await.unwrap();
        assert_eq!(got_opaque, opaque_frame());

        driver.write_all(&end_frame()).await.unwrap();
        let mut got_end = vec![0u8; 3];
        upstream.read_exact(&mut got_end).await.unwrap();
        assert_eq!(got_end, end_frame());

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn server_first_dialect_reads_greeting_before_client() {
        let (client_side, mut driver) = duplex(4096);
        let (server_side, mut upstream) = server_pair().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FingerprintStore::open(&dir.path().join("t.db")).unwrap());
        let training_tx = crate::policy::spawn_training_writer(store.clone());
        let policy = PolicyEngine { mode: Mode::Learning, store, training_tx, action: None };
        let mut deps = SessionDeps { codec: Box::new(ServerFirstStubCodec(StubCodec)), policy };
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let handle = tokio::spawn(async move { run(Box::new(client_side), server_side, ip, &mut deps).await });

        // The server greets first; the client must see it before sending
        // anything itself.
        upstream.write_all(&opaque_frame()).await.unwrap();
        let mut got_greeting = vec![0u8; 3];
        driver.read_exact(&mut got_greeting).await.unwrap();
        assert_eq!(got_greeting, opaque_frame());

        driver.write_all(&end_frame()).await.unwrap();
        let mut got_end = vec![0u8; 3];
        upstream.read_exact(&mut got_end).await.unwrap();
        assert_eq!(got_end, end_frame());

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn policy_block_ends_session_without_forwarding_further() {
        struct AlwaysBlock;
        #[async_trait::async_trait]
        impl Action for AlwaysBlock {
            async fn invoke(&self, _client: &mut (dyn crate::stream::Stream + '_)) -> std::io::Result<ActionOutcome> {
                Ok(ActionOutcome::Blocked)
            }
        }

        let (client_side, mut driver) = duplex(4096);
        let (server_side, _upstream) = server_pair().await;
        let (mut deps, _dir) = test_deps(Mode::Protecting).await;
        deps.policy.action = Some(Arc::new(AlwaysBlock));
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let handle = tokio::spawn(async move {
            let mut deps = deps;
            run(Box::new(client_side), server_side, ip, &mut deps).await
        });

        driver.write_all(&query_frame(b"DROP TABLE users")).await.unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
