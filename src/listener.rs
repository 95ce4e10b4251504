//! Accept loop: binds the configured listen address, dials the backend for
//! each accepted client, and spawns one Session Proxy task per connection
//! (§5: "one independent task per accepted client connection").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dialect::new_codec;
use crate::policy::PolicyEngine;
use crate::session::{self, SessionDeps};
use crate::stream::Stream;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs until `shutdown` resolves, then stops accepting new connections and
/// returns; in-flight sessions are left to finish on their own (§5: "allows
/// in-flight sessions to terminate naturally").
pub async fn serve(
    config: Arc<Config>,
    policy_template: Arc<PolicyEngineFactory>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: impl std::future::Future<Output = ()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), target = %config.target_addr(), db_type = %config.db_type, "listening");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, refusing new connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (client_stream, client_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
                let config = config.clone();
                let policy_template = policy_template.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_one(conn_id, client_stream, client_addr, config, policy_template, tls_acceptor).await {
                        warn!(conn_id, error = %e, "connection setup failed");
                    }
                });
            }
        }
    }
}

async fn accept_one(
    conn_id: u64,
    client_stream: TcpStream,
    client_addr: SocketAddr,
    config: Arc<Config>,
    policy_template: Arc<PolicyEngineFactory>,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    debug!(conn_id, peer = %client_addr, "accepted connection");

    let server_stream = match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(config.target_addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(conn_id, target = %config.target_addr(), error = %e, "failed to connect to backend");
            return Err(e);
        }
        Err(_) => {
            error!(conn_id, target = %config.target_addr(), "timed out connecting to backend");
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "backend connect timeout"));
        }
    };

    // `Config::parse` rejects `tls_cert`/`tls_key` for any dialect but
    // Oracle, so `tls_acceptor` is only ever `Some` here for an Oracle
    // listener (§6).
    let client: Box<dyn Stream> = match tls_acceptor {
        Some(acceptor) => {
            let upgraded = crate::tls::upgrade(&acceptor, client_stream).await?;
            Box::new(upgraded)
        }
        None => Box::new(client_stream),
    };

    let codec = new_codec(config.db_type);
    let policy = policy_template.build();
    let deps = SessionDeps { codec, policy };

    session::run_guarded(conn_id, client, server_stream, client_addr.ip(), deps).await;
    Ok(())
}

/// Everything needed to build a fresh `PolicyEngine` per session without
/// re-opening the store or re-spawning the training writer. The store,
/// training-queue sender, and action are shared; only the struct wrapper is
/// per-session.
pub struct PolicyEngineFactory {
    pub mode: crate::policy::Mode,
    pub store: Arc<crate::store::FingerprintStore>,
    pub training_tx: tokio::sync::mpsc::Sender<crate::policy::TrainingJob>,
    pub action: Option<Arc<dyn crate::action::Action>>,
}

impl PolicyEngineFactory {
    fn build(&self) -> PolicyEngine {
        PolicyEngine {
            mode: self.mode,
            store: self.store.clone(),
            training_tx: self.training_tx.clone(),
            action: self.action.clone(),
        }
    }
}
