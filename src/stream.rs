//! A socket the Session Proxy can read from and write to without caring
//! whether it is plain TCP or a TLS-upgraded Oracle connection (§9: "the
//! core only needs an optional upgrade capability").

use tokio::io::{AsyncRead, AsyncWrite};

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
