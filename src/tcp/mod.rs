//! Layer-4 routing: SNI peeking, TCP routers, and the bidirectional proxy.

mod proxy;
mod router;
mod rule;
mod service;
mod sni;

pub use proxy::TcpProxy;
pub use router::{TcpRoute, TcpRouteTls, TcpRouter};
pub use rule::TcpRule;
pub use service::TcpServiceManager;
pub use sni::{peek_client_hello, Peeked};

use crate::proxy::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A client connection handed to a TCP handler: a raw socket, or the
/// decrypted side of a terminated TLS session.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Serves one accepted connection until both directions are done.
pub trait TcpHandler: Send + Sync {
    fn serve_tcp(&self, conn: BoxConnection) -> BoxFuture<'_, ()>;
}

pub type BoxTcpHandler = Arc<dyn TcpHandler>;
