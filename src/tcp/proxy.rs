use super::{BoxConnection, TcpHandler};
use crate::proxy::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error};

/// Buffer size for TCP proxying
const BUFFER_SIZE: usize = 32 * 1024;

/// Read deadline armed on a connection once the opposite direction is done.
type Deadline = Option<Instant>;

/// Forwards a connection to one fixed backend address.
pub struct TcpProxy {
    address: String,
    /// Set when the address is a literal IP, so no lookup is needed.
    resolved: Option<SocketAddr>,
    termination_delay: Option<Duration>,
    dial_timeout: Duration,
}

impl TcpProxy {
    /// `termination_delay` of `None` disables the read deadline: the
    /// remaining direction then runs until its own EOF.
    pub fn new(address: &str, termination_delay: Option<Duration>, dial_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            resolved: address.parse().ok(),
            termination_delay,
            dial_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }
        // Hostnames are looked up on every connection to follow DNS changes
        tokio::net::lookup_host(&self.address)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let addr = self.resolve().await?;
        match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timeout")),
        }
    }

    async fn proxy(&self, client: BoxConnection) {
        let backend = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("TCP: Failed to connect to backend {}: {}", self.address, e);
                return;
            }
        };
        let _ = backend.set_nodelay(true);

        debug!("TCP: Forwarding to backend {}", self.address);

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = backend.into_split();

        let (client_deadline_tx, client_deadline) = watch::channel::<Deadline>(None);
        let (backend_deadline_tx, backend_deadline) = watch::channel::<Deadline>(None);

        // Both directions live in this future, so dropping it closes both sockets
        let (upstream, downstream) = tokio::join!(
            copy_half(
                client_read,
                client_deadline,
                backend_write,
                backend_deadline_tx,
                self.termination_delay,
            ),
            copy_half(
                backend_read,
                backend_deadline,
                client_write,
                client_deadline_tx,
                self.termination_delay,
            ),
        );

        match (upstream, downstream) {
            (Err(e), _) | (_, Err(e)) => error!("TCP: Error while forwarding to {}: {}", self.address, e),
            (Ok(sent), Ok(received)) => debug!(
                "TCP: Forwarded {} bytes to and {} bytes from {}",
                sent, received, self.address
            ),
        }

        debug!("TCP: Connection to {} closed", self.address);
    }
}

impl TcpHandler for TcpProxy {
    fn serve_tcp(&self, conn: BoxConnection) -> BoxFuture<'_, ()> {
        Box::pin(self.proxy(conn))
    }
}

/// Copy `src` into `dst` until EOF or error, then half-close `dst` and arm
/// its read deadline so the opposite copy terminates within `delay`.
/// Returns the number of bytes copied.
async fn copy_half<R, W>(
    mut src: R,
    mut src_deadline: watch::Receiver<Deadline>,
    mut dst: W,
    dst_deadline: watch::Sender<Deadline>,
    delay: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = match read_with_deadline(&mut src, &mut buf, &mut src_deadline).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Err(e);
        }
        total += n as u64;
    };

    let _ = dst.shutdown().await;

    if let Some(delay) = delay {
        dst_deadline.send_replace(Some(Instant::now() + delay));
    }

    result
}

async fn read_with_deadline<R>(
    src: &mut R,
    buf: &mut [u8],
    deadline: &mut watch::Receiver<Deadline>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        let current = *deadline.borrow_and_update();

        if let Some(at) = current {
            return match timeout_at(at, src.read(buf)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")),
            };
        }

        tokio::select! {
            result = src.read(buf) => return result,
            changed = deadline.changed() => {
                if changed.is_err() {
                    // The other direction ended without arming a deadline
                    let armed = *deadline.borrow();
                    if armed.is_none() {
                        return src.read(buf).await;
                    }
                }
            }
        }
    }
}
