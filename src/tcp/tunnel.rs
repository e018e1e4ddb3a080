use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, warn};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::http::Request;

/// Handle CONNECT requests: open a connection to the requested authority and
/// blindly move bytes between it and the client until both directions are
/// done.
///
/// The client connection is left open, closing it is up to the caller. The
/// destination connection is closed when returning, on all paths. `replied`
/// is set once the tunnel is established.
pub(crate) async fn handle_connect(
    conn: &mut BufReader<TcpStream>,
    req: &Request,
    replied: &mut bool,
) -> Result<()> {
    let dest = req.tunnel_authority()?;

    let mut backend = TcpStream::connect((dest.host.as_str(), dest.port))
        .await
        .map_err(|e| anyhow!("Could not connect to '{dest}': {e}"))?;
    debug!("Connected to {dest}");

    // Any 2xx response means the tunnel mode starts right after the empty
    // line ending its head (RFC 9110, section 9.3.6).
    *replied = true;
    conn.get_mut()
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    // The client might not have waited for our response before starting
    // talking to the destination.
    let pending = conn.buffer().len();
    if pending > 0 {
        backend.write_all(conn.buffer()).await?;
        conn.consume(pending);
    }

    // Both ends might stay idle for long periods of time.
    let keep_alive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    socket2::SockRef::from(conn.get_ref()).set_tcp_keepalive(&keep_alive)?;
    socket2::SockRef::from(&backend).set_tcp_keepalive(&keep_alive)?;

    let (mut client_rx, mut client_tx) = conn.get_mut().split();
    let (mut backend_rx, mut backend_tx) = backend.split();

    debug!("Starting tunneling the connection");
    let (up, down) = tokio::join!(
        transfer(&mut client_rx, &mut backend_tx, "client to destination"),
        transfer(&mut backend_rx, &mut client_tx, "destination to client"),
    );
    debug!("Tunnel closed ({up} bytes sent, {down} bytes received)");

    Ok(())
}

/// Copy everything from `src` to `dst` until `src` reaches EOF, then
/// half-close `dst`. Failures only end this direction.
async fn transfer<R, W>(src: &mut R, dst: &mut W, direction: &str) -> u64
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = match io::copy(src, dst).await {
        Ok(copied) => copied,
        Err(e) => {
            warn!("Tunnel {direction}: {e}");
            0
        }
    };

    if let Err(e) = dst.shutdown().await {
        match e.kind() {
            // Ignore error if the socket is already closed.
            io::ErrorKind::NotConnected => (),
            _ => debug!("Tunnel {direction}: could not shut down: {e}"),
        }
    }

    copied
}
