use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use log::{debug, error, info};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
    time,
};

use crate::{
    config::Config,
    context,
    error::{self, Error, Status},
    http::{Method, Request},
};

/// Time allowed for sending an error response and closing the connection,
/// once the request was processed (or gave up).
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Process a client connection: one request, then the connection is closed.
///
/// Processing runs under the configured deadline. Whatever fails (including
/// the deadline), the error is logged and reported to the client with a
/// status only, unless a response was already started: the connection is then
/// just closed.
pub(crate) async fn handle_stream(config: &Config, stream: TcpStream) {
    let mut conn = BufReader::new(stream);
    let mut replied = false;

    // Dropping the processing future on timeout aborts whatever it was
    // waiting on and closes the destination connection it might own.
    let ret = match time::timeout(config.timeout, process(config, &mut conn, &mut replied)).await
    {
        Ok(ret) => ret,
        Err(_) => Err(anyhow!(Error::Timeout)),
    };

    let mut stream = conn.into_inner();

    if let Err(e) = ret {
        if replied {
            // Anything written now would end up in the middle of the body.
            error!("Response interrupted: {e:#}");
            debug!("{e:?}");
        } else {
            let status = Status::from_error(&e);
            error!("{status}: {e:#}");
            debug!("{e:?}");
            respond(config, &mut stream, status).await;
        }
    }

    // Closing happens when dropping the stream, shutting it down first lets
    // the client know we're done even if the socket lingers.
    if let Ok(Err(e)) = time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        debug!("Could not shut down client connection: {e}");
    }
    debug!("Connection closed");
}

/// Send an error response. Best effort, the client might be gone already.
async fn respond(config: &Config, stream: &mut TcpStream, status: Status) {
    match time::timeout(CLOSE_TIMEOUT, error::respond(stream, status, &config.via)).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => debug!("Could not send error response: {e}"),
        Err(_) => debug!("Could not send error response: timed out"),
    }
}

/// Read the request and route it. `replied` is set by the handlers once they
/// started writing their response.
async fn process(
    config: &Config,
    conn: &mut BufReader<TcpStream>,
    replied: &mut bool,
) -> Result<()> {
    let req = Request::parse(conn).await?;

    // The context is not mandatory.
    let _ = context::set_target(&req.target);
    info!("{}", req.request_line());

    match req.method {
        Method::Connect => super::tunnel::handle_connect(conn, &req, replied).await,
        Method::Get | Method::Head | Method::Post => {
            super::http::handle_request(config, conn, &req, replied).await
        }
        Method::Unsupported(ref method) => bail!(Error::UnsupportedMethod(method.clone())),
    }
}
