use anyhow::{Result, anyhow};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap,
    body::{Body as _, Incoming},
    header::{self, HeaderName},
};
use log::{debug, info, trace};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use crate::{
    body::{self, Body, Framing},
    client::{self, Outbound},
    config::Config,
    http::{self, Headers, Method, Request},
};

/// Hop-by-hop headers, never passed along. We use one connection per request
/// and don't support upgrades.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Upgrade",
];

/// Handle GET, HEAD and POST requests: send the request to the origin server
/// and stream its response back to the client. `replied` is set once the
/// response head starts being written to the client.
pub(crate) async fn handle_request<S>(
    config: &Config,
    conn: &mut BufReader<S>,
    req: &Request,
    replied: &mut bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (dest, path) = req.destination()?;
    let headers = outbound_headers(req, &dest.to_string());

    let framing = match req.method {
        Method::Head => Framing::Empty,
        _ => Framing::for_request(&req.headers)?,
    };
    let (tx, outbound) = match framing {
        Framing::Empty => (None, Outbound::empty()),
        _ => {
            let (tx, outbound) = Outbound::channel();
            (Some(tx), outbound)
        }
    };
    let request = client::request(&req.method, &path, &headers, outbound)?;

    let (mut sender, origin) = client::connect(&dest).await?;

    // The client might be waiting for our go before sending the body. We ask
    // for the whole body anyway, so answer right away.
    if tx.is_some() && expects_continue(&req.headers) {
        conn.get_mut()
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await?;
    }

    let exchange = async move {
        let sending = sender.send_request(request);
        let resp = match tx {
            Some(tx) => {
                let (sent, resp) =
                    tokio::join!(forward_body(Body::new(&mut *conn, framing), tx), sending);
                sent?;
                resp
            }
            None => sending.await,
        }
        .map_err(|e| anyhow!("Request to '{dest}' failed: {e}"))?;

        write_response(config, conn.get_mut(), resp, replied).await
    };

    // The origin connection is driven until the exchange is over.
    let (ret, origin) = tokio::join!(exchange, origin);
    if let Err(e) = origin {
        debug!("Origin connection: {e}");
    }
    ret
}

/// Pull the request body from the client and feed it to the outbound request.
async fn forward_body<R>(mut body: Body<R>, tx: mpsc::Sender<Result<Bytes>>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut forwarded = 0;
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                forwarded += chunk.len();
                // The outbound request is gone, the origin is done with it.
                if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // Abort the outbound request, it must not look complete.
                let _ = tx.send(Err(anyhow!("request body interrupted"))).await;
                return Err(e);
            }
        }
    }
    trace!("Forwarded {forwarded} bytes of request body");
    Ok(())
}

/// Write the origin response to the client, re-framing its body chunks when
/// it was chunked.
async fn write_response<W>(
    config: &Config,
    w: &mut W,
    resp: hyper::Response<Incoming>,
    replied: &mut bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = client::reason(&resp);
    let (parts, mut incoming) = resp.into_parts();
    info!("{} {reason}", parts.status.as_u16());

    // Responses to HEAD requests (and 204, 304) have no body to re-frame.
    let chunked = is_chunked(&parts.headers) && !incoming.is_end_stream();

    // A proxy MUST send an appropriate Via header field in each message that
    // it forwards (RFC 9110, section 7.6.3).
    let upstream = parts
        .headers
        .get_all(header::VIA)
        .iter()
        .filter_map(|v| v.to_str().ok());
    let mut head = format!("HTTP/1.1 {} {reason}\r\n", parts.status.as_u16());
    head.push_str(&format!("Via: {}\r\n", http::via(&config.via, upstream)));
    response_headers(&parts.headers, chunked)
        .for_each(|(name, value)| head.push_str(&format!("{name}: {value}\r\n")));
    head.push_str("Connection: close\r\n\r\n");

    // From now on the client can't be told about failures anymore.
    *replied = true;
    w.write_all(head.as_bytes()).await?;

    let mut forwarded = 0;
    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(|e| anyhow!("Response body interrupted: {e}"))?;
        // Trailers are dropped.
        if let Ok(data) = frame.into_data() {
            match chunked {
                true => body::write_chunk(w, &data).await?,
                false => w.write_all(&data).await?,
            }
            forwarded += data.len();
        }
    }
    if chunked {
        body::write_last_chunk(w).await?;
    }
    w.flush().await?;
    debug!("Forwarded {forwarded} bytes of response body");

    Ok(())
}

/// Headers sent to the origin server: the client ones, first value winning,
/// minus hop-by-hop headers.
fn outbound_headers(req: &Request, authority: &str) -> Headers {
    let mut headers = req.headers.dedup();

    // Headers the client asked to remove on the first hop.
    if let Some(listed) = req.headers.get("Connection") {
        listed.split(',').for_each(|name| headers.remove(name.trim()));
    }
    HOP_BY_HOP.iter().for_each(|name| headers.remove(name));
    // Answered locally, the origin gets the full request at once.
    headers.remove("Expect");

    if req.method == Method::Head {
        headers.remove("Content-Length");
        headers.remove("Transfer-Encoding");
    } else if headers.contains("Transfer-Encoding") {
        headers.remove("Content-Length");
    }
    if !headers.contains("Host") {
        headers.push("Host", authority);
    }
    headers.push("Connection", "close");

    headers
}

/// Response headers passed along to the client, minus hop-by-hop ones and
/// Via (merged separately). A re-framed body has no length.
fn response_headers(
    headers: &HeaderMap,
    chunked: bool,
) -> impl Iterator<Item = (&HeaderName, String)> {
    let listed = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();

    headers
        .iter()
        .filter(move |(name, _)| {
            let name = name.as_str();
            !(name == "via"
                || HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
                || listed.iter().any(|l| l == name)
                || (chunked && name == "content-length"))
        })
        .map(|(name, value)| (name, String::from_utf8_lossy(value.as_bytes()).into_owned()))
}

/// Is `chunked` the final transfer coding of a response?
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

fn expects_continue(headers: &Headers) -> bool {
    headers
        .get("Expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}
