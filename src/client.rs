use std::{
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use hyper::{
    body::{Body, Frame, Incoming, SizeHint},
    client::conn::http1,
    ext::ReasonPhrase,
};
use hyper_util::rt::TokioIo;
use log::debug;
use tokio::{net::TcpStream, sync::mpsc};

use crate::{
    body::MAX_CHUNK_LEN,
    http::{Authority, Headers, Method},
};

/// Handle sending the request to the origin server.
pub(crate) type Sender = http1::SendRequest<Outbound>;
/// Connection to the origin server. It must be polled (alongside the
/// exchange) until the response body was read.
pub(crate) type Connection = http1::Connection<TokioIo<TcpStream>, Outbound>;

/// Body of a request sent to an origin server. Data is fed through a channel
/// while the request is in flight; sending an error aborts the request.
pub(crate) struct Outbound {
    rx: Option<mpsc::Receiver<Result<Bytes>>>,
}

impl Outbound {
    pub(crate) fn empty() -> Self {
        Self { rx: None }
    }

    pub(crate) fn channel() -> (mpsc::Sender<Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Self { rx: Some(rx) })
    }
}

impl Body for Outbound {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.as_mut() {
            Some(rx) => rx
                .poll_recv(cx)
                .map(|data| data.map(|data| data.map(Frame::data))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.rx {
            Some(_) => SizeHint::default(),
            None => SizeHint::with_exact(0),
        }
    }
}

/// Open an HTTP/1.1 connection to `dest`.
pub(crate) async fn connect(dest: &Authority) -> Result<(Sender, Connection)> {
    let stream = TcpStream::connect((dest.host.as_str(), dest.port))
        .await
        .map_err(|e| anyhow!("Could not connect to '{dest}': {e}"))?;
    stream.set_nodelay(true)?;
    debug!("Connected to origin {dest}");

    let (sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        // Bounds the size of the response body pieces as well.
        .max_buf_size(MAX_CHUNK_LEN)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| anyhow!("Could not talk to '{dest}': {e}"))?;

    Ok((sender, conn))
}

/// Build a request for an origin server. `path` is in the origin form.
pub(crate) fn request(
    method: &Method,
    path: &str,
    headers: &Headers,
    body: Outbound,
) -> Result<hyper::Request<Outbound>> {
    let mut builder = hyper::Request::builder().method(method.as_str()).uri(path);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(body)?)
}

/// Reason phrase of an origin response, as sent when it isn't the
/// canonical one.
pub(crate) fn reason(resp: &hyper::Response<Incoming>) -> String {
    match resp.extensions().get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => resp
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    }
}
