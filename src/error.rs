use std::fmt;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Failures that need a specific answer to the client. Raised inside
/// `anyhow::Error`s and recovered with a downcast once the connection is done
/// being processed; anything else is reported as a gateway failure.
#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("deadline exceeded")]
    Timeout,
    #[error("method not implemented ({0})")]
    UnsupportedMethod(String),
    #[error("malformed message: {0}")]
    Parse(String),
}

/// Status lines the proxy generates on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    BadGateway,
    NotImplemented,
    GatewayTimeout,
}

impl Status {
    /// Classify an error.
    pub(crate) fn from_error(e: &anyhow::Error) -> Self {
        match e.downcast_ref::<Error>() {
            Some(Error::Timeout) => Self::GatewayTimeout,
            Some(Error::UnsupportedMethod(_)) => Self::NotImplemented,
            Some(Error::Parse(_)) | None => Self::BadGateway,
        }
    }

    pub(crate) fn code(&self) -> u16 {
        match self {
            Self::BadGateway => 502,
            Self::NotImplemented => 501,
            Self::GatewayTimeout => 504,
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::BadGateway => "Bad Gateway",
            Self::NotImplemented => "Not Implemented",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Write a body-less response for `status`. The error details are never sent
/// to the client.
pub(crate) async fn respond<W>(w: &mut W, status: Status, via: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!("HTTP/1.1 {status}\r\nVia: {via}\r\n\r\n");
    w.write_all(response.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            Status::from_error(&anyhow!(Error::Timeout)),
            Status::GatewayTimeout
        );
        assert_eq!(
            Status::from_error(&anyhow!(Error::UnsupportedMethod("TRACE".to_string()))),
            Status::NotImplemented
        );
        assert_eq!(
            Status::from_error(&anyhow!(Error::Parse("bad request line".to_string()))),
            Status::BadGateway
        );
        assert_eq!(
            Status::from_error(&anyhow!("Connection refused")),
            Status::BadGateway
        );

        // Classification survives added context.
        let e = Err::<(), _>(Error::Timeout)
            .context("Could not connect to 'example.net:443'")
            .unwrap_err();
        assert_eq!(Status::from_error(&e), Status::GatewayTimeout);
    }

    #[test]
    fn status_lines() {
        assert_eq!(Status::BadGateway.to_string(), "502 Bad Gateway");
        assert_eq!(Status::NotImplemented.to_string(), "501 Not Implemented");
        assert_eq!(Status::GatewayTimeout.to_string(), "504 Gateway Timeout");
    }

    #[tokio::test]
    async fn response() {
        let mut out = Vec::new();
        respond(&mut out, Status::NotImplemented, "1.1 ForwardProxy")
            .await
            .unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 501 Not Implemented\r\nVia: 1.1 ForwardProxy\r\n\r\n"
        );
    }
}
