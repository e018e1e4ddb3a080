use std::{fmt, str};

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::{Host, Url};

use crate::error::Error;

/// Max size of a message head (start line + headers). 8KB is the limit size
/// on many web servers.
pub(crate) const MAX_HEAD_LEN: usize = 8192;
/// Max number of headers in a message head.
pub(crate) const MAX_HEADERS: usize = 64;

/// Request methods the proxy knows about. Anything else is kept around for
/// logging purposes only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Method {
    Connect,
    Get,
    Head,
    Post,
    Unsupported(String),
}

impl Method {
    fn from(name: &str) -> Self {
        match name {
            "CONNECT" => Self::Connect,
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            x => Self::Unsupported(x.to_string()),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Unsupported(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header multimap. Names are compared case-insensitively and the
/// first occurrence wins on lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Headers(Vec<(String, String)>);

impl Headers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn from_parsed(headers: &[httparse::Header]) -> Self {
        Self(
            headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect(),
        )
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Value of the first `name` header, if any.
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Values of all the `name` headers, in order.
    pub(crate) fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Copy of the headers keeping only the first occurrence of each name.
    pub(crate) fn dedup(&self) -> Self {
        let mut headers = Self::new();
        self.iter().for_each(|(name, value)| {
            if !headers.contains(name) {
                headers.push(name, value);
            }
        });
        headers
    }

    /// Is `chunked` the final transfer coding?
    pub(crate) fn is_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last()
            .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
    }

    /// Declared body length. Repeated Content-Length headers must agree.
    pub(crate) fn content_length(&self) -> Result<Option<u64>> {
        let mut length = None;
        for value in self.get_all("Content-Length").flat_map(|v| v.split(',')) {
            let value = value.trim();
            let parsed = match value.bytes().all(|b| b.is_ascii_digit()) {
                true => value.parse::<u64>().ok(),
                false => None,
            }
            .ok_or_else(|| anyhow!(Error::Parse(format!("invalid Content-Length ({value})"))))?;

            match length {
                Some(length) if length != parsed => {
                    bail!(Error::Parse("conflicting Content-Length headers".to_string()))
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }
}

/// Read a message head, up to and including the empty line ending it.
/// Leading empty lines are skipped.
pub(crate) async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    loop {
        let limit = MAX_HEAD_LEN.saturating_sub(head.len());
        if limit == 0 {
            bail!(Error::Parse(format!(
                "message head larger than {MAX_HEAD_LEN} bytes"
            )));
        }

        let start = head.len();
        if (&mut *reader)
            .take(limit as u64)
            .read_until(b'\n', &mut head)
            .await?
            == 0
        {
            bail!(Error::Parse(
                "connection closed before the message head was complete".to_string()
            ));
        }

        // Line truncated by the size limit, the next iteration reports it.
        if !head.ends_with(b"\n") {
            continue;
        }

        if let b"\r\n" | b"\n" = &head[start..] {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

/// Parsed request head. The body, if any, is left in the connection.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) target: String,
    /// HTTP/1.x minor version.
    pub(crate) version: u8,
    pub(crate) headers: Headers,
}

impl Request {
    /// Read and parse a request head from a connection.
    pub(crate) async fn parse<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let head = read_head(reader).await?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => (),
            Ok(httparse::Status::Partial) => {
                bail!(Error::Parse("incomplete request head".to_string()))
            }
            Err(e) => bail!(Error::Parse(format!("invalid request head ({e})"))),
        }

        match (req.method, req.path, req.version) {
            (Some(method), Some(target), Some(version)) => Ok(Self {
                method: Method::from(method),
                target: target.to_string(),
                version,
                headers: Headers::from_parsed(req.headers),
            }),
            _ => bail!(Error::Parse("incomplete request line".to_string())),
        }
    }

    pub(crate) fn request_line(&self) -> String {
        format!("{} {} HTTP/1.{}", self.method, self.target, self.version)
    }

    /// Tunnel destination of a CONNECT request. The Host header is preferred
    /// over the request target, both being in the authority form.
    pub(crate) fn tunnel_authority(&self) -> Result<Authority> {
        Authority::parse(self.headers.get("Host").unwrap_or(&self.target), 443)
    }

    /// Origin server and path to forward a non-CONNECT request to.
    pub(crate) fn destination(&self) -> Result<(Authority, String)> {
        // Origin form, the request was sent as if we were the server.
        if self.target.starts_with('/') {
            let host = self
                .headers
                .get("Host")
                .ok_or_else(|| anyhow!(Error::Parse("missing Host header".to_string())))?;
            return Ok((Authority::parse(host, 80)?, self.target.clone()));
        }

        let url = Url::parse(&self.target)
            .map_err(|e| anyhow!(Error::Parse(format!("invalid target {} ({e})", self.target))))?;
        if url.scheme() != "http" {
            bail!("Cannot forward {} requests", url.scheme());
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => bail!(Error::Parse(format!("no host in {}", self.target))),
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok((Authority { host, port }, path))
    }
}

/// Host and port pair, as found in `host:port` authorities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Authority {
    /// Hostname or IP address; IPv6 addresses are stored without brackets.
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Authority {
    /// Parse an authority, using `default_port` if none is given.
    pub(crate) fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();

        let (host, port) = match input.strip_prefix('[') {
            // IPv6 literal.
            Some(rest) => match rest.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, port)) => match port.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => bail!(Error::Parse(format!("invalid authority {input}"))),
                },
                None => bail!(Error::Parse(format!("invalid authority {input}"))),
            },
            None => match input.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            },
        };

        if host.is_empty() {
            bail!(Error::Parse(format!(
                "{input} requires an address/hostname part"
            )));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|e| {
                anyhow!(Error::Parse(format!("{input} has an invalid port ({e})")))
            })?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.contains(':') {
            true => write!(f, "[{}]:{}", self.host, self.port),
            false => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Via header value for a forwarded response: our identifier, followed by
/// whatever proxies the upstream response already went through (the values
/// of its Via headers, in order).
pub(crate) fn via<'a, I>(identifier: &'a str, upstream: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    std::iter::once(identifier)
        .chain(upstream)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(input: &[u8]) -> Result<Request> {
        let mut reader = input;
        Request::parse(&mut reader).await
    }

    #[tokio::test]
    async fn request() {
        let req = parse(
            b"GET http://example.net/file?a=1 HTTP/1.1\r\nHost: example.net\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "http://example.net/file?a=1");
        assert_eq!(req.version, 1);
        assert_eq!(req.headers.get("host"), Some("example.net"));
        assert_eq!(req.headers.get("ACCEPT"), Some("*/*"));
        assert_eq!(
            req.request_line(),
            "GET http://example.net/file?a=1 HTTP/1.1"
        );

        let req = parse(b"\r\nCONNECT example.net:443 HTTP/1.1\r\nHost: example.net:443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, Method::Connect);

        let req = parse(b"TRACE / HTTP/1.0\n\n").await.unwrap();
        assert_eq!(req.method, Method::Unsupported("TRACE".to_string()));
        assert_eq!(req.request_line(), "TRACE / HTTP/1.0");
    }

    #[tokio::test]
    async fn body_left_in_reader() {
        let mut reader: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let req = Request::parse(&mut reader).await.unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(reader, b"body");
    }

    #[tokio::test]
    async fn invalid_requests() {
        let is_parse_error = |ret: Result<Request>| {
            matches!(
                ret.unwrap_err().downcast_ref::<Error>(),
                Some(Error::Parse(_))
            )
        };

        assert!(is_parse_error(parse(b"").await));
        assert!(is_parse_error(parse(b"GET / HTTP/1.1\r\nHost: foo").await));
        assert!(is_parse_error(parse(b"garbage\r\n\r\n").await));
        assert!(is_parse_error(
            parse(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").await
        ));

        let mut big = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_HEAD_LEN));
        big.extend(b"\r\n\r\n");
        assert!(is_parse_error(parse(&big).await));

        let mut many = b"GET / HTTP/1.1\r\n".to_vec();
        (0..=MAX_HEADERS).for_each(|i| many.extend(format!("X-{i}: {i}\r\n").as_bytes()));
        many.extend(b"\r\n");
        assert!(is_parse_error(parse(&many).await));
    }

    #[test]
    fn headers() {
        let mut headers = Headers::new();
        headers.push("Accept", "text/html");
        headers.push("X-Dup", "first");
        headers.push("accept", "*/*");
        headers.push("x-dup", "second");

        assert_eq!(headers.get("ACCEPT"), Some("text/html"));
        assert_eq!(headers.get("x-dup"), Some("first"));
        assert_eq!(
            headers.get_all("X-Dup").collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(headers.get("Host").is_none());

        let dedup = headers.dedup();
        assert_eq!(
            dedup.iter().collect::<Vec<_>>(),
            vec![("Accept", "text/html"), ("X-Dup", "first")]
        );

        headers.remove("x-DUP");
        assert!(!headers.contains("X-Dup"));
        assert_eq!(headers.iter().count(), 2);
    }

    #[test]
    fn framing_headers() {
        let mut headers = Headers::new();
        assert!(!headers.is_chunked());
        assert_eq!(headers.content_length().unwrap(), None);

        headers.push("Transfer-Encoding", "gzip, Chunked");
        assert!(headers.is_chunked());
        headers.push("Transfer-Encoding", "gzip");
        assert!(!headers.is_chunked());

        let mut headers = Headers::new();
        headers.push("Content-Length", "42");
        headers.push("Content-Length", "42");
        assert_eq!(headers.content_length().unwrap(), Some(42));
        headers.push("Content-Length", "43");
        assert!(headers.content_length().is_err());

        let mut headers = Headers::new();
        headers.push("Content-Length", "+42");
        assert!(headers.content_length().is_err());
    }

    #[test]
    fn authority() {
        assert_eq!(
            Authority::parse("example.net:8443", 443).unwrap(),
            Authority {
                host: "example.net".to_string(),
                port: 8443
            }
        );
        assert_eq!(Authority::parse("example.net", 443).unwrap().port, 443);

        let v6 = Authority::parse("[::1]:8080", 80).unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.port, 8080);
        assert_eq!(v6.to_string(), "[::1]:8080");
        assert_eq!(Authority::parse("[::1]", 80).unwrap().port, 80);

        assert!(Authority::parse(":443", 443).is_err());
        assert!(Authority::parse("example.net:https", 443).is_err());
        assert!(Authority::parse("foo:bar:443", 443).is_err());
        assert!(Authority::parse("[::1", 443).is_err());
        assert!(Authority::parse("[::1]443", 443).is_err());
    }

    #[tokio::test]
    async fn destinations() {
        let req = parse(b"CONNECT example.net:443 HTTP/1.1\r\nHost: example.org:8443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.tunnel_authority().unwrap().to_string(), "example.org:8443");

        let req = parse(b"CONNECT example.net:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.tunnel_authority().unwrap().to_string(), "example.net:443");

        let req = parse(b"GET http://example.net:8080/a/b?c=d HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let (dest, path) = req.destination().unwrap();
        assert_eq!(dest.to_string(), "example.net:8080");
        assert_eq!(path, "/a/b?c=d");

        let req = parse(b"GET http://[::1] HTTP/1.1\r\n\r\n").await.unwrap();
        let (dest, path) = req.destination().unwrap();
        assert_eq!(dest.host, "::1");
        assert_eq!(dest.port, 80);
        assert_eq!(path, "/");

        let req = parse(b"GET /file HTTP/1.1\r\nHost: example.net\r\n\r\n")
            .await
            .unwrap();
        let (dest, path) = req.destination().unwrap();
        assert_eq!(dest.to_string(), "example.net:80");
        assert_eq!(path, "/file");

        let req = parse(b"GET /file HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(req.destination().is_err());

        let req = parse(b"GET https://example.net/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(req.destination().is_err());
    }

    #[test]
    fn via_chain() {
        assert_eq!(via("1.1 ForwardProxy", Vec::new()), "1.1 ForwardProxy");
        assert_eq!(
            via("1.1 ForwardProxy", ["1.0 fred", "1.1 p.example.net"]),
            "1.1 ForwardProxy, 1.0 fred, 1.1 p.example.net"
        );

        // Borrowed values, as found in a header map.
        let upstream = vec!["1.0 fred".to_string()];
        assert_eq!(
            via("1.1 test-proxy", upstream.iter().map(String::as_str)),
            "1.1 test-proxy, 1.0 fred"
        );
    }
}
