use std::cmp;

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::Error, http::Headers};

/// Max amount of body data handed out at once. Larger chunks are split.
pub(crate) const MAX_CHUNK_LEN: usize = 64 * 1024;
/// Max length of a chunk size line or of a trailer line.
const MAX_LINE_LEN: u64 = 4096;

/// How a request body is delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body at all.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer-encoding.
    Chunked,
}

impl Framing {
    /// Framing of a request body. Requests without framing headers have no
    /// body.
    pub(crate) fn for_request(headers: &Headers) -> Result<Self> {
        if headers.contains("Transfer-Encoding") {
            return match headers.is_chunked() {
                true => Ok(Self::Chunked),
                false => bail!(Error::Parse(
                    "request body with an unknown transfer-encoding".to_string()
                )),
            };
        }

        Ok(match headers.content_length()? {
            Some(0) | None => Self::Empty,
            Some(len) => Self::Length(len),
        })
    }
}

enum State {
    Length(u64),
    /// Expecting a chunk size line.
    ChunkSize,
    /// Inside a chunk, with this many bytes left.
    ChunkData(u64),
    Done,
}

/// Lazily read request body. Data is pulled from the underlying reader one
/// piece at a time, with the transfer framing removed.
pub(crate) struct Body<R> {
    reader: R,
    state: State,
}

impl<R> Body<R>
where
    R: AsyncBufRead + Unpin,
{
    pub(crate) fn new(reader: R, framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty => State::Done,
            Framing::Length(len) => State::Length(len),
            Framing::Chunked => State::ChunkSize,
        };

        Self { reader, state }
    }

    /// Returns the next piece of body data, or `None` once the body is
    /// complete. Pieces are at most `MAX_CHUNK_LEN` long; with chunked
    /// framing a piece never spans two chunks.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length(0) => self.state = State::Done,
                State::Length(left) => {
                    let data = self.read_some(left).await?;
                    if data.is_empty() {
                        bail!("Connection closed with {left} bytes of body left");
                    }
                    self.state = State::Length(left - data.len() as u64);
                    return Ok(Some(data));
                }
                State::ChunkSize => {
                    self.state = match self.read_chunk_size().await? {
                        0 => {
                            self.skip_trailers().await?;
                            State::Done
                        }
                        len => State::ChunkData(len),
                    };
                }
                State::ChunkData(0) => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        bail!(Error::Parse("missing CRLF after chunk data".to_string()));
                    }
                    self.state = State::ChunkSize;
                }
                State::ChunkData(left) => {
                    let data = self.read_some(left).await?;
                    if data.is_empty() {
                        bail!("Connection closed in the middle of a chunk");
                    }
                    self.state = State::ChunkData(left - data.len() as u64);
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Read whatever is buffered (or the next read), up to `max` bytes. An
    /// empty result means EOF.
    async fn read_some(&mut self, max: u64) -> Result<Vec<u8>> {
        let max = cmp::min(max, MAX_CHUNK_LEN as u64) as usize;
        let buf = self.reader.fill_buf().await?;
        let len = cmp::min(buf.len(), max);
        let data = buf[..len].to_vec();
        self.reader.consume(len);
        Ok(data)
    }

    /// Read a line and strip its line ending.
    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        (&mut self.reader)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut line)
            .await?;

        match line.strip_suffix(b"\n") {
            Some(line) => Ok(String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(line))
                .into_owned()),
            None if line.len() as u64 == MAX_LINE_LEN => {
                bail!(Error::Parse("chunk line too long".to_string()))
            }
            None => bail!("Connection closed in the middle of a chunked body"),
        }
    }

    async fn read_chunk_size(&mut self) -> Result<u64> {
        let line = self.read_line().await?;
        // Chunk extensions are dropped.
        let size = line.split(';').next().unwrap_or_default().trim();
        u64::from_str_radix(size, 16)
            .map_err(|_| anyhow!(Error::Parse(format!("invalid chunk size ({size})"))))
    }

    async fn skip_trailers(&mut self) -> Result<()> {
        while !self.read_line().await?.is_empty() {}
        Ok(())
    }
}

/// Write `data` as a single chunk.
pub(crate) async fn write_chunk<W>(w: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        // A zero-length chunk would end the body.
        return Ok(());
    }
    w.write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    w.write_all(data).await?;
    w.write_all(b"\r\n").await?;
    Ok(())
}

/// Write the zero-length chunk ending a chunked body.
pub(crate) async fn write_last_chunk<W>(w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(b"0\r\n\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8], framing: Framing) -> Result<Vec<Vec<u8>>> {
        let mut body = Body::new(input, framing);
        let mut chunks = Vec::new();
        while let Some(chunk) = body.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn headers(list: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        list.iter().for_each(|(n, v)| headers.push(*n, *v));
        headers
    }

    #[test]
    fn request_framing() {
        assert_eq!(
            Framing::for_request(&headers(&[])).unwrap(),
            Framing::Empty
        );
        assert_eq!(
            Framing::for_request(&headers(&[("Content-Length", "0")])).unwrap(),
            Framing::Empty
        );
        assert_eq!(
            Framing::for_request(&headers(&[("Content-Length", "12")])).unwrap(),
            Framing::Length(12)
        );
        assert_eq!(
            Framing::for_request(&headers(&[
                ("Content-Length", "12"),
                ("Transfer-Encoding", "chunked")
            ]))
            .unwrap(),
            Framing::Chunked
        );
        assert!(Framing::for_request(&headers(&[("Transfer-Encoding", "gzip")])).is_err());
        assert!(Framing::for_request(&headers(&[("Content-Length", "abc")])).is_err());
    }

    #[tokio::test]
    async fn length() {
        assert_eq!(
            collect(b"hello worldEXTRA", Framing::Length(11)).await.unwrap(),
            vec![b"hello world".to_vec()]
        );
        assert!(collect(b"short", Framing::Length(11)).await.is_err());
        assert!(collect(b"", Framing::Empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunked() {
        let chunks = collect(
            b"5\r\nhello\r\n6;ext=1\r\n world\r\nA\r\n0123456789\r\n0\r\nX-Trailer: 1\r\n\r\nEXTRA",
            Framing::Chunked,
        )
        .await
        .unwrap();
        assert_eq!(
            chunks,
            vec![
                b"hello".to_vec(),
                b" world".to_vec(),
                b"0123456789".to_vec()
            ]
        );

        // Bare LF line endings are tolerated.
        let chunks = collect(b"3\nabc\n0\n\n", Framing::Chunked).await.unwrap();
        assert_eq!(chunks, vec![b"abc".to_vec()]);

        // Big chunks are split.
        let mut input = format!("{:x}\r\n", MAX_CHUNK_LEN + 1).into_bytes();
        input.extend(vec![b'a'; MAX_CHUNK_LEN + 1]);
        input.extend(b"\r\n0\r\n\r\n");
        let chunks = collect(&input, Framing::Chunked).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MAX_CHUNK_LEN);
        assert_eq!(chunks[1], b"a");
    }

    #[tokio::test]
    async fn invalid_chunked() {
        assert!(collect(b"zz\r\nhello\r\n0\r\n\r\n", Framing::Chunked)
            .await
            .is_err());
        assert!(collect(b"5\r\nhelloXX0\r\n\r\n", Framing::Chunked)
            .await
            .is_err());
        assert!(collect(b"5\r\nhel", Framing::Chunked).await.is_err());
        assert!(collect(b"5\r\nhello\r\n", Framing::Chunked).await.is_err());
    }

    #[tokio::test]
    async fn encoding() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"hello world").await.unwrap();
        write_chunk(&mut out, b"").await.unwrap();
        write_chunk(&mut out, &[b'x'; 26]).await.unwrap();
        write_last_chunk(&mut out).await.unwrap();

        let mut expected = b"b\r\nhello world\r\n1a\r\n".to_vec();
        expected.extend([b'x'; 26]);
        expected.extend(b"\r\n0\r\n\r\n");
        assert_eq!(out, expected);

        // What we write can be read back.
        let chunks = collect(&out, Framing::Chunked).await.unwrap();
        assert_eq!(chunks.concat(), b"hello world".iter().chain(&[b'x'; 26]).copied().collect::<Vec<_>>());
    }
}
