//! Output driver (component H).
//!
//! Serializes a response onto the connection and paces the write when a
//! route carries `limit_rate_bytes_per_sec`, generalizing the token-bucket
//! idea in `proxy::filter::rate_limit` from per-request admission to
//! per-write backpressure: instead of rejecting over the limit, a write
//! past the current allowance sleeps until the bucket would allow it.

use bytes::{Bytes, BytesMut};
use http::Response;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::proxy::BoxBody;

#[derive(Debug)]
pub enum WriteError {
    Timeout,
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Io(e)
    }
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Timeout => write!(f, "send timed out"),
            WriteError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WriteError {}

/// Smallest chunk a rate-limited write is split into. Small enough that
/// the pacing sleep between chunks stays proportionate even for slow
/// (low bytes/sec) limits.
const PACED_CHUNK_BYTES: usize = 16 * 1024;

pub struct Writer<'a, S> {
    stream: &'a mut S,
    send_timeout: Duration,
    limit_bytes_per_sec: Option<u64>,
}

impl<'a, S> Writer<'a, S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, send_timeout: Duration, limit_bytes_per_sec: Option<u64>) -> Self {
        Self {
            stream,
            send_timeout,
            limit_bytes_per_sec,
        }
    }

    /// Serialize `resp` (status line + headers + body) and write it out,
    /// buffering the body first — every phase upstream of the writer
    /// already buffers response bodies on the retry path, so this keeps
    /// the same posture rather than adding a second, streaming code path.
    pub async fn write_response(
        &mut self,
        resp: Response<BoxBody>,
        body: Bytes,
        keepalive: bool,
    ) -> Result<(), WriteError> {
        let head = render_head(&resp, body.len() as u64, keepalive);
        self.write_paced(&head).await?;
        if !body.is_empty() {
            self.write_paced(&body).await?;
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), WriteError> {
        timeout(self.send_timeout, self.stream.flush())
            .await
            .map_err(|_| WriteError::Timeout)??;
        Ok(())
    }

    async fn write_paced(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let Some(rate) = self.limit_bytes_per_sec.filter(|r| *r > 0) else {
            timeout(self.send_timeout, self.stream.write_all(data))
                .await
                .map_err(|_| WriteError::Timeout)??;
            return Ok(());
        };

        for chunk in data.chunks(PACED_CHUNK_BYTES) {
            timeout(self.send_timeout, self.stream.write_all(chunk))
                .await
                .map_err(|_| WriteError::Timeout)??;
            let delay = Duration::from_secs_f64(chunk.len() as f64 / rate as f64);
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}

/// Render the status line + header block for `resp`. Always sets
/// `Content-Length` (bodies are fully buffered before this point) and
/// `Connection: keep-alive`/`close` to whatever the connection driver
/// already decided, overriding anything a filter left behind.
fn render_head(resp: &Response<BoxBody>, body_len: u64, keepalive: bool) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    let status = resp.status();
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(status.as_u16()).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in resp.headers() {
        if name == http::header::CONTENT_LENGTH
            || name == http::header::TRANSFER_ENCODING
            || name == http::header::CONNECTION
        {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"content-length: ");
    let mut len_buf = itoa::Buffer::new();
    buf.extend_from_slice(len_buf.format(body_len).as_bytes());
    buf.extend_from_slice(b"\r\n");

    buf.extend_from_slice(b"connection: ");
    buf.extend_from_slice(if keepalive { b"keep-alive" } else { b"close" });
    buf.extend_from_slice(b"\r\n\r\n");

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use tokio::io::duplex;

    fn resp(status: u16) -> Response<BoxBody> {
        Response::builder()
            .status(status)
            .header("x-test", "1")
            .body(
                Full::new(Bytes::new())
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap()
    }

    #[test]
    fn head_includes_status_line_and_content_length() {
        let head = render_head(&resp(200), 5, true);
        let s = String::from_utf8(head.to_vec()).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("content-length: 5\r\n"));
        assert!(s.contains("connection: keep-alive\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_drops_hop_by_hop_framing_headers_the_writer_owns() {
        let mut r = resp(200);
        r.headers_mut()
            .insert(http::header::CONNECTION, "close".parse().unwrap());
        let head = render_head(&r, 0, true);
        let s = String::from_utf8(head.to_vec()).unwrap();
        assert_eq!(s.matches("connection:").count(), 1);
        assert!(s.contains("connection: keep-alive"));
    }

    #[tokio::test]
    async fn write_response_round_trips_over_a_pipe() {
        let (mut client, mut server) = duplex(4096);
        let body = Bytes::from_static(b"hello");
        let mut writer = Writer::new(&mut server, Duration::from_secs(5), None);
        writer
            .write_response(resp(200), body.clone(), false)
            .await
            .unwrap();
        drop(writer);
        drop(server);

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        client.read_to_end(&mut buf).await.unwrap();
        let s = String::from_utf8(buf).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.ends_with("hello"));
    }
}
