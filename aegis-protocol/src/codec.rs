//! Newline-delimited JSON framing over any async byte stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, ProtocolError, Result, MAX_FRAME_BYTES};

/// Reads [`Frame`]s off an async buffered reader, one newline-terminated
/// JSON object at a time, enforcing the [`MAX_FRAME_BYTES`] cap per line.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and decode the next frame. Returns `Ok(None)` on clean EOF.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut line = String::new();
        loop {
            let mut chunk = String::new();
            let n = self.inner.read_line(&mut chunk).await?;
            if n == 0 && chunk.is_empty() && line.is_empty() {
                return Ok(None);
            }
            line.push_str(&chunk);
            if line.len() > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge);
            }
            if n == 0 || chunk.ends_with('\n') {
                break;
            }
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return Ok(None);
        }
        Frame::decode(trimmed).map(Some)
    }
}

/// Serializes and writes [`Frame`]s to an async writer, one per line.
///
/// Intentionally does not buffer across calls: each `write_frame` flushes,
/// since the host and guest rely on timely delivery of notifications like
/// `log` and `activity`.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut line = frame.encode()?;
        line.push('\n');
        if line.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge);
        }
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{method, RpcId, RpcRequest};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trip_through_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(tokio::io::BufWriter::new(client));
        let mut reader = FrameReader::new(BufReader::new(server));

        let req = RpcRequest::request(RpcId::Number(1), method::HEALTH, serde_json::json!({}));
        writer.write_frame(&Frame::Request(req)).await.unwrap();

        let frame = reader.next_frame().await.unwrap().unwrap();
        match frame {
            Frame::Request(r) => assert_eq!(r.method, method::HEALTH),
            Frame::Response(_) => panic!("expected request"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(1 << 21);
        let mut writer = tokio::io::BufWriter::new(client);
        let huge = "x".repeat(MAX_FRAME_BYTES + 16);
        writer
            .write_all(format!("{{\"jsonrpc\":\"2.0\",\"method\":\"log\",\"params\":\"{huge}\"}}\n").as_bytes())
            .await
            .unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(BufReader::new(server));
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge));
    }
}
