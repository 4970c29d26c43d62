//! Client-input buffer
//!
//! The router delivers client bytes asynchronously, packet by packet, but
//! the protocol decoders expect a synchronous byte stream: between two
//! client packets the source must *suspend*, not report end-of-stream.
//! Writes append and signal; a blocked read waits until data exists.
//! Dropping the writer is the true end-of-stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};

/// Create a connected writer/reader pair.
pub fn client_input() -> (ClientInputWriter, ClientInputReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ClientInputWriter { tx },
        ClientInputReader {
            rx,
            current: Bytes::new(),
        },
    )
}

/// Appending half, held by the proxy handle the router writes into.
#[derive(Clone)]
pub struct ClientInputWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientInputWriter {
    /// Append bytes; fails once the reading side is gone.
    pub fn write(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(data)
            .map_err(|_| ProxyError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
    }
}

/// Reading half, owned by the proxy driver task.
pub struct ClientInputReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
}

impl AsyncRead for ClientInputReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => self.current = data,
                // All writers dropped: end-of-stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_returns_written_bytes() {
        let (writer, mut reader) = client_input();
        writer.write(Bytes::from_static(b"hello ")).unwrap();
        writer.write(Bytes::from_static(b"world")).unwrap();

        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_read_suspends_between_packets() {
        let (writer, mut reader) = client_input();
        writer.write(Bytes::from_static(b"first")).unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();

        // No data queued: the read must suspend, not return EOF.
        let mut byte = [0u8; 1];
        let pending =
            tokio::time::timeout(Duration::from_millis(50), reader.read_exact(&mut byte)).await;
        assert!(pending.is_err(), "read should still be waiting");

        writer.write(Bytes::from_static(b"x")).unwrap();
        reader.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");
    }

    #[tokio::test]
    async fn test_dropping_writer_signals_eof() {
        let (writer, mut reader) = client_input();
        writer.write(Bytes::from_static(b"tail")).unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"tail");
    }

    #[tokio::test]
    async fn test_write_after_reader_dropped_fails() {
        let (writer, reader) = client_input();
        drop(reader);
        assert!(writer.write(Bytes::from_static(b"late")).is_err());
    }
}
