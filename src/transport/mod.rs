//! Duplex channel abstraction consumed by interactive sessions
//!
//! A channel is one session's transport: a primary read/write stream, a
//! separate write-only error stream and an explicit close. Writes flush
//! before returning, so callers can rely on ordering between successive
//! writes without inserting delays.

pub mod mock;

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub use mock::{MockChannel, MockChannelHandle, MockInput, MockWrite};

/// Transport bound to a single session
#[async_trait]
pub trait Channel: Send {
    /// Read raw bytes from the primary stream. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write and flush bytes on the primary stream
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Write and flush bytes on the error stream
    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the channel
    async fn close(&mut self) -> io::Result<()>;
}

/// Channel over any reader/writer pair.
///
/// Streams such as TCP have no separate error path, so error-stream writes
/// are multiplexed onto the primary writer.
pub struct DuplexChannel<R, W> {
    reader: R,
    writer: W,
}

/// Channel bound to an accepted TCP connection
pub type TcpChannel = DuplexChannel<OwnedReadHalf, OwnedWriteHalf>;

impl<R, W> DuplexChannel<R, W> {
    /// Create a new DuplexChannel
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Split the channel back into its halves
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl DuplexChannel<OwnedReadHalf, OwnedWriteHalf> {
    /// Wrap an accepted TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

#[async_trait]
impl<R, W> Channel for DuplexChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.write(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Channel over the process standard streams
pub struct StdioChannel {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
    stderr: tokio::io::Stderr,
}

impl StdioChannel {
    /// Create a new StdioChannel
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            stderr: tokio::io::stderr(),
        }
    }
}

impl Default for StdioChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for StdioChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdin.read(buf).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stdout.write_all(data).await?;
        self.stdout.flush().await
    }

    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.stderr.write_all(data).await?;
        self.stderr.flush().await
    }

    // The process owns its standard streams; closing only drains them.
    async fn close(&mut self) -> io::Result<()> {
        self.stdout.flush().await?;
        self.stderr.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_duplex_channel_reads_and_writes() {
        let reader = Builder::new().read(b"echo hi\r\n").build();
        let writer = Builder::new().write(b"echo: hi").write(b"oops").build();
        let mut channel = DuplexChannel::new(reader, writer);

        let mut buf = [0u8; 32];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"echo hi\r\n");

        channel.write(b"echo: hi").await.unwrap();
        // Error-stream writes share the primary writer
        channel.write_stderr(b"oops").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplex_channel_end_of_stream() {
        let reader = Builder::new().build();
        let writer = Builder::new().build();
        let mut channel = DuplexChannel::new(reader, writer);

        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplex_channel_propagates_read_errors() {
        let reader = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let writer = Builder::new().build();
        let mut channel = DuplexChannel::new(reader, writer);

        let mut buf = [0u8; 8];
        let err = channel.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
