//! Line-oriented I/O helpers.
//!
//! Every helper runs under the client's `io_timeout` and reports what it
//! moved to the diagnostics sink. Bytes read ahead by [`TcpClient::read_line`]
//! are kept in an internal buffer and served first by [`TcpClient::read`];
//! they are not visible through the raw [`Session::stream`](crate::Session::stream).

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::TcpClient;
use crate::{Error, Result};

/// Bytes reserved in the read buffer before each socket read.
const READ_CHUNK: usize = 4096;

async fn within<T>(timeout: Duration, io: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, io).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

impl TcpClient {
    /// Reads one line and returns it without the line terminator.
    ///
    /// Lines end with `\n`; a preceding `\r` is stripped as well. Invalid
    /// UTF-8 is replaced. A line may take up to `max_line_length` bytes,
    /// terminator included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] on EOF, [`Error::LineTooLong`]
    /// for a line over `max_line_length` bytes, and [`Error::Timeout`] when
    /// the peer stalls.
    ///
    /// An oversized line is discarded. If its terminator had already
    /// arrived, the next call starts at the following line. Otherwise the
    /// bytes seen so far are dropped and the stream is left mid-line.
    pub async fn read_line(&mut self) -> Result<String> {
        let timeout = self.config.io_timeout;
        let max = self.config.max_line_length;
        let established = self.established_mut()?;

        loop {
            if let Some(pos) = established.rx.iter().position(|&b| b == b'\n') {
                let raw = established.rx.split_to(pos + 1);
                if raw.len() > max {
                    let err = Error::LineTooLong(max);
                    established.reporter.exception("Read failed", &err);
                    return Err(err);
                }
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                established.reporter.read(raw.len(), &line);
                return Ok(line);
            }
            if established.rx.len() >= max {
                established.rx.clear();
                let err = Error::LineTooLong(max);
                established.reporter.exception("Read failed", &err);
                return Err(err);
            }

            established.rx.reserve(READ_CHUNK);
            let read = within(timeout, established.stream.read_buf(&mut established.rx)).await;
            match read {
                Ok(0) => {
                    let err = Error::ConnectionClosed;
                    established.reporter.exception("Read failed", &err);
                    return Err(err);
                }
                Ok(_) => {}
                Err(e) => {
                    established.reporter.exception("Read failed", &e);
                    return Err(e);
                }
            }
        }
    }

    /// Writes `line` followed by CRLF and flushes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error or [`Error::Timeout`].
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.send(&data, line).await
    }

    /// Writes all of `data` and flushes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error or [`Error::Timeout`].
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data);
        self.send(data, &text).await
    }

    /// Reads up to `buf.len()` bytes, serving buffered bytes first.
    ///
    /// Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error or [`Error::Timeout`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.config.io_timeout;
        let established = self.established_mut()?;

        let n = if established.rx.is_empty() {
            match within(timeout, established.stream.read(buf)).await {
                Ok(n) => n,
                Err(e) => {
                    established.reporter.exception("Read failed", &e);
                    return Err(e);
                }
            }
        } else {
            let n = buf.len().min(established.rx.len());
            buf[..n].copy_from_slice(&established.rx.split_to(n));
            n
        };
        established
            .reporter
            .read(n, &String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Returns the number of bytes read ahead and not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.established().map_or(0, |established| established.rx.len())
    }

    async fn send(&mut self, data: &[u8], text: &str) -> Result<()> {
        let timeout = self.config.io_timeout;
        let established = self.established_mut()?;
        let stream = &mut established.stream;
        let written = within(timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;
        match written {
            Ok(()) => {
                established.reporter.written(data.len(), text);
                Ok(())
            }
            Err(e) => {
                established.reporter.exception("Write failed", &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::ClientConfig;
    use crate::Misuse;
    use crate::session::Session;

    async fn pair(config: ClientConfig) -> (TcpClient, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut client = TcpClient::with_config(config);
        client.connect("127.0.0.1", port, false).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let (mut client, mut server) = pair(ClientConfig::default()).await;
        server.write_all(b"+OK hello\r\nbare\n").await.unwrap();

        assert_eq!(client.read_line().await.unwrap(), "+OK hello");
        assert_eq!(client.read_line().await.unwrap(), "bare");
        assert_eq!(client.buffered(), 0);
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let (mut client, server) = pair(ClientConfig::default()).await;
        drop(server);
        assert!(matches!(
            client.read_line().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let (mut client, mut server) =
            pair(ClientConfig::builder().max_line_length(16).build()).await;
        server.write_all(&[b'a'; 64]).await.unwrap();
        assert!(matches!(
            client.read_line().await,
            Err(Error::LineTooLong(16))
        ));
    }

    #[tokio::test]
    async fn test_read_line_too_long_with_terminator() {
        let (mut client, mut server) =
            pair(ClientConfig::builder().max_line_length(16).build()).await;
        let mut data = vec![b'a'; 64];
        data.extend_from_slice(b"\r\n+OK\r\n");
        server.write_all(&data).await.unwrap();

        assert!(matches!(
            client.read_line().await,
            Err(Error::LineTooLong(16))
        ));
        assert_eq!(client.read_line().await.unwrap(), "+OK");
        assert_eq!(client.buffered(), 0);
    }

    #[tokio::test]
    async fn test_read_line_at_limit() {
        let (mut client, mut server) =
            pair(ClientConfig::builder().max_line_length(16).build()).await;
        server.write_all(b"+OK 0123456789\r\n").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "+OK 0123456789");
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (mut client, _server) = pair(
            ClientConfig::builder()
                .io_timeout(Duration::from_millis(30))
                .build(),
        )
        .await;
        let err = client.read_line().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_write_line_and_read() {
        let (mut client, server) = pair(ClientConfig::default()).await;
        let before = client.last_activity().unwrap();
        client.write_line("USER alice").await.unwrap();
        assert!(client.last_activity().unwrap() >= before);
        assert!(client.idle_for().unwrap() >= chrono::TimeDelta::zero());

        let mut server = BufReader::new(server);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "USER alice\r\n");

        server.get_mut().write_all(b"+OK\r\nrest").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "+OK");
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"rest");
    }

    #[tokio::test]
    async fn test_io_requires_connection() {
        let mut client = TcpClient::new();
        assert_eq!(
            client.write_line("NOOP").await.unwrap_err().misuse(),
            Some(Misuse::NotConnected)
        );
        assert_eq!(
            client.read_line().await.unwrap_err().misuse(),
            Some(Misuse::NotConnected)
        );
        assert_eq!(client.buffered(), 0);
    }
}
