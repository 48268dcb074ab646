//! Session byte stream.
//!
//! The transport is either a plain [`TcpStream`] or a TLS stream that owns
//! one. Upgrading consumes the plain variant by value, so at no point do two
//! wrappers share the socket.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Underlying transport of a session.
#[derive(Debug)]
pub enum Transport {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS stream owning the TCP socket (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Returns true if the transport is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Returns the TCP socket underneath any TLS layer.
    #[must_use]
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => tls.get_ref().0,
        }
    }
}

/// Last-activity timestamp shared between a stream and its session.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    millis: AtomicI64,
}

impl ActivityClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(now.timestamp_millis()),
        })
    }

    pub(crate) fn touch(&self) {
        self.millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn last(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::Relaxed)).unwrap_or_default()
    }
}

/// Byte stream of a connected session.
///
/// Every successful read or write refreshes the session's last-activity
/// timestamp.
#[derive(Debug)]
pub struct SessionStream {
    transport: Transport,
    activity: Arc<ActivityClock>,
}

impl SessionStream {
    pub(crate) const fn new(transport: Transport, activity: Arc<ActivityClock>) -> Self {
        Self {
            transport,
            activity,
        }
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn last_activity(&self) -> DateTime<Utc> {
        self.activity.last()
    }

    /// Splits a plaintext stream into its socket and clock; TLS streams are
    /// handed back unchanged.
    pub(crate) fn into_plain(self) -> Result<(TcpStream, Arc<ActivityClock>), Self> {
        match self.transport {
            Transport::Plain(tcp) => Ok((tcp, self.activity)),
            transport @ Transport::Tls(_) => Err(Self {
                transport,
                activity: self.activity,
            }),
        }
    }

    fn touch_if(&self, progressed: bool) {
        if progressed {
            self.activity.touch();
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = match &mut this.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        };
        if let Poll::Ready(Ok(())) = &poll {
            this.touch_if(buf.filled().len() > before);
        }
        poll
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match &mut this.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        };
        if let Poll::Ready(Ok(n)) = &poll {
            this.touch_if(*n > 0);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
