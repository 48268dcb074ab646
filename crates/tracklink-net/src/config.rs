//! Client configuration.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::diagnostics::Diagnostics;
use crate::resolve::{Resolve, SystemResolver};
use crate::session::ConnectedHook;
use crate::tls::{CertificateValidator, DefaultValidator};

/// Default bound on a single connect attempt, handshake, or line read/write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a whole connect, across all candidate addresses.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum line length accepted by `read_line`.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// TCP client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Timeout for each handshake and each line I/O, and the cap for each
    /// connect attempt. Attempts also get no more than an even share of
    /// what is left of `connect_timeout`.
    pub io_timeout: Duration,
    /// Overall deadline for resolution, all attempts, handshake and hook.
    pub connect_timeout: Duration,
    /// Local address to bind before every connect attempt.
    pub local_addr: Option<SocketAddr>,
    /// Certificate trust policy for connect-time TLS and upgrades.
    pub validator: Arc<dyn CertificateValidator>,
    /// Additional trusted root certificates.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Optional diagnostics sink.
    pub diagnostics: Option<Arc<dyn Diagnostics>>,
    /// Host name resolver.
    pub resolver: Arc<dyn Resolve>,
    /// Optional hook run after connect, before completion is signaled.
    pub hook: Option<Arc<dyn ConnectedHook>>,
    /// Maximum line length accepted by `read_line`, terminator included.
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build()
    }
}

impl ClientConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("io_timeout", &self.io_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("local_addr", &self.local_addr)
            .field("validator", &self.validator)
            .field("extra_roots", &self.extra_roots.len())
            .field("diagnostics", &self.diagnostics.is_some())
            .field("hook", &self.hook.is_some())
            .field("max_line_length", &self.max_line_length)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Clone)]
pub struct ClientConfigBuilder {
    io_timeout: Duration,
    connect_timeout: Duration,
    local_addr: Option<SocketAddr>,
    validator: Arc<dyn CertificateValidator>,
    extra_roots: Vec<CertificateDer<'static>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
    resolver: Arc<dyn Resolve>,
    hook: Option<Arc<dyn ConnectedHook>>,
    max_line_length: usize,
}

impl fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("io_timeout", &self.io_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfigBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local_addr: None,
            validator: Arc::new(DefaultValidator),
            extra_roots: Vec::new(),
            diagnostics: None,
            resolver: Arc::new(SystemResolver),
            hook: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Sets the per-operation I/O timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the overall connect deadline.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Binds every connect attempt to `addr`.
    #[must_use]
    pub const fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Sets the certificate trust policy.
    #[must_use]
    pub fn validator(mut self, validator: impl CertificateValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Trusts an additional root certificate.
    #[must_use]
    pub fn add_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    /// Attaches a diagnostics sink.
    #[must_use]
    pub fn diagnostics(mut self, sink: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Replaces the host name resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Installs a connected hook.
    #[must_use]
    pub fn hook(mut self, hook: impl ConnectedHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Sets the maximum accepted line length.
    #[must_use]
    pub const fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        ClientConfig {
            io_timeout: self.io_timeout,
            connect_timeout: self.connect_timeout,
            local_addr: self.local_addr,
            validator: self.validator,
            extra_roots: self.extra_roots,
            diagnostics: self.diagnostics,
            resolver: self.resolver,
            hook: self.hook,
            max_line_length: self.max_line_length,
        }
    }
}
