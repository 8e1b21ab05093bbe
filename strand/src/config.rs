use std::sync::Arc;
use std::time::Duration;

use strand_h2::Settings;

use crate::client::Client;
use crate::error::{Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";

/// Client configuration.
#[derive(Clone)]
pub struct Config {
    /// Upper bound on TCP connect, per resolved address.
    pub connect_timeout: Duration,
    /// Timeout for requests that don't set their own.
    pub request_timeout: Duration,
    /// TLS settings for `https` targets. `None` uses the webpki roots.
    /// ALPN is always forced to `h2`.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Fail the handshake when the server does not select `h2` via ALPN.
    pub require_alpn: bool,
    /// SETTINGS advertised to the server.
    pub settings: Settings,
    /// Bytes read from the socket per read call.
    pub read_buffer_size: usize,
    /// Upper bound on bytes moved from the write channel per loop turn, so
    /// a burst of writes cannot starve reads.
    pub write_chunk_size: usize,
    /// How long closed stream ids are remembered before late frames for
    /// them are answered with RST_STREAM.
    pub closed_stream_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tls: None,
            require_alpn: true,
            settings: Settings::client_default(),
            read_buffer_size: 16 * 1024,
            write_chunk_size: 64 * 1024,
            closed_stream_grace: strand_h2::DEFAULT_GRACE,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be non-zero".into()));
        }
        if self.read_buffer_size == 0 || self.write_chunk_size == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// The TLS config to hand to rustls: the user's (or the default roots)
    /// with ALPN set to `h2` only.
    pub(crate) fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        let mut config = match &self.tls {
            Some(config) => (**config).clone(),
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Arc::new(config)
    }
}

/// Builder for [`Client`].
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// let client = strand::Client::builder()
///     .connect_timeout(Duration::from_secs(5))
///     .request_timeout(Duration::from_secs(10))
///     .build("https://example.com")?;
/// # Ok::<(), strand::Error>(())
/// ```
#[derive(Default)]
pub struct ClientBuilder {
    config: Config,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Use a caller-built rustls config (custom roots, client certs, ...).
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls = Some(config);
        self
    }

    pub fn require_alpn(mut self, require: bool) -> Self {
        self.config.require_alpn = require;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.config.read_buffer_size = n;
        self
    }

    pub fn write_chunk_size(mut self, n: usize) -> Self {
        self.config.write_chunk_size = n;
        self
    }

    pub fn closed_stream_grace(mut self, grace: Duration) -> Self {
        self.config.closed_stream_grace = grace;
        self
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn build(self, uri: &str) -> Result<Client> {
        Client::with_config(uri, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.closed_stream_grace, Duration::from_secs(15));
        assert!(config.require_alpn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_connect_timeout_is_invalid() {
        let config = Config {
            connect_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn alpn_is_forced_to_h2() {
        let mut user = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        user.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Config {
            tls: Some(Arc::new(user)),
            ..Config::default()
        };
        assert_eq!(config.tls_config().alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(
            Config::default().tls_config().alpn_protocols,
            vec![b"h2".to_vec()]
        );
    }

    #[test]
    fn builder_sets_fields() {
        let mut builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .require_alpn(false)
            .write_chunk_size(1024);
        builder.config_mut().read_buffer_size = 512;
        let config = builder.config;
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert!(!config.require_alpn);
        assert_eq!(config.write_chunk_size, 1024);
        assert_eq!(config.read_buffer_size, 512);
    }
}
