//! Transport establishment and the non-blocking byte pipe the I/O thread
//! drives.
//!
//! Establishment is blocking (resolve, connect, TLS handshake) and runs on
//! the caller's thread so failures surface there. Afterwards the socket is
//! switched to non-blocking and handed to mio.

use std::io::{self, Read as _, Write as _};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rustls::ClientConnection;
use rustls::pki_types::ServerName;
use tracing::{debug, trace};
use url::{Host, Url};

use crate::config::{ALPN_H2, Config};
use crate::error::{Error, Result};

/// Outcome of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadState {
    Data(usize),
    WouldBlock,
    Eof,
}

pub(crate) enum Transport {
    Plain {
        tcp: mio::net::TcpStream,
        pending: BytesMut,
    },
    Tls {
        tcp: mio::net::TcpStream,
        tls: Box<ClientConnection>,
    },
}

impl Transport {
    /// Resolve, connect and, for `https`, run the TLS handshake.
    pub(crate) fn connect(uri: &Url, config: &Config) -> Result<Self> {
        let tcp = connect_tcp(uri, config.connect_timeout)?;
        let transport = if uri.scheme() == "https" {
            let tls = handshake(&tcp, uri, config)?;
            tcp.set_nonblocking(true)?;
            Transport::Tls {
                tcp: mio::net::TcpStream::from_std(tcp),
                tls: Box::new(tls),
            }
        } else {
            tcp.set_nonblocking(true)?;
            Transport::Plain {
                tcp: mio::net::TcpStream::from_std(tcp),
                pending: BytesMut::new(),
            }
        };
        Ok(transport)
    }

    pub(crate) fn tcp(&mut self) -> &mut mio::net::TcpStream {
        match self {
            Transport::Plain { tcp, .. } | Transport::Tls { tcp, .. } => tcp,
        }
    }

    /// Decrypted bytes are waiting in the TLS layer. Socket readiness says
    /// nothing about these, so the I/O loop must not block while this holds.
    pub(crate) fn has_buffered(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain { .. } => Ok(false),
            Transport::Tls { tls, .. } => tls
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .map_err(tls_io_error),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadState> {
        match self {
            Transport::Plain { tcp, .. } => loop {
                return match tcp.read(buf) {
                    Ok(0) => Ok(ReadState::Eof),
                    Ok(n) => Ok(ReadState::Data(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadState::WouldBlock),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
            },
            Transport::Tls { tcp, tls } => loop {
                match tls.reader().read(buf) {
                    // close_notify
                    Ok(0) => return Ok(ReadState::Eof),
                    Ok(n) => return Ok(ReadState::Data(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    // TCP closed without close_notify.
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Ok(ReadState::Eof);
                    }
                    Err(e) => return Err(e),
                }
                match tls.read_tls(tcp) {
                    Ok(_) => {
                        tls.process_new_packets().map_err(tls_io_error)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadState::WouldBlock);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Stage bytes for sending; [`flush`](Self::flush) moves them out.
    pub(crate) fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Plain { pending, .. } => {
                pending.extend_from_slice(data);
                Ok(())
            }
            Transport::Tls { tls, .. } => tls.writer().write_all(data),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            Transport::Plain { pending, .. } => !pending.is_empty(),
            Transport::Tls { tls, .. } => tls.wants_write(),
        }
    }

    /// Write as much as the socket takes without blocking. Returns the
    /// number of bytes that reached the socket.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        match self {
            Transport::Plain { tcp, pending } => {
                while !pending.is_empty() {
                    match tcp.write(pending) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            pending.advance(n);
                            written += n;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Transport::Tls { tcp, tls } => {
                while tls.wants_write() {
                    match tls.write_tls(tcp) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        if written > 0 {
            trace!(bytes = written, "flushed");
        }
        Ok(written)
    }

    /// Best-effort shutdown. Never fails.
    pub(crate) fn close(&mut self) {
        if let Transport::Tls { tls, .. } = self {
            tls.send_close_notify();
        }
        if self.wants_write() {
            let _ = self.flush();
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

fn resolve(uri: &Url) -> Result<Vec<SocketAddr>> {
    let port = uri
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidUri(format!("{uri}: no port")))?;
    let addrs = match uri.host() {
        Some(Host::Ipv4(ip)) => vec![SocketAddr::from((ip, port))],
        Some(Host::Ipv6(ip)) => vec![SocketAddr::from((ip, port))],
        Some(Host::Domain(domain)) => (domain, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve {
                host: domain.to_string(),
                source: Arc::new(e),
            })?
            .collect(),
        None => return Err(Error::InvalidUri(format!("{uri}: no host"))),
    };
    if addrs.is_empty() {
        return Err(Error::Resolve {
            host: uri.host_str().unwrap_or_default().to_string(),
            source: Arc::new(io::Error::new(io::ErrorKind::NotFound, "no addresses")),
        });
    }
    Ok(addrs)
}

/// Try each resolved address in turn; the last failure wins.
fn connect_tcp(uri: &Url, timeout: Duration) -> Result<TcpStream> {
    let mut last = None;
    for addr in resolve(uri)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_nodelay(true)?;
                debug!(%addr, "connected");
                return Ok(tcp);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!(%addr, ?timeout, "connect timed out");
                last = Some(Error::ConnectTimeout(timeout));
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                last = Some(Error::Connect {
                    addr,
                    source: Arc::new(e),
                });
            }
        }
    }
    Err(last.unwrap_or(Error::ConnectTimeout(timeout)))
}

/// Blocking TLS handshake offering ALPN `h2`, bounded by the connect timeout.
fn handshake(tcp: &TcpStream, uri: &Url, config: &Config) -> Result<ClientConnection> {
    let host = match uri.host() {
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => uri.host_str().unwrap_or_default().to_string(),
    };
    let name = ServerName::try_from(host.as_str())
        .map(|name| name.to_owned())
        .map_err(|_| Error::ServerName(host.clone()))?;
    let mut tls = ClientConnection::new(config.tls_config(), name)?;
    tls.set_buffer_limit(None);

    tcp.set_read_timeout(Some(config.connect_timeout))?;
    tcp.set_write_timeout(Some(config.connect_timeout))?;
    let mut io = tcp;
    while tls.is_handshaking() {
        if let Err(e) = tls.complete_io(&mut io) {
            return Err(handshake_error(e, config.connect_timeout));
        }
    }
    tcp.set_read_timeout(None)?;
    tcp.set_write_timeout(None)?;

    let alpn = tls.alpn_protocol().map(<[u8]>::to_vec);
    if alpn.as_deref() != Some(ALPN_H2) {
        let got = alpn.map(|p| String::from_utf8_lossy(&p).into_owned());
        if config.require_alpn {
            return Err(Error::Alpn(got));
        }
        debug!(alpn = ?got, "server did not select h2, continuing");
    }
    debug!(%host, "tls established");
    Ok(tls)
}

fn handshake_error(e: io::Error, timeout: Duration) -> Error {
    if let Some(tls) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return Error::Tls(tls.clone());
    }
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::ConnectTimeout(timeout),
        _ => e.into(),
    }
}

fn tls_io_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn resolves_ip_literals() {
        let addrs = resolve(&Url::parse("http://127.0.0.1:8080").unwrap()).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
        let addrs = resolve(&Url::parse("https://[::1]").unwrap()).unwrap();
        assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
    }

    #[test]
    fn refused_connect_is_reported() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let err = connect_tcp(&uri, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, Error::Connect { .. }), "{err:?}");
    }

    #[test]
    fn plain_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let mut transport = Transport::connect(&uri, &Config::default()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        transport.queue(b"ping").unwrap();
        assert!(transport.wants_write());
        assert_eq!(transport.flush().unwrap(), 4);
        assert!(!transport.wants_write());
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        let mut buf = [0u8; 16];
        assert_eq!(transport.read(&mut buf).unwrap(), ReadState::WouldBlock);
        peer.write_all(b"pong").unwrap();
        drop(peer);
        let mut seen = Vec::new();
        loop {
            match transport.read(&mut buf).unwrap() {
                ReadState::Data(n) => seen.extend_from_slice(&buf[..n]),
                ReadState::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                ReadState::Eof => break,
            }
        }
        assert_eq!(seen, b"pong");
    }
}
