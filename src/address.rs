//! Address resolution for freshly bound backend listeners
//!
//! Backends always bind on loopback. The scheme follows the listener's
//! transport: plain TCP resolves to `http`, a TLS acceptor to `https`.

use crate::error::BindError;
use hyper::Uri;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Host every bootstrapped backend binds to
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Transport a backend listener speaks
#[derive(Clone, Default)]
pub enum Transport {
    #[default]
    Plain,
    Tls(TlsAcceptor),
}

impl Transport {
    pub fn scheme(&self) -> Scheme {
        match self {
            Transport::Plain => Scheme::Http,
            Transport::Tls(_) => Scheme::Https,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => f.write_str("Plain"),
            Transport::Tls(_) => f.write_str("Tls"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Connectable base address of a backend. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl BackendAddress {
    /// Address of a backend bound on loopback
    pub fn loopback(scheme: Scheme, port: u16) -> Self {
        Self {
            scheme,
            host: LOOPBACK.to_string(),
            port,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, as used for TCP connects and the Host header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Absolute URI for `path_and_query` on this backend
    pub fn uri(&self, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        let path_and_query = if path_and_query.is_empty() {
            "/"
        } else {
            path_and_query
        };
        Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority())
            .path_and_query(path_and_query)
            .build()
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl FromStr for BackendAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid backend address '{}': {}", s, e))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => anyhow::bail!("unsupported scheme '{}' in '{}'", other, s),
            None => anyhow::bail!("backend address '{}' has no scheme", s),
        };
        let host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("backend address '{}' has no host", s))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        if port == 0 {
            anyhow::bail!("backend address '{}' has port 0", s);
        }

        Ok(Self { scheme, host, port })
    }
}

/// A listener that has finished binding
pub struct BoundListener {
    listener: TcpListener,
    transport: Transport,
}

impl BoundListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn into_parts(self) -> (TcpListener, Transport) {
        (self.listener, self.transport)
    }
}

/// Bind a backend listener on loopback. Returns only once the socket accepts.
pub async fn bind(port: u16, transport: Transport) -> Result<BoundListener, BindError> {
    let listener = TcpListener::bind((LOOPBACK, port))
        .await
        .map_err(|source| BindError::Bind { port, source })?;
    debug!(port, ?transport, "Backend listener bound");
    Ok(BoundListener { listener, transport })
}

/// Derive the connectable address of a bound listener
pub fn resolve(listener: &BoundListener) -> Result<BackendAddress, BindError> {
    let local = listener.local_addr().map_err(BindError::LocalAddr)?;
    Ok(BackendAddress::loopback(
        listener.transport().scheme(),
        local.port(),
    ))
}
