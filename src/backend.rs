//! Backend negotiation and connection pool
//!
//! Given a transfer URL (and an optional proxy URL), pick a transport
//! once per session: unix socket when the server advertises one and the
//! host is local, TLS or plain TCP otherwise, retrying the whole ladder
//! against the proxy before giving up. The OPTIONS probe runs once here;
//! its result is cached for the session and never re-checked per request.

use crate::error::{Error, Result};
use crate::http::{HttpConnection, ServerOptions};
use crate::tls;
use crate::url::{Scheme, TransferUrl};
use std::path::Path;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Transport {
    #[cfg(unix)]
    Unix(PathBuf),
    Tls(Arc<rustls::ClientConfig>),
    Tcp,
}

/// A negotiated backend: resolved URL, cached probe result, and the
/// transport every pooled connection will use.
#[derive(Debug)]
pub struct Backend {
    url: TransferUrl,
    options: ServerOptions,
    transport: Transport,
    /// Kept for the opportunistic unix-socket fallback path.
    fallback: Transport,
}

impl Backend {
    /// Run the negotiation ladder: primary URL first, then the proxy.
    pub fn negotiate(
        transfer_url: &str,
        proxy_url: Option<&str>,
        ca_file: Option<&Path>,
    ) -> Result<Backend> {
        let mut reasons = Vec::new();

        for candidate in std::iter::once(transfer_url).chain(proxy_url) {
            match Self::try_candidate(candidate, ca_file) {
                Ok(backend) => return Ok(backend),
                // Only connection-level failures fall through to the
                // proxy. A reachable endpoint that answers the probe
                // with an error is terminal: the proxy would be shown
                // the same bad ticket.
                Err(e @ (Error::EndpointUnreachable { .. } | Error::Io(_))) => {
                    reasons.push(format!("{candidate}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::EndpointUnreachable {
            reason: reasons.join("; "),
        })
    }

    fn try_candidate(candidate: &str, ca_file: Option<&Path>) -> Result<Backend> {
        let url = TransferUrl::parse(candidate)?;

        let base = match url.scheme {
            Scheme::Https => {
                let ca = ca_file.ok_or_else(|| {
                    Error::InvalidArgument("https transfer URL requires a CA file".into())
                })?;
                Transport::Tls(tls::client_config(ca)?)
            }
            Scheme::Http => Transport::Tcp,
        };

        // Capability probe over the base transport. Reachability and the
        // feature set are decided here, once.
        let mut probe = connect_with(&base, &url)?;
        let options = probe.options()?;

        // Same-host optimization: prefer the advertised unix socket when
        // the URL points at this machine. Purely opportunistic; a socket
        // that does not accept connections keeps the probed transport.
        #[cfg(unix)]
        let transport = match &options.unix_socket {
            Some(sock) if url.is_local() => {
                let path = PathBuf::from(sock);
                if HttpConnection::connect_unix(&path, &url.path).is_ok() {
                    Transport::Unix(path)
                } else {
                    base.clone()
                }
            }
            _ => base.clone(),
        };
        #[cfg(not(unix))]
        let transport = base.clone();

        Ok(Backend {
            url,
            options,
            transport,
            fallback: base,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Open one transport connection. Each pool worker owns exactly one.
    pub fn connect(&self) -> Result<HttpConnection> {
        match connect_with(&self.transport, &self.url) {
            Ok(conn) => Ok(conn),
            #[cfg(unix)]
            Err(_) if matches!(self.transport, Transport::Unix(_)) => {
                connect_with(&self.fallback, &self.url)
            }
            Err(e) => Err(e),
        }
    }
}

fn connect_with(transport: &Transport, url: &TransferUrl) -> Result<HttpConnection> {
    match transport {
        #[cfg(unix)]
        Transport::Unix(sock) => HttpConnection::connect_unix(sock, &url.path),
        Transport::Tls(config) => {
            HttpConnection::connect_tls(Arc::clone(config), &url.host, url.port, &url.path)
        }
        Transport::Tcp => HttpConnection::connect_tcp(&url.host, url.port, &url.path),
    }
}
