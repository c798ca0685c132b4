//! Transfer URL parsing
//!
//! A transfer URL names a ticket-scoped image resource, e.g.
//! `https://host:54322/images/{ticket-uuid}`. Plain `http://` is accepted
//! for loopback testing, mirroring the daemon's remote service.

use crate::error::{Error, Result};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Ticket path, e.g. `/images/ddc5ca6a-...`.
    pub path: String,
}

impl TransferUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = if let Some(r) = s.strip_prefix("https://") {
            (Scheme::Https, r)
        } else if let Some(r) = s.strip_prefix("http://") {
            (Scheme::Http, r)
        } else {
            return Err(Error::InvalidArgument(format!(
                "unsupported transfer URL scheme: {s:?}"
            )));
        };

        let (hostport, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if hostport.is_empty() {
            return Err(Error::InvalidArgument(format!("missing host in URL {s:?}")));
        }

        // Bracketed IPv6 literal or host[:port].
        let (host, port) = if let Some(r) = hostport.strip_prefix('[') {
            let (h, tail) = r
                .split_once(']')
                .ok_or_else(|| Error::InvalidArgument(format!("bad IPv6 literal in {s:?}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("bad port in {s:?}")))?,
                None => default_port(scheme),
            };
            (h.to_string(), port)
        } else {
            match hostport.split_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    p.parse()
                        .map_err(|_| Error::InvalidArgument(format!("bad port in {s:?}")))?,
                ),
                None => (hostport.to_string(), default_port(scheme)),
            }
        };

        Ok(TransferUrl {
            scheme,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// True when the URL points at this machine. Gates the unix-socket
    /// optimization: the advertised socket is only usable for same-host
    /// transfers.
    pub fn is_local(&self) -> bool {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return ip.is_loopback();
        }
        if self.host == "localhost" {
            return true;
        }
        match hostname::get() {
            Ok(name) => name.to_string_lossy() == self.host,
            Err(_) => false,
        }
    }
}

fn default_port(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_with_ticket() {
        let url = TransferUrl::parse("https://img.example:54322/images/ddc5ca6a").unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.host, "img.example");
        assert_eq!(url.port, 54322);
        assert_eq!(url.path, "/images/ddc5ca6a");
    }

    #[test]
    fn parses_http_default_port() {
        let url = TransferUrl::parse("http://127.0.0.1/images/t").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.port, 80);
    }

    #[test]
    fn parses_ipv6_literal() {
        let url = TransferUrl::parse("https://[::1]:54322/images/t").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 54322);
        assert!(url.is_local());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(TransferUrl::parse("ftp://host/images/t").is_err());
        assert!(TransferUrl::parse("host/images/t").is_err());
    }

    #[test]
    fn loopback_is_local_remote_is_not() {
        assert!(TransferUrl::parse("https://127.0.0.1:1/images/t")
            .unwrap()
            .is_local());
        assert!(TransferUrl::parse("https://localhost:1/images/t")
            .unwrap()
            .is_local());
        assert!(!TransferUrl::parse("https://img.remote.example:1/images/t")
            .unwrap()
            .is_local());
    }
}
