//! TLS client configuration
//!
//! HTTPS transports verify the server against a caller-supplied CA
//! certificate. There is no insecure mode: a missing or empty CA file is
//! an error, not a downgrade.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

pub fn client_config(ca_file: &Path) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(ca_file).map_err(|source| {
        Error::SourceUnavailable {
            path: ca_file.to_path_buf(),
            source,
        }
    })?);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            Error::InvalidArgument(format!("bad certificate in {}: {e}", ca_file.display()))
        })?;
        roots.add(cert).map_err(|e| {
            Error::InvalidArgument(format!("unusable certificate in {}: {e}", ca_file.display()))
        })?;
    }
    if roots.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no CA certificates found in {}",
            ca_file.display()
        )));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::InvalidArgument(format!("invalid TLS server name {host:?}")))
}
