//! Image transfer HTTP transport
//!
//! A hand-rolled HTTP/1.1 client speaking the imageio wire API over plain
//! TCP, TLS, or a local unix socket: `OPTIONS` capability probe,
//! `GET /extents`, ranged `GET`/`PUT`, and `PATCH` zero/flush requests.
//! One connection maps to one pooled transfer worker; connections are
//! never shared between workers.

use crate::error::{Error, Result};
use crate::extent::Extent;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Capabilities advertised by the OPTIONS probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub unix_socket: Option<String>,
}

impl ServerOptions {
    pub fn has(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn can_extents(&self) -> bool {
        self.has("extents")
    }

    pub fn can_zero(&self) -> bool {
        self.has("zero")
    }

    pub fn can_flush(&self) -> bool {
        self.has("flush")
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

struct Response {
    status: u16,
    body: Vec<u8>,
}

/// One keep-alive connection to the ticket resource.
#[derive(Debug)]
pub struct HttpConnection {
    stream: BufReader<Stream>,
    host: String,
    path: String,
}

impl HttpConnection {
    pub fn connect_tcp(host: &str, port: u16, path: &str) -> Result<Self> {
        let stream = tcp_connect(host, port)?;
        Ok(Self::new(Stream::Tcp(stream), host, path))
    }

    pub fn connect_tls(
        config: Arc<rustls::ClientConfig>,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<Self> {
        let tcp = tcp_connect(host, port)?;
        let name = crate::tls::server_name_for(host)?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| Error::Protocol(format!("TLS setup failed: {e}")))?;
        let stream = rustls::StreamOwned::new(conn, tcp);
        Ok(Self::new(Stream::Tls(Box::new(stream)), host, path))
    }

    #[cfg(unix)]
    pub fn connect_unix(socket: &Path, path: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket)?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
        Ok(Self::new(Stream::Unix(stream), "localhost", path))
    }

    fn new(stream: Stream, host: &str, path: &str) -> Self {
        HttpConnection {
            stream: BufReader::new(stream),
            host: host.to_string(),
            path: path.to_string(),
        }
    }

    /// Capability probe. Sent once per negotiation; the result is cached
    /// by the pool for the whole session.
    pub fn options(&mut self) -> Result<ServerOptions> {
        let res = self.request("OPTIONS", &self.path.clone(), &[], &[])?;
        check_status(&res, "OPTIONS")?;
        if res.body.is_empty() {
            return Ok(ServerOptions::default());
        }
        serde_json::from_slice(&res.body)
            .map_err(|e| Error::Protocol(format!("bad OPTIONS response: {e}")))
    }

    /// Remote allocation map for the whole image.
    pub fn get_extents(&mut self) -> Result<Vec<Extent>> {
        let path = format!("{}/extents", self.path);
        let res = self.request("GET", &path, &[], &[])?;
        check_status(&res, "GET /extents")?;
        serde_json::from_slice(&res.body)
            .map_err(|e| Error::Protocol(format!("bad extents response: {e}")))
    }

    /// Write `data` at `offset`.
    pub fn put(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64 - 1;
        let range = format!("bytes {offset}-{end}/*");
        let res = self.request(
            "PUT",
            &format!("{}?flush=n", self.path.clone()),
            &[("Content-Range", &range)],
            data,
        )?;
        check_status(&res, "PUT")
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn get_range(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64 - 1;
        let range = format!("bytes={offset}-{end}");
        let res = self.request("GET", &self.path.clone(), &[("Range", &range)], &[])?;
        check_status(&res, "GET")?;
        if res.body.len() != buf.len() {
            return Err(Error::Protocol(format!(
                "short range read: wanted {} bytes, got {}",
                buf.len(),
                res.body.len()
            )));
        }
        buf.copy_from_slice(&res.body);
        Ok(())
    }

    /// Zero a range on the target without transferring payload bytes.
    pub fn zero(&mut self, offset: u64, length: u64) -> Result<()> {
        let body = json!({
            "op": "zero",
            "offset": offset,
            "size": length,
            "flush": false,
        });
        self.patch(&body.to_string())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.patch(&json!({ "op": "flush" }).to_string())
    }

    fn patch(&mut self, body: &str) -> Result<()> {
        let res = self.request(
            "PATCH",
            &self.path.clone(),
            &[("Content-Type", "application/json")],
            body.as_bytes(),
        )?;
        check_status(&res, "PATCH")
    }

    fn request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<Response> {
        let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {}\r\n", self.host);
        for (name, value) in headers {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        req.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        let out = self.stream.get_mut();
        out.write_all(req.as_bytes())?;
        if !body.is_empty() {
            out.write_all(body)?;
        }
        out.flush()?;

        self.read_response()
    }

    fn read_response(&mut self) -> Result<Response> {
        let mut line = String::new();
        self.stream.read_line(&mut line)?;
        if line.is_empty() {
            return Err(Error::protocol("connection closed by server"));
        }
        let status: u16 = line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("bad status line {line:?}")))?;

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            self.stream.read_line(&mut line)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body)?;

        Ok(Response { status, body })
    }
}

fn tcp_connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).map_err(|e| Error::EndpointUnreachable {
        reason: format!("cannot connect to {host}:{port}: {e}"),
    })?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
    stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
    Ok(stream)
}

fn check_status(res: &Response, context: &str) -> Result<()> {
    if (200..300).contains(&res.status) {
        return Ok(());
    }
    // Error responses carry the server's message in the body.
    let reason = String::from_utf8_lossy(&res.body);
    Err(Error::Protocol(format!(
        "{context} failed with status {}: {}",
        res.status,
        reason.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot server that captures the request and answers with a
    /// canned response.
    fn canned_server(response: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut captured = Vec::new();
            let mut buf = [0u8; 4096];
            // Read the full head, then as many body bytes as the request
            // declares.
            let head_end = loop {
                let n = stream.read(&mut buf).unwrap();
                captured.extend_from_slice(&buf[..n]);
                if let Some(i) = captured.windows(4).position(|w| w == b"\r\n\r\n") {
                    break i + 4;
                }
                if n == 0 {
                    break captured.len();
                }
            };
            let head = String::from_utf8_lossy(&captured[..head_end]).into_owned();
            let body_len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            while captured.len() < head_end + body_len {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                captured.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&captured).into_owned()
        });
        (port, handle)
    }

    #[test]
    fn options_parses_features_and_socket() {
        let body = r#"{"features": ["extents", "zero", "flush"], "unix_socket": "/run/img.sock"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (port, server) = canned_server(response);

        let mut conn = HttpConnection::connect_tcp("127.0.0.1", port, "/images/tkt").unwrap();
        let opts = conn.options().unwrap();
        assert!(opts.can_extents() && opts.can_zero() && opts.can_flush());
        assert_eq!(opts.unix_socket.as_deref(), Some("/run/img.sock"));

        let request = server.join().unwrap();
        assert!(request.starts_with("OPTIONS /images/tkt HTTP/1.1\r\n"));
    }

    #[test]
    fn put_sends_content_range() {
        let (port, server) = canned_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let mut conn = HttpConnection::connect_tcp("127.0.0.1", port, "/images/tkt").unwrap();
        conn.put(4096, b"payload").unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("PUT /images/tkt?flush=n HTTP/1.1\r\n"));
        assert!(request.contains("Content-Range: bytes 4096-4102/*\r\n"));
        assert!(request.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn zero_sends_patch_body() {
        let (port, server) = canned_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let mut conn = HttpConnection::connect_tcp("127.0.0.1", port, "/images/tkt").unwrap();
        conn.zero(100, 200).unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("PATCH /images/tkt HTTP/1.1\r\n"));
        let body_at = request.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&request[body_at..]).unwrap();
        assert_eq!(body["op"], "zero");
        assert_eq!(body["offset"], 100);
        assert_eq!(body["size"], 200);
    }

    #[test]
    fn server_error_body_is_surfaced() {
        let (port, _server) = canned_server(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 14\r\n\r\nticket expired",
        );
        let mut conn = HttpConnection::connect_tcp("127.0.0.1", port, "/images/tkt").unwrap();
        let err = conn.options().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("403"), "message: {msg}");
        assert!(msg.contains("ticket expired"), "message: {msg}");
    }

    #[test]
    fn unreachable_endpoint_maps_to_endpoint_error() {
        // Port 1 on loopback is essentially never listening.
        match HttpConnection::connect_tcp("127.0.0.1", 1, "/images/tkt") {
            Err(Error::EndpointUnreachable { .. }) => {}
            other => panic!("expected EndpointUnreachable, got {other:?}"),
        }
    }
}
