//! RTSP connection transport: owns the TCP (or TLS) stream and its read
//! buffer, serializes requests with CSeq sequencing, and demultiplexes the
//! inbound byte stream into interleaved binary frames and RTSP messages.
//!
//! An interleaved frame returned by [`Transport::receive`] borrows the read
//! buffer and is only valid until the next call on the transport; the borrow
//! checker enforces that callers copy out what they keep.

use super::message::{parse_auth_fields, parse_rtsp_version, Headers, Response, RtspRequest};
use super::RtspError;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

pub const DEFAULT_PORT: u16 = 554;

/// Interleaved payloads are capped at 65535 by the 16-bit frame length, so a
/// 64 KiB buffer always holds one frame contiguously.
const READ_BUF_SIZE: usize = 64 * 1024;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(6);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// The network stream under a transport: plain TCP, or TLS for `rtsps://`.
pub enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One inbound unit from the connection.
#[derive(Debug)]
pub enum Frame<'a> {
    /// `$`-framed binary data; the payload borrows the transport read buffer.
    Interleaved(InterleavedFrame<'a>),
    /// An RTSP response, body already drained.
    Response(Response),
    /// A server-initiated RTSP request, body already drained.
    Request(RtspRequest),
}

#[derive(Debug)]
pub struct InterleavedFrame<'a> {
    pub channel: u8,
    pub payload: &'a [u8],
}

/// Credentials resolved from a 401 challenge; re-derives the header value
/// per request since Digest covers the method and URI.
enum Authorization {
    Basic(String),
    Digest { realm: String, nonce: String },
}

pub struct Transport<S> {
    stream: S,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    seq: u32,
    username: String,
    password: String,
    auth: Option<Authorization>,
    pub user_agent: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// Normalizes an RTSP URL: validates the scheme, applies the default port,
/// and splits credentials out of the URL (they must not appear in request
/// URIs). Returns the cleaned URL and the username/password pair.
pub fn parse_url(raw: &str) -> Result<(Url, String, String), RtspError> {
    let mut url = Url::parse(raw)?;
    if url.scheme() != "rtsp" && url.scheme() != "rtsps" {
        return Err(RtspError::Protocol(format!(
            "unsupported URL scheme {}, must be rtsp or rtsps",
            url.scheme()
        )));
    }
    let username = url.username().to_string();
    let password = url.password().unwrap_or_default().to_string();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    if url.port().is_none() {
        let _ = url.set_port(Some(DEFAULT_PORT));
    }
    Ok((url, username, password))
}

/// Opens a TCP connection (TLS-wrapped for `rtsps://`) to the URL's host.
pub async fn connect(
    url: &Url,
    username: &str,
    password: &str,
    connect_timeout: Duration,
) -> Result<Transport<Conn>, RtspError> {
    let host = url
        .host_str()
        .ok_or_else(|| RtspError::Protocol("URL missing host".into()))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);

    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| RtspError::Timeout("connect"))??;

    let stream = if url.scheme() == "rtsps" {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| RtspError::Protocol(format!("invalid TLS server name {host}")))?;
        let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| RtspError::Timeout("TLS handshake"))??;
        Conn::Tls(Box::new(tls))
    } else {
        Conn::Plain(tcp)
    };

    Ok(Transport::new(stream, username, password))
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S, username: &str, password: &str) -> Self {
        Self {
            stream,
            buf: vec![0; READ_BUF_SIZE],
            start: 0,
            end: 0,
            seq: 0,
            username: username.to_string(),
            password: password.to_string(),
            auth: None,
            user_agent: String::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Serializes and flushes one request, returning its CSeq.
    pub async fn request(
        &mut self,
        uri: &str,
        method: &str,
        headers: &[(&str, &str)],
    ) -> Result<u32, RtspError> {
        self.seq += 1;
        let seq = self.seq;

        let mut out = String::with_capacity(256);
        let _ = write!(out, "{method} {uri} RTSP/1.0\r\n");
        let _ = write!(out, "CSeq: {seq}\r\n");
        if let Some(auth) = &self.auth {
            let _ = write!(out, "Authorization: {}\r\n", auth.header_value_for(self, method, uri));
        }
        if !self.user_agent.is_empty() {
            let _ = write!(out, "User-Agent: {}\r\n", self.user_agent);
        }
        for (name, value) in headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");

        timeout(self.write_timeout, self.stream.write_all(out.as_bytes()))
            .await
            .map_err(|_| RtspError::Timeout("write"))??;
        timeout(self.write_timeout, self.stream.flush())
            .await
            .map_err(|_| RtspError::Timeout("write"))??;
        Ok(seq)
    }

    /// Reads the next frame off the connection.
    ///
    /// A `$` byte starts an interleaved binary frame; an upper-case ASCII
    /// byte starts an RTSP message. Anything else means the connection has
    /// lost framing.
    pub async fn receive(&mut self) -> Result<Frame<'_>, RtspError> {
        self.fill_at_least(1).await?;
        let first = self.buf[self.start];

        if first == b'$' {
            self.fill_at_least(4).await?;
            let channel = self.buf[self.start + 1];
            let len =
                u16::from_be_bytes([self.buf[self.start + 2], self.buf[self.start + 3]]) as usize;
            self.consume(4);
            self.fill_at_least(len).await?;
            let offset = self.start;
            self.consume(len);
            return Ok(Frame::Interleaved(InterleavedFrame {
                channel,
                payload: &self.buf[offset..offset + len],
            }));
        }

        if !first.is_ascii_uppercase() {
            return Err(RtspError::Desync);
        }

        let line = self.read_line().await?;
        let (first_token, rest) = line
            .split_once(' ')
            .ok_or_else(|| RtspError::Protocol(format!("malformed RTSP message {line:?}")))?;

        if parse_rtsp_version(first_token).is_some() {
            // Status line: "RTSP/1.0 200 OK"
            let status_text = rest.trim_start();
            let (code, reason) = match status_text.split_once(' ') {
                Some((code, reason)) => (code, reason),
                None => (status_text, ""),
            };
            if code.len() != 3 {
                return Err(RtspError::Protocol(format!(
                    "malformed RTSP status code {code:?}"
                )));
            }
            let status: u16 = code
                .parse()
                .map_err(|_| RtspError::Protocol(format!("malformed RTSP status code {code:?}")))?;
            let headers = self.read_headers().await?;
            let body = self.read_body(&headers).await?;
            return Ok(Frame::Response(Response {
                status,
                reason: reason.to_string(),
                headers,
                body,
            }));
        }

        // Request line: "METHOD uri RTSP/1.0"
        let (uri, version) = rest
            .rsplit_once(' ')
            .ok_or_else(|| RtspError::Protocol(format!("malformed RTSP request {line:?}")))?;
        if parse_rtsp_version(version).is_none() {
            return Err(RtspError::Protocol(format!(
                "malformed RTSP version {version:?}"
            )));
        }
        let headers = self.read_headers().await?;
        self.read_body(&headers).await?;
        Ok(Frame::Request(RtspRequest {
            method: first_token.to_string(),
            uri: uri.to_string(),
            headers,
        }))
    }

    /// Sends a request and reads its response, retrying exactly once after a
    /// 401 with the credentials the challenge asks for.
    pub async fn round_trip(
        &mut self,
        uri: &str,
        method: &str,
        headers: &[(&str, &str)],
    ) -> Result<Response, RtspError> {
        let mut got_401 = false;
        loop {
            let seq = self.request(uri, method, headers).await?;

            let resp = match self.receive().await? {
                Frame::Response(resp) => resp,
                Frame::Interleaved(frame) => {
                    return Err(RtspError::Protocol(format!(
                        "interleaved frame on channel {} while awaiting response",
                        frame.channel
                    )))
                }
                Frame::Request(req) => {
                    return Err(RtspError::Protocol(format!(
                        "server request {} while awaiting response",
                        req.method
                    )))
                }
            };

            match resp.cseq() {
                Some(v) if v == seq => {}
                Some(v) => {
                    return Err(RtspError::Protocol(format!(
                        "mismatch response CSeq, got {v} expecting {seq}"
                    )))
                }
                None => return Err(RtspError::Protocol("invalid response CSeq".into())),
            }

            if resp.status == 401 {
                if got_401 {
                    return Err(RtspError::Unauthorized);
                }
                let challenge = resp
                    .header("WWW-Authenticate")
                    .ok_or_else(|| RtspError::Protocol("missing WWW-Authenticate".into()))?;
                self.auth = Some(Authorization::from_challenge(
                    challenge,
                    &self.username,
                    &self.password,
                )?);
                got_401 = true;
                continue;
            }

            return Ok(resp);
        }
    }

    async fn read_line(&mut self) -> Result<String, RtspError> {
        loop {
            let window = &self.buf[self.start..self.end];
            if let Some(i) = window.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&window[..i]).into_owned();
                self.consume(i + 2);
                return Ok(line);
            }
            if self.end - self.start >= self.buf.len() {
                return Err(RtspError::Protocol("RTSP header line too long".into()));
            }
            self.fill_more().await?;
        }
    }

    async fn read_headers(&mut self) -> Result<Headers, RtspError> {
        let mut headers = Headers::default();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RtspError::Protocol(format!("malformed header line {line:?}")))?;
            headers.push(name.trim().to_string(), value.trim().to_string());
        }
    }

    async fn read_body(&mut self, headers: &Headers) -> Result<Vec<u8>, RtspError> {
        let len: usize = match headers.get("Content-Length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| RtspError::Protocol(format!("invalid Content-Length {v:?}")))?,
            None => return Ok(Vec::new()),
        };

        let mut body = Vec::with_capacity(len);
        while body.len() < len {
            if self.start == self.end {
                self.fill_more().await?;
            }
            let take = (len - body.len()).min(self.end - self.start);
            body.extend_from_slice(&self.buf[self.start..self.start + take]);
            self.consume(take);
        }
        Ok(body)
    }

    /// Ensures `n` contiguous buffered bytes, compacting first if the tail of
    /// the buffer cannot hold them.
    async fn fill_at_least(&mut self, n: usize) -> Result<(), RtspError> {
        debug_assert!(n <= self.buf.len());
        if self.start + n > self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        while self.end - self.start < n {
            self.fill_more().await?;
        }
        Ok(())
    }

    async fn fill_more(&mut self) -> Result<(), RtspError> {
        if self.end == self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = timeout(
            self.read_timeout,
            tokio::io::AsyncReadExt::read(&mut self.stream, &mut self.buf[self.end..]),
        )
        .await
        .map_err(|_| RtspError::Timeout("read"))??;
        if n == 0 {
            return Err(RtspError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        self.end += n;
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

impl Authorization {
    fn from_challenge(
        challenge: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, RtspError> {
        if let Some(rest) = strip_prefix_ignore_case(challenge, "Digest ") {
            let fields = parse_auth_fields(rest);
            Ok(Authorization::Digest {
                realm: fields.get("realm").cloned().unwrap_or_default(),
                nonce: fields.get("nonce").cloned().unwrap_or_default(),
            })
        } else if strip_prefix_ignore_case(challenge, "Basic ").is_some()
            || challenge.eq_ignore_ascii_case("Basic")
        {
            let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
            Ok(Authorization::Basic(format!("Basic {encoded}")))
        } else {
            Err(RtspError::Protocol(format!(
                "unknown WWW-Authenticate: {challenge}"
            )))
        }
    }

    fn header_value_for<S>(&self, transport: &Transport<S>, method: &str, uri: &str) -> String {
        match self {
            Authorization::Basic(value) => value.clone(),
            Authorization::Digest { realm, nonce } => {
                let username = &transport.username;
                let ha1 = md5_hex(format!("{}:{realm}:{}", username, transport.password));
                let ha2 = md5_hex(format!("{method}:{uri}"));
                let response = md5_hex(format!("{ha1}:{nonce}:{ha2}"));
                format!(
                    "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
                )
            }
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn md5_hex(input: impl AsRef<[u8]>) -> String {
    let digest = Md5::digest(input.as_ref());
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn pair() -> (Transport<DuplexStream>, DuplexStream) {
        let (client, server) = tokio::io::duplex(READ_BUF_SIZE);
        (Transport::new(client, "admin", "secret"), server)
    }

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            raw.push(byte[0]);
        }
        String::from_utf8(raw).unwrap()
    }

    #[tokio::test]
    async fn cseq_starts_at_one_and_increments() {
        let (mut t, mut server) = pair();

        assert_eq!(t.request("rtsp://cam/s", "OPTIONS", &[]).await.unwrap(), 1);
        assert_eq!(t.request("rtsp://cam/s", "OPTIONS", &[]).await.unwrap(), 2);

        let first = read_request(&mut server).await;
        assert!(first.starts_with("OPTIONS rtsp://cam/s RTSP/1.0\r\n"));
        assert!(first.contains("CSeq: 1\r\n"));
        let second = read_request(&mut server).await;
        assert!(second.contains("CSeq: 2\r\n"));
    }

    #[tokio::test]
    async fn receives_interleaved_frame() {
        let (mut t, mut server) = pair();
        tokio::io::AsyncWriteExt::write_all(&mut server, &[b'$', 2, 0, 3, 0xAA, 0xBB, 0xCC])
            .await
            .unwrap();

        match t.receive().await.unwrap() {
            Frame::Interleaved(frame) => {
                assert_eq!(frame.channel, 2);
                assert_eq!(frame.payload, &[0xAA, 0xBB, 0xCC]);
            }
            other => panic!("expected interleaved frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receives_response_with_body() {
        let (mut t, mut server) = pair();
        let wire = b"RTSP/1.0 200 OK\r\nCSeq: 7\r\nContent-Length: 5\r\n\r\nhello";
        tokio::io::AsyncWriteExt::write_all(&mut server, wire)
            .await
            .unwrap();

        match t.receive().await.unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.reason, "OK");
                assert_eq!(resp.cseq(), Some(7));
                assert_eq!(resp.body, b"hello");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn desync_on_unexpected_byte() {
        let (mut t, mut server) = pair();
        tokio::io::AsyncWriteExt::write_all(&mut server, &[0x03])
            .await
            .unwrap();
        assert!(matches!(t.receive().await, Err(RtspError::Desync)));
    }

    #[tokio::test]
    async fn digest_auth_retries_once_with_expected_response() {
        let (mut t, server) = pair();

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let first = read_request(&mut server).await;
            assert!(first.contains("CSeq: 1\r\n"));
            assert!(!first.contains("Authorization"));
            tokio::io::AsyncWriteExt::write_all(
                &mut server,
                b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n",
            )
            .await
            .unwrap();

            let second = read_request(&mut server).await;
            assert!(second.contains("CSeq: 2\r\n"));
            // MD5("u:r:p")=ha1, MD5("DESCRIBE:rtsp://host/s")=ha2,
            // response=MD5("ha1:n:ha2") per RFC 2069
            let ha1 = md5_hex("admin:r:secret");
            let ha2 = md5_hex("DESCRIBE:rtsp://host/s");
            let expected = md5_hex(format!("{ha1}:n:{ha2}"));
            assert!(second.contains(&format!("response=\"{expected}\"")));
            assert!(second.contains("username=\"admin\""));
            tokio::io::AsyncWriteExt::write_all(
                &mut server,
                b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n",
            )
            .await
            .unwrap();
        });

        let resp = t
            .round_trip("rtsp://host/s", "DESCRIBE", &[])
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn second_401_is_fatal() {
        let (mut t, server) = pair();

        let server_task = tokio::spawn(async move {
            let mut server = server;
            for seq in 1..=2 {
                read_request(&mut server).await;
                let resp = format!(
                    "RTSP/1.0 401 Unauthorized\r\nCSeq: {seq}\r\nWWW-Authenticate: Basic realm=\"r\"\r\n\r\n"
                );
                tokio::io::AsyncWriteExt::write_all(&mut server, resp.as_bytes())
                    .await
                    .unwrap();
            }
        });

        let err = t
            .round_trip("rtsp://host/s", "DESCRIBE", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RtspError::Unauthorized));
        server_task.await.unwrap();
    }

    #[test]
    fn url_normalization() {
        let (url, user, pass) = parse_url("rtsp://admin:pw@cam.local/stream1").unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "pw");
        assert_eq!(url.as_str(), "rtsp://cam.local:554/stream1");

        assert!(parse_url("http://cam.local/stream1").is_err());
    }
}
