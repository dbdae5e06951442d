use crate::config::SessionConfig;
use crate::error::Error;
use crate::sink::{InputSink, OutputSink};
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

// Limit the maximum amount of data read to prevent a denial of service attack.
const MAX_HEAD_SIZE: usize = 1024 * 16; // 16 kilobytes
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 32;

/// The HTTP/1.1 request that asked for the upgrade.
///
/// Owns the socket and both byte sinks until the handshake decides whether
/// a session gets created. Any payload bytes the client sent right behind
/// the request head stay buffered and are handed to the session's input
/// sink, so an eager client loses nothing.
pub struct UpgradeRequest {
    socket: Arc<TcpStream>,
    config: SessionConfig,
    leftover: BytesMut,
    output: OutputSink,
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub async fn read(stream: TcpStream) -> Result<Self, Error> {
        Self::read_with_config(stream, SessionConfig::default()).await
    }

    pub async fn read_with_config(stream: TcpStream, config: SessionConfig) -> Result<Self, Error> {
        let socket = Arc::new(stream);
        let mut head = BytesMut::with_capacity(1024);
        let deadline = Instant::now() + config.io_timeout;

        // Some attackers connect to the TCP endpoint and freeze without ever
        // sending the handshake, so every read here runs under the deadline.
        while !contains_terminator(&head) {
            if head.len() > MAX_HEAD_SIZE {
                return Err(Error::RequestHeadTooLarge);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            timeout(remaining, socket.ready(Interest::READABLE)).await??;
            match socket.try_read_buf(&mut head) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }

        let (head_len, method, target, headers) = {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut header_storage);
            let head_len = match request.parse(&head)? {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => return Err(Error::IncompleteHTTPRequest),
            };
            let method = request.method.ok_or(Error::IncompleteHTTPRequest)?.to_string();
            let target = request.path.ok_or(Error::IncompleteHTTPRequest)?.to_string();
            let headers = request
                .headers
                .iter()
                .map(|header| {
                    (
                        header.name.to_string(),
                        String::from_utf8_lossy(header.value).trim().to_string(),
                    )
                })
                .collect();
            (head_len, method, target, headers)
        };

        let mut leftover = head;
        leftover.advance(head_len);

        let output = OutputSink::new(socket.clone(), config.io_timeout);
        Ok(Self {
            socket,
            config,
            leftover,
            output,
            method,
            target,
            headers,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Case-insensitive header lookup, HTTP header names being
    /// case-insensitive by definition.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Write a full HTTP response through the output sink and flush it.
    /// Content headers are only emitted when there is a body.
    pub(crate) async fn respond(
        &mut self,
        status: &str,
        extra_headers: &[(&str, &str)],
        body: &str,
    ) -> Result<(), Error> {
        let mut response = format!("HTTP/1.1 {}\r\n", status);
        for (name, value) in extra_headers {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
        if !body.is_empty() {
            response.push_str("Content-Type: text/plain\r\n");
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        response.push_str("\r\n");
        response.push_str(body);

        if !self.output.push(response.as_bytes()).await || !self.output.flush_all().await {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write handshake response",
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Arc<TcpStream>, InputSink, OutputSink, SessionConfig) {
        let input = InputSink::new(self.socket.clone(), self.leftover, self.config.io_timeout);
        (self.socket, input, self.output, self.config)
    }
}

fn contains_terminator(buf: &[u8]) -> bool {
    buf.windows(HEAD_TERMINATOR.len())
        .any(|window| window == HEAD_TERMINATOR)
}
