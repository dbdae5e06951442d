use crate::config::SessionConfig;
use crate::frame::{encode_header, CloseCode, OpCode};
use crate::sink::{InputSink, OutputSink};
use bytes::BytesMut;
use log::{debug, trace, warn};
use std::mem;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

type TextHandler = Box<dyn FnMut(String) + Send>;
type BytesHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// One server-side websocket session over an upgraded TCP stream.
///
/// The session is driven by a single owner calling [`process`] in a loop;
/// there is no internal task and no locking. Inbound frames are parsed
/// incrementally, so the driver can feed it whatever chunking TCP happens
/// to deliver. Complete messages and control notifications come out through
/// the assignable `on_*` handler slots, and unset handlers silently drop.
///
/// The session never closes the socket. Once `process` returns false the
/// driver drops the session and decides what to do with the connection.
///
/// [`process`]: Session::process
pub struct Session {
    socket: Arc<TcpStream>,
    input: InputSink,
    output: OutputSink,
    config: SessionConfig,

    open: bool,
    sent_close: bool,
    close_reason: Option<CloseCode>,

    // Reassembly state for the message currently crossing the wire.
    // pending_left > 0 means the parser is suspended mid-payload and
    // pending_mask has been rotated to the right phase for the next chunk.
    pending_opcode: Option<OpCode>,
    pending_fin: bool,
    pending_left: u64,
    pending_mask: [u8; 4],
    pending_buf: Vec<u8>,

    on_text: Option<TextHandler>,
    on_binary: Option<BytesHandler>,
    on_ping: Option<BytesHandler>,
    on_pong: Option<BytesHandler>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.open)
            .field("sent_close", &self.sent_close)
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn from_parts(
        parts: (Arc<TcpStream>, InputSink, OutputSink, SessionConfig),
    ) -> Self {
        let (socket, input, output, config) = parts;
        Self {
            socket,
            input,
            output,
            config,
            open: true,
            sent_close: false,
            close_reason: None,
            pending_opcode: None,
            pending_fin: false,
            pending_left: 0,
            pending_mask: [0; 4],
            pending_buf: Vec::new(),
            on_text: None,
            on_binary: None,
            on_ping: None,
            on_pong: None,
        }
    }

    /// Wrap a connection whose HTTP upgrade already happened elsewhere.
    pub fn after_handshake(stream: TcpStream) -> Self {
        Self::after_handshake_with_config(stream, SessionConfig::default())
    }

    pub fn after_handshake_with_config(stream: TcpStream, config: SessionConfig) -> Self {
        let socket = Arc::new(stream);
        let input = InputSink::new(socket.clone(), BytesMut::new(), config.io_timeout);
        let output = OutputSink::new(socket.clone(), config.io_timeout);
        Self::from_parts((socket, input, output, config))
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Why the session ended (or will end): the code sent to the peer, or
    /// a synthetic 1005/1006 for silent terminations. `None` while the
    /// session is healthy.
    pub fn close_reason(&self) -> Option<CloseCode> {
        self.close_reason
    }

    pub fn on_text(&mut self, handler: impl FnMut(String) + Send + 'static) {
        self.on_text = Some(Box::new(handler));
    }

    pub fn on_binary(&mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) {
        self.on_binary = Some(Box::new(handler));
    }

    pub fn on_ping(&mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) {
        self.on_ping = Some(Box::new(handler));
    }

    pub fn on_pong(&mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) {
        self.on_pong = Some(Box::new(handler));
    }

    /// Run one tick of the event pump: flush staged output, wait up to
    /// `timeout_secs` (fractional seconds honored down to microseconds)
    /// for the socket to become ready, then drain both directions.
    ///
    /// Returns true while the session should keep being driven; a timeout
    /// with nothing to do counts as true. Returns false once the session
    /// is over, after which `close_reason` says why.
    pub async fn process(&mut self, timeout_secs: f64) -> bool {
        if !self.open {
            return false;
        }

        if !self.output.try_flush() {
            self.fail(CloseCode::Abnormal);
            return false;
        }

        if self.sent_close && self.output.is_empty() {
            debug!("close handshake drained, session over ({:?})", self.close_reason);
            self.open = false;
            return false;
        }

        let interest = if self.sent_close {
            Interest::WRITABLE
        } else if self.output.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        let wait = Duration::from_secs_f64(timeout_secs.max(0.0));
        let ready = match timeout(wait, self.socket.ready(interest)).await {
            Err(_) => return true, // nothing happened within this tick
            Ok(Err(_)) => {
                self.fail(CloseCode::Abnormal);
                return false;
            }
            Ok(Ok(ready)) => ready,
        };

        if ready.is_writable() && !self.output.try_flush() {
            self.fail(CloseCode::Abnormal);
            return false;
        }

        if !self.sent_close && ready.is_readable() {
            if self.input.is_empty() && !self.input.try_fill() {
                debug!("peer went away");
                self.fail(CloseCode::Abnormal);
                return false;
            }
            while !self.input.is_empty() {
                if !self.frame_step().await {
                    break;
                }
            }
        }

        self.open
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(OpCode::Text, text.as_bytes()).await;
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.send_frame(OpCode::Binary, data).await;
    }

    pub async fn ping(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= 125, "control payloads are capped at 125 bytes");
        self.send_frame(OpCode::Ping, payload).await;
    }

    pub async fn pong(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= 125, "control payloads are capped at 125 bytes");
        self.send_frame(OpCode::Pong, payload).await;
    }

    /// Send a Close frame and remember the reason. Synthetic codes (1005,
    /// 1006) produce an empty close payload, every other code goes out as
    /// a big-endian u16. Once a close has been sent, further sends of any
    /// kind, including a second close, are dropped; the session ends when
    /// the output drains.
    pub async fn close(&mut self, code: CloseCode) {
        if !self.open || self.sent_close {
            return;
        }
        self.close_reason = Some(code);
        self.sent_close = true;

        let delivered = if code.is_synthetic() {
            let (header, header_len) = encode_header(true, OpCode::Close, 0);
            self.output.push(&header[..header_len]).await
        } else {
            let (header, header_len) = encode_header(true, OpCode::Close, 2);
            self.output.push(&header[..header_len]).await
                && self.output.push(&code.as_u16().to_be_bytes()).await
        };
        if !delivered {
            self.fail(CloseCode::Abnormal);
        }
    }

    async fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        if !self.open || self.sent_close {
            return;
        }
        let (header, header_len) = encode_header(true, opcode, payload.len() as u64);
        if !self.output.push(&header[..header_len]).await || !self.output.push(payload).await {
            self.fail(CloseCode::Abnormal);
        }
    }

    fn fail(&mut self, reason: CloseCode) {
        self.close_reason = Some(reason);
        self.open = false;
    }

    async fn protocol_violation(&mut self, what: &str) -> bool {
        warn!("protocol violation: {}", what);
        self.close(CloseCode::ProtocolError).await;
        false
    }

    /// One step of the inbound state machine. Returns whether the driver
    /// should keep stepping this tick.
    async fn frame_step(&mut self) -> bool {
        if self.pending_left > 0 {
            return self.continue_payload().await;
        }
        self.read_frame_header().await
    }

    async fn read_frame_header(&mut self) -> bool {
        // Two header bytes plus the start of the mask, which a conforming
        // client always sends. Where the mask actually sits depends on the
        // length encoding, resolved below.
        let mut header = [0u8; 6];
        if !self.input.take_exact(&mut header).await {
            warn!("frame header did not arrive in time");
            self.close(CloseCode::PolicyViolation).await;
            return false;
        }

        let final_fragment = (header[0] & 0b10000000) != 0;
        let rsv = header[0] & 0b01110000;
        let masked = (header[1] & 0b10000000) != 0;
        let len7 = (header[1] & 0b01111111) as u64;

        // RSV bits only mean something once an extension is negotiated,
        // and no extension ever is.
        if rsv != 0 {
            return self.protocol_violation("non-zero RSV bits").await;
        }
        if !masked {
            return self.protocol_violation("unmasked client frame").await;
        }
        let opcode = match OpCode::from(header[0] & 0b00001111) {
            Some(opcode) => opcode,
            None => return self.protocol_violation("unknown opcode").await,
        };
        if opcode.is_control() && (len7 > 125 || !final_fragment) {
            return self
                .protocol_violation("fragmented or oversized control frame")
                .await;
        }
        if opcode == OpCode::Continue && !self.pending_fin {
            return self
                .protocol_violation("continuation without a message in progress")
                .await;
        }
        if matches!(opcode, OpCode::Text | OpCode::Binary) && self.pending_fin {
            return self
                .protocol_violation("new data frame inside a fragmented message")
                .await;
        }

        let (length, mask) = match len7 {
            126 => {
                let mut ext = [0u8; 2];
                if !self.input.take_exact(&mut ext).await {
                    self.close(CloseCode::PolicyViolation).await;
                    return false;
                }
                let length = u16::from_be_bytes([header[2], header[3]]) as u64;
                (length, [header[4], header[5], ext[0], ext[1]])
            }
            127 => {
                let mut ext = [0u8; 8];
                if !self.input.take_exact(&mut ext).await {
                    self.close(CloseCode::PolicyViolation).await;
                    return false;
                }
                let length = u64::from_be_bytes([
                    header[2], header[3], header[4], header[5], ext[0], ext[1], ext[2], ext[3],
                ]);
                if length & (1 << 63) != 0 {
                    return self.protocol_violation("payload length with the top bit set").await;
                }
                (length, [ext[4], ext[5], ext[6], ext[7]])
            }
            _ => (len7, [header[2], header[3], header[4], header[5]]),
        };

        trace!(
            "frame in: fin={} opcode={:?} len={}",
            final_fragment,
            opcode,
            length
        );

        if opcode.is_control() {
            return self.control_frame(opcode, length as usize, mask).await;
        }

        if (self.pending_buf.len() as u64).saturating_add(length)
            > self.config.max_message_size as u64
        {
            warn!(
                "message would exceed the {} byte cap",
                self.config.max_message_size
            );
            self.close(CloseCode::MessageTooLong).await;
            return false;
        }

        // A Continue frame keeps the opcode of the message it extends.
        if self.pending_opcode.is_none() {
            self.pending_opcode = Some(opcode);
        }
        self.pending_fin = !final_fragment;
        self.pending_left = length;
        self.pending_mask = mask;

        // Zero-length frames and whatever payload is already buffered
        // complete right here.
        self.continue_payload().await
    }

    /// Control payloads are at most 125 bytes and never fragment, so the
    /// whole frame resolves here without touching the pending_* state of
    /// a data message it may have interleaved into.
    async fn control_frame(&mut self, opcode: OpCode, length: usize, mask: [u8; 4]) -> bool {
        let mut payload = vec![0u8; length];
        if !self.input.take_exact(&mut payload).await {
            self.close(CloseCode::PolicyViolation).await;
            return false;
        }
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        match opcode {
            OpCode::Ping => {
                // The reply is enqueued before the callback runs and gets
                // an opportunistic flush, putting it ahead of any output
                // the application produces afterwards.
                self.send_frame(OpCode::Pong, &payload).await;
                if !self.output.try_flush() {
                    self.fail(CloseCode::Abnormal);
                    return false;
                }
                if let Some(handler) = self.on_ping.as_mut() {
                    handler(payload);
                }
                true
            }
            OpCode::Pong => {
                if let Some(handler) = self.on_pong.as_mut() {
                    handler(payload);
                }
                true
            }
            _ => {
                let code = if payload.len() >= 2 {
                    CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]))
                } else {
                    CloseCode::NoStatus
                };
                debug!("peer sent close ({:?})", code);
                self.close(code).await;
                false
            }
        }
    }

    /// Consume buffered payload bytes for the frame in flight, unmasking
    /// as they arrive. The parser resumes from here on the next tick when
    /// the frame spans socket reads.
    async fn continue_payload(&mut self) -> bool {
        let want = self.pending_left.min(self.input.buffered() as u64) as usize;
        if want > 0 {
            let start = self.pending_buf.len();
            self.pending_buf.resize(start + want, 0);
            let taken = self.input.take_at_most(&mut self.pending_buf[start..]);
            debug_assert_eq!(taken, want);
            for (i, byte) in self.pending_buf[start..].iter_mut().enumerate() {
                *byte ^= self.pending_mask[i % 4];
            }
            self.pending_left -= want as u64;

            if self.pending_left > 0 {
                // The next chunk resumes mid-mask, so shift the key to
                // keep the per-byte phase aligned.
                let offset = want % 4;
                let mask = self.pending_mask;
                for i in 0..4 {
                    self.pending_mask[i] = mask[(offset + i) % 4];
                }
                return true;
            }
        }

        if self.pending_left > 0 {
            return true; // nothing buffered, resume later
        }
        if self.pending_fin {
            return true; // frame complete, message still open
        }
        self.deliver_message().await
    }

    async fn deliver_message(&mut self) -> bool {
        let payload = mem::take(&mut self.pending_buf);
        let opcode = self.pending_opcode.take();
        self.pending_fin = false;

        match opcode {
            Some(OpCode::Text) => match String::from_utf8(payload) {
                Ok(text) => {
                    if let Some(handler) = self.on_text.as_mut() {
                        handler(text);
                    }
                    true
                }
                Err(_) => {
                    warn!("text message with invalid UTF-8");
                    self.close(CloseCode::InvalidPayload).await;
                    false
                }
            },
            Some(OpCode::Binary) => {
                if let Some(handler) = self.on_binary.as_mut() {
                    handler(payload);
                }
                true
            }
            _ => true,
        }
    }
}
