use httparse::Error as HttpParseError;
use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    // Handshake Errors
    #[error("Upgrade: websocket and Connection: Upgrade headers missing in the request")]
    NotWebSocketRequest,

    #[error("Unsupported Sec-WebSocket-Version, only version 13 is accepted")]
    UnsupportedVersion,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    // HTTP Errors
    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("Request head exceeds the 16KB limit")]
    RequestHeadTooLarge,

    #[error("Peer disconnected before completing the handshake")]
    PeerClosed,
}
