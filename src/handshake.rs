use crate::config::SessionConfig;
use crate::error::Error;
use crate::request::UpgradeRequest;
use crate::session::Session;
use crate::utils::generate_websocket_accept_value;
use log::{debug, warn};
use tokio::net::TcpStream;

/// Validate the upgrade headers and promote the request into a live
/// [`Session`].
///
/// Rejections answer with a plain `400` before returning the error, so the
/// client always learns why it was turned away:
/// - `Upgrade: websocket` must match exactly (case-insensitive) and
///   `Connection` must contain `upgrade` somewhere (proxies commonly send
///   `keep-alive, Upgrade`);
/// - only `Sec-WebSocket-Version: 13` is spoken here, and the rejection
///   advertises that via a `Sec-WebSocket-Version` response header;
/// - the `Sec-WebSocket-Key` value is trusted verbatim, it only needs to
///   be present.
pub async fn accept(mut request: UpgradeRequest) -> Result<Session, Error> {
    let upgrade_ok = request
        .header("Upgrade")
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    let connection_ok = request
        .header("Connection")
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    if !upgrade_ok || !connection_ok {
        warn!(
            "rejecting non-websocket request for {}",
            request.target()
        );
        request
            .respond("400 Bad Request", &[], "Must send a websocket request.")
            .await?;
        return Err(Error::NotWebSocketRequest);
    }

    if request.header("Sec-WebSocket-Version") != Some("13") {
        warn!(
            "rejecting websocket request with version {:?}",
            request.header("Sec-WebSocket-Version")
        );
        request
            .respond(
                "400 Bad Request",
                &[("Sec-WebSocket-Version", "13")],
                "Unsupported version.",
            )
            .await?;
        return Err(Error::UnsupportedVersion);
    }

    let key = match request.header("Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => key.to_owned(),
        _ => {
            warn!("rejecting websocket request without Sec-WebSocket-Key");
            request
                .respond("400 Bad Request", &[], "Cannot accept without key.")
                .await?;
            return Err(Error::NoSecWebsocketKey);
        }
    };

    let accept_value = generate_websocket_accept_value(&key);
    request
        .respond(
            "101 Switching Protocols",
            &[
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Accept", accept_value.as_str()),
            ],
            "",
        )
        .await?;
    debug!("upgraded {} to a websocket session", request.target());

    Ok(Session::from_parts(request.into_parts()))
}

/// Read the upgrade request off a fresh TCP connection and accept it in
/// one go.
pub async fn accept_async(stream: TcpStream) -> Result<Session, Error> {
    accept_async_with_config(stream, SessionConfig::default()).await
}

pub async fn accept_async_with_config(
    stream: TcpStream,
    config: SessionConfig,
) -> Result<Session, Error> {
    let request = UpgradeRequest::read_with_config(stream, config).await?;
    accept(request).await
}
