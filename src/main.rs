use log::*;
use socket_pump::handshake::accept_async;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

enum Echo {
    Text(String),
    Binary(Vec<u8>),
}

async fn handle_connection(peer: SocketAddr, stream: TcpStream) {
    let mut session = match accept_async(stream).await {
        Ok(session) => session,
        Err(err) => {
            error!("Error when performing handshake with {}: {}", peer, err);
            return;
        }
    };

    // Callbacks run while process borrows the session, so they stage the
    // echoes here and the driver loop sends them between ticks.
    let inbox: Arc<Mutex<Vec<Echo>>> = Arc::new(Mutex::new(Vec::new()));

    let staged = inbox.clone();
    session.on_text(move |text| staged.lock().unwrap().push(Echo::Text(text)));
    let staged = inbox.clone();
    session.on_binary(move |data| staged.lock().unwrap().push(Echo::Binary(data)));
    session.on_ping(move |payload| debug!("ping with {} bytes", payload.len()));

    while session.process(0.25).await {
        let pending: Vec<Echo> = inbox.lock().unwrap().drain(..).collect();
        for echo in pending {
            match echo {
                Echo::Text(text) => session.send_text(&text).await,
                Echo::Binary(data) => session.send_binary(&data).await,
            }
        }
    }

    info!("{} disconnected ({:?})", peer, session.close_reason());
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let addr = "127.0.0.1:9002";
    let listener = TcpListener::bind(&addr).await.expect("Can't listen");
    info!("Listening on: {}", addr);

    while let Ok((stream, _)) = listener.accept().await {
        let peer = stream
            .peer_addr()
            .expect("connected streams should have a peer address");
        info!("Peer address: {}", peer);

        tokio::spawn(handle_connection(peer, stream));
    }
}
