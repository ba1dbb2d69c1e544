//! WebSocket transport for sessions.
//!
//! A participant opens two WebSocket connections sharing a fresh ticket:
//!
//! ```text
//!   ws://host/instructions/<ticket> ──┐
//!                                     ├── paired by ticket ──► HostHandle::accept
//!   ws://host/uploads/<ticket>      ──┘
//! ```
//!
//! Every binary message is one packet. Text, ping and pong frames are not
//! packets and are skipped; a close frame ends the pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Channel;
use crate::error::{Result, SpaceError};
use crate::pipe::{Connection, Pipe};
use crate::session::HostHandle;

/// How long the first half of a connection waits for its partner.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

fn segment(channel: Channel) -> &'static str {
    match channel {
        Channel::Instructions => "instructions",
        Channel::Uploads => "uploads",
    }
}

/// Parse `/instructions/<ticket>` or `/uploads/<ticket>`.
pub fn route(path: &str) -> Option<(Channel, Uuid)> {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let channel = match parts.next()? {
        "instructions" => Channel::Instructions,
        "uploads" => Channel::Uploads,
        _ => return None,
    };
    let ticket = Uuid::parse_str(parts.next()?).ok()?;
    Some((channel, ticket))
}

/// Wrap a WebSocket as a packet pipe.
fn websocket_pipe<S>(ws: WebSocketStream<S>) -> Pipe
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();
    let sink = write
        .sink_map_err(|e| SpaceError::pipe(format!("websocket send: {e}")))
        .with(|packet: Vec<u8>| future::ready(Ok::<_, SpaceError>(Message::Binary(packet.into()))));
    let stream = read
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(Vec::from(data))),
                Ok(_) => None,
                Err(e) => Some(Err(SpaceError::pipe(format!("websocket receive: {e}")))),
            })
        });
    Pipe::new(sink, stream)
}

/// Halves waiting for their partner, by ticket.
type Pending = Arc<Mutex<HashMap<Uuid, (Channel, Pipe)>>>;

/// Accept WebSocket participants on `listener` and hand each paired
/// connection to `host`. Runs until the listener fails.
pub async fn serve(listener: TcpListener, host: HostHandle) -> Result<()> {
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    if let Ok(addr) = listener.local_addr() {
        log::info!("Accepting participants on ws://{addr}");
    }

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| SpaceError::pipe(format!("accept: {e}")))?;
        log::debug!("New TCP connection from {addr}");

        let pending = pending.clone();
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, pending, host).await {
                log::warn!("Connection from {addr} failed: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pending: Pending,
    host: HostHandle,
) -> Result<()> {
    let mut routed = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match route(request.uri().path()) {
            Some(found) => {
                routed = Some(found);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("unknown path".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    })
    .await
    .map_err(|e| SpaceError::pipe(format!("handshake: {e}")))?;

    let Some((channel, ticket)) = routed else {
        return Err(SpaceError::pipe("handshake accepted without a route"));
    };
    log::debug!("{addr} opened {} for ticket {ticket}", segment(channel));
    let pipe = websocket_pipe(ws);

    let (pipe, partner) = {
        let mut waiting = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match waiting.remove(&ticket) {
            Some((other, partner)) if other != channel => (pipe, partner),
            Some(first) => {
                waiting.insert(ticket, first);
                return Err(SpaceError::pipe(format!(
                    "ticket {ticket} already has a {} pipe",
                    segment(channel)
                )));
            }
            None => {
                waiting.insert(ticket, (channel, pipe));
                tokio::spawn(expire(pending.clone(), ticket));
                return Ok(());
            }
        }
    };

    let connection = match channel {
        Channel::Instructions => Connection::new(pipe, partner),
        Channel::Uploads => Connection::new(partner, pipe),
    };
    let author = host.accept(connection).await?;
    log::info!("Participant at {addr} joined as {author}");
    Ok(())
}

async fn expire(pending: Pending, ticket: Uuid) {
    tokio::time::sleep(PAIRING_TIMEOUT).await;
    let stale = pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&ticket);
    if let Some((channel, _pipe)) = stale {
        log::warn!("Ticket {ticket} never opened its partner of {}", segment(channel));
    }
}

/// Connect to a host at `url` (e.g. `ws://127.0.0.1:9191`).
pub async fn connect(url: &str) -> Result<Connection> {
    let base = url.trim_end_matches('/');
    let ticket = Uuid::new_v4();
    let instructions = open(format!("{base}/instructions/{ticket}")).await?;
    let uploads = open(format!("{base}/uploads/{ticket}")).await?;
    Ok(Connection::new(instructions, uploads))
}

async fn open(url: String) -> Result<Pipe> {
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| SpaceError::pipe(format!("connect {url}: {e}")))?;
    Ok(websocket_pipe(ws))
}
