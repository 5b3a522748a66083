//! C6: per-connection state machine routing decoded frames to the right
//! component, and the reader/writer task split that backs it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatcherHandle;
use crate::wire::{self, ClientMessage, ServerMessage};
use crate::SpeedDaemon;

#[derive(Debug, Clone, Copy)]
enum Identity {
    Unidentified,
    Camera { road: u16, mile: u16, limit: u16 },
    Dispatcher { id: u64 },
}

/// Drive one accepted TCP connection until it closes.
pub async fn handle(stream: TcpStream, addr: SocketAddr, ctx: Arc<SpeedDaemon>) {
    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx): (UnboundedSender<ServerMessage>, UnboundedReceiver<ServerMessage>) =
        mpsc::unbounded_channel();
    let writer = spawn_writer(write_half, rx);

    let mut identity = Identity::Unidentified;
    let mut heartbeat_requested = false;
    let mut heartbeat_handle: Option<JoinHandle<()>> = None;
    let mut buf = Vec::with_capacity(1024);

    'reader: loop {
        let n = match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(client = %addr, "connection closed by peer");
                break 'reader;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(client = %addr, error = %e, "read failed");
                break 'reader;
            }
        };
        debug!(client = %addr, bytes = n, "read ok");

        loop {
            match wire::decode(&buf) {
                Ok(None) => break,
                Ok(Some((message, consumed))) => {
                    buf.drain(..consumed);
                    if let Err(reason) = route(
                        &ctx,
                        &addr,
                        &mut identity,
                        &mut heartbeat_requested,
                        &mut heartbeat_handle,
                        &tx,
                        message,
                    ) {
                        let _ = tx.send(ServerMessage::Error {
                            msg: reason.clone(),
                        });
                        warn!(client = %addr, reason = reason, "protocol error, closing");
                        break 'reader;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    let _ = tx.send(ServerMessage::Error {
                        msg: reason.clone(),
                    });
                    warn!(client = %addr, reason = reason, "codec error, closing");
                    break 'reader;
                }
            }
        }
    }

    if let Some(h) = heartbeat_handle.take() {
        h.abort();
    }
    if let Identity::Dispatcher { id } = identity {
        ctx.dispatchers.unregister(id);
    }
    drop(tx);
    let undelivered = writer.await.unwrap_or_default();
    for message in undelivered.into_iter().rev() {
        if let ServerMessage::Ticket(ticket) = message {
            ctx.dispatchers.requeue(ticket);
        }
    }
    info!(client = %addr, "connection finished");
}

/// Route one decoded message through the state machine. `Err` carries the
/// message to report to the client before closing.
fn route(
    ctx: &Arc<SpeedDaemon>,
    addr: &SocketAddr,
    identity: &mut Identity,
    heartbeat_requested: &mut bool,
    heartbeat_handle: &mut Option<JoinHandle<()>>,
    tx: &UnboundedSender<ServerMessage>,
    message: ClientMessage,
) -> Result<(), String> {
    match message {
        ClientMessage::WantHeartbeat { interval } => {
            if *heartbeat_requested {
                return Err("already requested heartbeat".to_string());
            }
            *heartbeat_requested = true;
            if interval > 0 {
                debug!(client = %addr, interval = interval, "starting heartbeat");
                *heartbeat_handle = Some(crate::heartbeat::spawn(interval, tx.clone()));
            }
            Ok(())
        }

        ClientMessage::IAmCamera { road, mile, limit } => match identity {
            Identity::Unidentified => {
                info!(client = %addr, road = road, mile = mile, limit = limit, "camera identified");
                *identity = Identity::Camera { road, mile, limit };
                Ok(())
            }
            _ => Err("already identified".to_string()),
        },

        ClientMessage::IAmDispatcher { roads } => match identity {
            Identity::Unidentified => {
                info!(client = %addr, roads = ?roads, "dispatcher identified");
                let id = ctx.dispatchers.next_id();
                ctx.dispatchers.register(
                    DispatcherHandle { id, tx: tx.clone() },
                    &roads,
                    &ctx.ledger,
                );
                *identity = Identity::Dispatcher { id };
                Ok(())
            }
            _ => Err("already identified".to_string()),
        },

        ClientMessage::Plate { plate, timestamp } => match *identity {
            Identity::Camera {
                road,
                mile,
                limit,
            } => {
                if !wire::is_valid_plate(&plate) {
                    return Err(format!(
                        "invalid plate {:?}",
                        String::from_utf8_lossy(&plate)
                    ));
                }
                debug!(client = %addr, plate = %String::from_utf8_lossy(&plate), timestamp = timestamp, "plate observed");
                let tickets = ctx
                    .registry
                    .record_observation(plate, road, mile, timestamp, limit);
                for ticket in tickets {
                    ctx.dispatchers.dispatch(ticket, &ctx.ledger);
                }
                Ok(())
            }
            Identity::Dispatcher { .. } => Err("dispatchers cannot report plates".to_string()),
            Identity::Unidentified => Err("not identified".to_string()),
        },
    }
}

/// Own the write half and drain the outbound channel until it closes. On a
/// write failure the message that failed plus everything still buffered in
/// `rx` are handed back to the caller as "undelivered" rather than dropped,
/// so tickets among them can be returned to `DispatcherRegistry`'s pending
/// queue (see `handle` above) instead of vanishing.
fn spawn_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: UnboundedReceiver<ServerMessage>,
) -> JoinHandle<Vec<ServerMessage>> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let bytes = message.encode();
            if let Err(e) = write_half.write_all(&bytes).await {
                error!(error = %e, "write failed, closing connection");
                let mut undelivered = vec![message];
                while let Ok(extra) = rx.try_recv() {
                    undelivered.push(extra);
                }
                return undelivered;
            }
        }
        Vec::new()
    })
}
