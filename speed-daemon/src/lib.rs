//! Average-speed enforcement over the custom camera/dispatcher binary
//! protocol: cameras report plate sightings, the server infers speeds
//! between camera pairs on the same road, and tickets are handed to
//! whichever dispatcher is responsible for that road.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

mod connection;
mod dispatch;
mod heartbeat;
mod ledger;
mod registry;
mod ticket;
mod wire;

use dispatch::DispatcherRegistry;
use ledger::Ledger;
use registry::Registry;

/// Shared state handed to every connection task: the measurement registry,
/// the ticket ledger, and the dispatcher registry. Replaces the source's
/// package-level globals with one value behind a single `Arc`.
pub struct SpeedDaemon {
    registry: Registry,
    ledger: Ledger,
    dispatchers: DispatcherRegistry,
}

impl Default for SpeedDaemon {
    fn default() -> Self {
        SpeedDaemon {
            registry: Registry::new(),
            ledger: Ledger::new(),
            dispatchers: DispatcherRegistry::new(),
        }
    }
}

pub async fn serve(listener: TcpListener) {
    info!("starting");
    let ctx = Arc::new(SpeedDaemon::default());

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(client = %addr, "connection received");
                tokio::spawn(connection::handle(stream, addr, Arc::clone(&ctx)));
            }
            Err(e) => {
                error!(error = ?e, "accept failed");
            }
        }
    }
}
