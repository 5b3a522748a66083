//! C2: a per-connection task emitting `Heartbeat` frames at a client-chosen
//! cadence, until the connection's writer channel is gone.

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::debug;

use crate::wire::ServerMessage;

/// Spawn the heartbeat task for `interval` tenths of a second. The caller is
/// expected to have already checked `interval > 0` — see the
/// `ClientMessage::WantHeartbeat` arm of `connection::route`.
pub fn spawn(interval_tenths: u32, tx: UnboundedSender<ServerMessage>) -> JoinHandle<()> {
    let period = Duration::from_millis(interval_tenths as u64 * 100);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if tx.send(ServerMessage::Heartbeat).is_err() {
                debug!("heartbeat target gone, stopping");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test(start_paused = true)]
    async fn emits_heartbeats_at_the_requested_cadence() {
        let (tx, mut rx) = unbounded_channel();
        let handle = spawn(10, tx); // 10 tenths = 1.0s

        for _ in 0..3 {
            tokio::time::advance(StdDuration::from_millis(1_000)).await;
            assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Heartbeat));
        }

        handle.abort();
    }

    #[tokio::test]
    async fn stops_once_receiver_is_dropped() {
        let (tx, rx) = unbounded_channel();
        let handle = spawn(1, tx);
        drop(rx);
        handle.await.unwrap();
    }
}
