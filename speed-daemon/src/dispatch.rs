//! C5: map road -> dispatchers, and the pending-ticket queues that hold
//! tickets until a road gets its first dispatcher.
//!
//! Two queues hold tickets that currently have nowhere to go: `pending`
//! holds tickets that have never been checked against the ledger yet
//! (§4.5's "the ledger check happens only at actual delivery attempt"), and
//! `approved` holds tickets whose ledger day(s) are already consumed because
//! they were handed to a dispatcher's writer once and never confirmed sent
//! (the connection died mid-write) — those must not go through `Ledger::add`
//! a second time, or the ticket's own earlier success would make its own
//! retry look like a duplicate and suppress it for good.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::ledger::Ledger;
use crate::ticket::Ticket;
use crate::wire::ServerMessage;

/// Identifies one dispatcher connection's outbound channel.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    pub id: u64,
    pub tx: UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct State {
    by_road: HashMap<u16, Vec<DispatcherHandle>>,
    pending: HashMap<u16, VecDeque<Ticket>>,
    approved: HashMap<u16, VecDeque<Ticket>>,
}

pub struct DispatcherRegistry {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        DispatcherRegistry {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a dispatcher for the given roads, then drain each road's
    /// `approved` queue unconditionally and its `pending` queue against the
    /// ledger, delivering whatever the ledger still accepts.
    pub fn register(&self, handle: DispatcherHandle, roads: &[u16], ledger: &Ledger) {
        let mut state = self.state.lock().unwrap();
        for &road in roads {
            state
                .by_road
                .entry(road)
                .or_default()
                .push(handle.clone());
        }

        for &road in roads {
            if let Some(queue) = state.approved.get_mut(&road) {
                while let Some(ticket) = queue.pop_front() {
                    info!(road = road, plate = %String::from_utf8_lossy(&ticket.plate), "redelivering previously unsent ticket");
                    let _ = handle.tx.send(ServerMessage::Ticket(ticket));
                }
            }

            let Some(queue) = state.pending.get_mut(&road) else {
                continue;
            };
            while let Some(ticket) = queue.pop_front() {
                if ledger.add(&ticket) {
                    info!(road = road, plate = %String::from_utf8_lossy(&ticket.plate), "delivering queued ticket");
                    let _ = handle.tx.send(ServerMessage::Ticket(ticket));
                } else {
                    debug!(road = road, "queued ticket suppressed by ledger at delivery");
                }
            }
        }
    }

    /// Remove a dispatcher from every road it was registered for.
    pub fn unregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        for handles in state.by_road.values_mut() {
            handles.retain(|h| h.id != id);
        }
    }

    /// Deliver a ticket to a dispatcher for its road, or queue it if none is
    /// registered yet. The ledger is only consulted when a dispatcher is
    /// actually available to receive the ticket right now.
    pub fn dispatch(&self, ticket: Ticket, ledger: &Ledger) {
        let mut state = self.state.lock().unwrap();
        let handle = state
            .by_road
            .get(&ticket.road)
            .and_then(|handles| handles.first())
            .cloned();

        match handle {
            Some(handle) => {
                if ledger.add(&ticket) {
                    info!(road = ticket.road, plate = %String::from_utf8_lossy(&ticket.plate), "dispatching ticket");
                    let _ = handle.tx.send(ServerMessage::Ticket(ticket));
                } else {
                    debug!(road = ticket.road, "ticket suppressed by ledger at delivery");
                }
            }
            None => {
                debug!(road = ticket.road, "no dispatcher yet, queueing ticket");
                state.pending.entry(ticket.road).or_default().push_back(ticket);
            }
        }
    }

    /// Return a ticket that was handed to a dispatcher's writer but never
    /// confirmed sent (its connection died mid-write) to circulation. The
    /// ticket's day(s) are already recorded in the ledger, so this bypasses
    /// `Ledger::add` entirely: if another dispatcher is live for the road it
    /// is sent immediately, otherwise it goes to the front of the `approved`
    /// queue for whichever dispatcher registers next.
    pub fn requeue(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        let handle = state
            .by_road
            .get(&ticket.road)
            .and_then(|handles| handles.first())
            .cloned();

        match handle {
            Some(handle) => {
                info!(road = ticket.road, plate = %String::from_utf8_lossy(&ticket.plate), "redelivering unsent ticket to another dispatcher");
                let _ = handle.tx.send(ServerMessage::Ticket(ticket));
            }
            None => {
                debug!(road = ticket.road, "no dispatcher yet, holding unsent ticket as approved");
                state
                    .approved
                    .entry(ticket.road)
                    .or_default()
                    .push_front(ticket);
            }
        }
    }
}
