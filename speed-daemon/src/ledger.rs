//! C4: enforce at most one ticket per plate per calendar day.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::ticket::{day_of, Ticket};

#[derive(Debug, Default)]
pub struct Ledger {
    ticketed: Mutex<HashSet<(Vec<u8>, i64)>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check and, if accepted, record every day this ticket
    /// spans. Returns `false` (and mutates nothing) if any of those days is
    /// already in the ledger for this plate.
    pub fn add(&self, ticket: &Ticket) -> bool {
        let day1 = day_of(ticket.timestamp1);
        let day2 = day_of(ticket.timestamp2);

        let mut days = vec![day1];
        if day2 != day1 {
            days.push(day2);
        }

        let mut ticketed = self.ticketed.lock().unwrap();
        if days
            .iter()
            .any(|day| ticketed.contains(&(ticket.plate.clone(), *day)))
        {
            return false;
        }

        for day in days {
            ticketed.insert((ticket.plate.clone(), day));
        }
        true
    }
}
