//! "Novos itens" banner fed by the store's change subscription.
//!
//! Best-effort: missed events only undercount, and an explicit refetch
//! remains the source of truth.

use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::TryRecvError;

use crate::store::{ChangeEvent, ChangeKind};

pub struct ChangeBanner {
    table: String,
    events: Receiver<ChangeEvent>,
    arrived: usize,
}

impl ChangeBanner {
    pub fn new(events: Receiver<ChangeEvent>, table: &str) -> Self {
        Self {
            table: table.to_string(),
            events,
            arrived: 0,
        }
    }

    /// Drains queued events and returns the count of unseen inserts.
    pub fn poll(&mut self) -> usize {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if event.table == self.table && event.kind == ChangeKind::Insert {
                        self.arrived += 1;
                    }
                }
                // Lagged events may be on any table; count them so a refetch is offered.
                Err(TryRecvError::Lagged(skipped)) => self.arrived += skipped as usize,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.arrived
    }

    pub fn message(&self) -> Option<String> {
        match self.arrived {
            0 => None,
            1 => Some("1 novo item - clique para atualizar".to_string()),
            n => Some(format!("{n} novos itens - clique para atualizar")),
        }
    }

    /// Called after the caller refetched.
    pub fn acknowledge(&mut self) {
        self.arrived = 0;
    }
}
