//! The FIFO pairing queue.
//!
//! # Concurrency note
//!
//! The queue is mutated only by the hub's matchmaker task; it is plain
//! single-owner data, synchronized (with the rest of the hub state) one
//! level up.

use std::collections::VecDeque;
use std::time::Instant;

use matchwire_protocol::{MatchMode, PeerId};

use crate::MatchmakerError;

/// One waiting peer.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub peer_id: PeerId,
    pub mode: MatchMode,
    pub enqueued_at: Instant,
}

/// FIFO pairing queue. Oldest two live tickets pair first.
///
/// `RANKED` rides the same queue as `RANDOM` (rating-aware pairing is
/// reserved for later); `INVITE`/`CUSTOM` never enter it.
#[derive(Debug, Default)]
pub struct Matchmaker {
    queue: VecDeque<Ticket>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a ticket.
    ///
    /// # Errors
    /// - [`MatchmakerError::ModeNotQueued`] for INVITE/CUSTOM
    /// - [`MatchmakerError::AlreadyQueued`] for a duplicate peer
    pub fn enqueue(
        &mut self,
        peer_id: PeerId,
        mode: MatchMode,
    ) -> Result<(), MatchmakerError> {
        match mode {
            MatchMode::Random | MatchMode::Ranked => {}
            MatchMode::Invite | MatchMode::Custom => {
                return Err(MatchmakerError::ModeNotQueued(mode));
            }
        }
        if self.contains(&peer_id) {
            return Err(MatchmakerError::AlreadyQueued(peer_id));
        }
        tracing::debug!(%peer_id, ?mode, "ticket enqueued");
        self.queue.push_back(Ticket {
            peer_id,
            mode,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Removes a peer's ticket. O(n); returns whether one existed.
    pub fn cancel(&mut self, peer_id: &PeerId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|t| &t.peer_id != peer_id);
        let removed = self.queue.len() < before;
        if removed {
            tracing::debug!(%peer_id, "ticket cancelled");
        }
        removed
    }

    /// One drain pass: pops pairs of live tickets oldest-first.
    /// Tickets whose peer is no longer live (per `is_live`) are
    /// discarded silently. A lone live ticket stays at the head of the
    /// queue for the next pass.
    pub fn drain(
        &mut self,
        is_live: impl Fn(&PeerId) -> bool,
    ) -> Vec<(Ticket, Ticket)> {
        let mut pairs = Vec::new();
        let mut held: Option<Ticket> = None;

        while let Some(ticket) = self.queue.pop_front() {
            if !is_live(&ticket.peer_id) {
                tracing::debug!(
                    peer_id = %ticket.peer_id,
                    "discarding ticket for dead peer"
                );
                continue;
            }
            match held.take() {
                Some(first) => pairs.push((first, ticket)),
                None => held = Some(ticket),
            }
        }

        // The odd one out keeps its place at the front.
        if let Some(ticket) = held {
            self.queue.push_front(ticket);
        }

        pairs
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.queue.iter().any(|t| &t.peer_id == peer_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// =========================================================================
// Tests
// =========================================================================
