//! Matchmaking for Matchwire: a FIFO pairing queue drained on a fixed
//! cadence by the hub, plus the reference Elo rating update.
//!
//! The queue knows nothing about rooms — `drain` hands back pairs of
//! tickets, and the hub creates a room per pair and notifies both
//! peers. Tickets referencing peers that disconnected while waiting are
//! discarded silently during the drain.

mod error;
mod queue;
pub mod rating;

pub use error::MatchmakerError;
pub use queue::{Matchmaker, Ticket};
