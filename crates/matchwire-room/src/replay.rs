//! Replay recording: a persistent subscriber on a room's outbound
//! stream.
//!
//! Replay is nothing special to the room — it is one more fanout
//! target. The recorder subscribes a channel via
//! [`RoomHandle::subscribe`](crate::RoomHandle::subscribe) and appends
//! every broadcast frame to its log.

use matchwire_protocol::Envelope;
use tokio::sync::mpsc;

use crate::{RoomError, RoomHandle};

/// Accumulates every frame a room broadcasts.
pub struct ReplayRecorder {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    frames: Vec<Envelope>,
}

impl ReplayRecorder {
    /// Subscribes a new recorder to the given room.
    pub async fn attach(handle: &RoomHandle) -> Result<Self, RoomError> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.subscribe(tx).await?;
        Ok(Self {
            receiver: rx,
            frames: Vec::new(),
        })
    }

    /// Pulls everything broadcast since the last call into the log and
    /// returns the full log so far.
    pub fn frames(&mut self) -> &[Envelope] {
        while let Ok(envelope) = self.receiver.try_recv() {
            self.frames.push(envelope);
        }
        &self.frames
    }

    /// Awaits the next broadcast frame (also appending it to the log).
    pub async fn next(&mut self) -> Option<Envelope> {
        let envelope = self.receiver.recv().await?;
        self.frames.push(envelope.clone());
        Some(envelope)
    }
}
