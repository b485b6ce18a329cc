//! Transport seam
//!
//! The engine consumes envelopes from a [`Transport`] and reports finished
//! positions through an [`Acknowledger`](crate::Acknowledger). Real
//! transports live in the embedding process; [`ChannelTransport`] is an
//! in-process transport over a std channel.

use crate::commit::Acknowledger;
use crate::envelope::{Envelope, TransportPosition};
use crate::error::Error;
use crate::manager::ConflationManager;
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Source of envelopes
pub trait Transport {
    /// Block until the next envelope arrives; `None` once the transport closed
    fn receive(&mut self) -> Option<Envelope>;
}

/// Totals of one [`pump`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    /// Envelopes handed to `admit`
    pub received: u64,
    /// Envelopes whose event type had no registration
    pub unregistered: u64,
}

/// Feed every envelope from `transport` into `manager` until it closes or the
/// manager shuts down
///
/// Envelopes of unregistered event types are logged and skipped; their
/// positions are never tracked, so they do not hold back acknowledgment.
pub fn pump<T>(transport: &mut T, manager: &ConflationManager) -> PumpSummary
where
    T: Transport + ?Sized,
{
    let mut summary = PumpSummary::default();
    while !manager.is_shutdown() {
        let Some(envelope) = transport.receive() else {
            break;
        };
        summary.received += 1;

        if let Err(Error::UnregisteredEventType(event_type)) = manager.admit(envelope) {
            summary.unregistered += 1;
            warn!(%event_type, "skipping envelope of unregistered event type");
        }
    }
    info!(
        received = summary.received,
        unregistered = summary.unregistered,
        "transport pump finished"
    );
    summary
}

/// Receiving end of an in-process channel
#[derive(Debug)]
pub struct ChannelTransport {
    receiver: Receiver<Envelope>,
}

/// Sending end of a [`ChannelTransport`]
#[derive(Debug, Clone)]
pub struct EnvelopeSender {
    sender: Sender<Envelope>,
}

impl EnvelopeSender {
    /// Send an envelope; fails once the transport was dropped
    pub fn send(&self, envelope: Envelope) -> std::result::Result<(), SendError<Envelope>> {
        self.sender.send(envelope)
    }
}

impl ChannelTransport {
    /// Create a connected sender/transport pair
    pub fn channel() -> (EnvelopeSender, ChannelTransport) {
        let (sender, receiver) = mpsc::channel();
        (EnvelopeSender { sender }, ChannelTransport { receiver })
    }
}

impl Transport for ChannelTransport {
    fn receive(&mut self) -> Option<Envelope> {
        self.receiver.recv().ok()
    }
}

/// Acknowledger that records every acknowledged position
#[derive(Debug, Clone, Default)]
pub struct RecordingAcknowledger {
    positions: Arc<Mutex<Vec<TransportPosition>>>,
}

impl RecordingAcknowledger {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions acknowledged so far, in order
    pub fn acknowledged(&self) -> Vec<TransportPosition> {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest acknowledged position of `partition`
    pub fn latest(&self, partition: u32) -> Option<TransportPosition> {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|p| p.partition == partition)
            .copied()
    }
}

impl Acknowledger for RecordingAcknowledger {
    fn acknowledge(&self, position: TransportPosition) {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(position);
    }
}
