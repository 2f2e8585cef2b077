//! Counting channel endpoints.
//!
//! These wrap the raw broker capabilities and tally the application rows
//! crossing them. The termination detection protocol is built entirely on
//! these tallies: a stage knows it drained its upstream once the counts
//! accumulated on a circulating token account for everything upstream
//! declared it sent.
use tracing::warn;

use crate::topology::{RawConsumer, RawProducer, TransportError};
use crate::types::{Envelope, EnvelopeKind};
use crate::wire;

/// Sending endpoint which counts the rows it has sent.
///
/// Only [EnvelopeKind::DataRows] envelopes count; control envelopes cross
/// without touching the tally. Each worker instance owns its endpoints
/// exclusively, there is no cross-instance shared state.
pub struct CountingProducer {
    inner: Box<dyn RawProducer>,
    sent: usize,
}

impl CountingProducer {
    /// Wrap a raw producer. Usually called by a
    /// [Topology](crate::topology::Topology) implementation.
    pub fn new(inner: Box<dyn RawProducer>) -> Self {
        Self { inner, sent: 0 }
    }

    /// Encode and send one envelope. Errors are fatal to the calling
    /// worker instance.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.inner.send(wire::encode(envelope))?;
        if envelope.kind == EnvelopeKind::DataRows {
            self.sent += envelope.records.len();
        }
        Ok(())
    }

    /// Rows sent since creation or the last [clear](Self::clear)
    pub fn sent_count(&self) -> usize {
        self.sent
    }

    /// Reset the tally to zero
    pub fn clear(&mut self) {
        self.sent = 0;
    }
}

/// Receiving endpoint which counts the rows it has received
pub struct CountingConsumer {
    inner: Box<dyn RawConsumer>,
    received: usize,
}

impl CountingConsumer {
    /// Wrap a raw consumer. Usually called by a
    /// [Topology](crate::topology::Topology) implementation.
    pub fn new(inner: Box<dyn RawConsumer>) -> Self {
        Self { inner, received: 0 }
    }

    /// Block until an envelope arrives or the channel closes.
    ///
    /// `None` signals a closed channel (graceful shutdown). A payload that
    /// fails to decode is logged and skipped, the consumer keeps waiting;
    /// data rows are at-least-once, dropping an undecodable payload never
    /// aborts a stage.
    pub fn recv(&mut self) -> Option<Envelope> {
        loop {
            let payload = self.inner.recv()?;
            match wire::decode(&payload) {
                Ok(envelope) => {
                    if envelope.kind == EnvelopeKind::DataRows {
                        self.received += envelope.records.len();
                    }
                    return Some(envelope);
                }
                Err(error) => {
                    warn!(%error, bytes = payload.len(), "discarding undecodable envelope");
                }
            }
        }
    }

    /// Rows received since creation or the last [clear](Self::clear)
    pub fn received_count(&self) -> usize {
        self.received
    }

    /// Reset the tally to zero
    pub fn clear(&mut self) {
        self.received = 0;
    }
}
