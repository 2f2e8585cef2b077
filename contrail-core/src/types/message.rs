//! The envelope type stages exchange through the broker.
use serde::{Deserialize, Serialize};

use super::Record;

/// Discriminates what an [Envelope] carries.
///
/// The numeric tags are a wire contract between producer and consumer binaries
/// and must match across the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Rows of flight data to be processed
    DataRows,
    /// A circulating termination token carrying completion counters
    TerminationToken,
    /// The combined final result of a fan-in stage
    FinalAggregate,
}

impl EnvelopeKind {
    /// The tag byte used on the wire
    pub fn tag(self) -> u8 {
        match self {
            EnvelopeKind::DataRows => 0,
            EnvelopeKind::TerminationToken => 1,
            EnvelopeKind::FinalAggregate => 2,
        }
    }

    /// Look up the kind for a wire tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EnvelopeKind::DataRows),
            1 => Some(EnvelopeKind::TerminationToken),
            2 => Some(EnvelopeKind::FinalAggregate),
            _ => None,
        }
    }
}

/// A tagged container of zero or more [Record]s.
///
/// Envelopes are immutable once constructed and travel by value across
/// channel boundaries, there is no shared ownership between sender and
/// receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// What this envelope carries
    pub kind: EnvelopeKind,
    /// The rows in this envelope. Control kinds carry at most one record.
    pub records: Vec<Record>,
}

impl Envelope {
    /// An envelope of data rows
    pub fn data(records: Vec<Record>) -> Self {
        Self {
            kind: EnvelopeKind::DataRows,
            records,
        }
    }

    /// A termination token envelope. The record carries the completion counters.
    pub fn termination(record: Record) -> Self {
        Self {
            kind: EnvelopeKind::TerminationToken,
            records: vec![record],
        }
    }

    /// A final aggregate envelope carrying a combined result
    pub fn final_aggregate(record: Record) -> Self {
        Self {
            kind: EnvelopeKind::FinalAggregate,
            records: vec![record],
        }
    }

    /// The single record of a control envelope, if present
    pub fn first_record(&self) -> Option<&Record> {
        self.records.first()
    }
}
