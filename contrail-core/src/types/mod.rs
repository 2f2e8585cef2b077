//! Contains Contrail's data types.
//! Stages exchange data exclusively as [Envelope]s of [Record]s, both across
//! the broker and in tests.
mod message;
mod record;

pub use message::{Envelope, EnvelopeKind};
pub use record::{FieldError, Record};
