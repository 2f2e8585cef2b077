//! Delivery topologies binding stages to the message broker.
//!
//! A stage worker never talks to the broker directly, it only holds
//! [counting endpoints](crate::channels) produced by a [Topology]. The factory
//! offers two binding patterns:
//!
//! * **Partitioned**: N instances bind to one logical queue, the broker
//!   delivers each envelope to exactly one of them (competing consumers).
//!   Used to scale a stage's throughput without duplicating work.
//! * **Broadcast**: every bound consumer gets its own copy of each envelope.
//!   Used wherever a control or result signal must reach *all* instances of
//!   the next stage.
use std::error::Error;

use thiserror::Error;

use crate::channels::{CountingConsumer, CountingProducer};

pub mod in_thread;

pub use in_thread::InThreadTopology;

/// A raw send capability into the broker. Implementations must not block.
pub trait RawProducer: Send {
    /// Send a single encoded envelope.
    ///
    /// An error is fatal to the sending worker instance; transports must
    /// handle transient conditions internally.
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// A raw receive capability from the broker
pub trait RawConsumer: Send {
    /// Block until an encoded envelope is available.
    ///
    /// `None` means the channel was closed, which is a clean shutdown signal,
    /// not an error.
    fn recv(&self) -> Option<Vec<u8>>;
}

/// Binds counting endpoints into one of the two delivery patterns.
///
/// Workers are agnostic to which pattern backs their endpoints, they only
/// call send and receive.
pub trait Topology: Send + Sync {
    /// Bind a consumer to a partitioned queue. Each envelope on the queue is
    /// delivered to exactly one of the bound consumers.
    fn partitioned_consumer(&self, queue: &str) -> Result<CountingConsumer, TopologyError>;

    /// Bind a producer to a partitioned queue
    fn partitioned_producer(&self, queue: &str) -> Result<CountingProducer, TopologyError>;

    /// Bind a consumer to a broadcast exchange. The consumer receives its own
    /// copy of every envelope published to the exchange. The binding key
    /// names this consumer's private queue.
    fn broadcast_consumer(
        &self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<CountingConsumer, TopologyError>;

    /// Bind a producer to a broadcast exchange
    fn broadcast_producer(&self, exchange: &str) -> Result<CountingProducer, TopologyError>;
}

/// Error binding an endpoint to the broker
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The endpoint could not be bound
    #[error("error binding endpoint: {0}")]
    BindError(Box<dyn Error + Send + Sync>),
}

/// Unrecoverable broker transport failure. Fatal to the affected worker
/// instance; process supervision is responsible for restarting it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport failed to hand a message to the broker
    #[error("error sending message: {0}")]
    SendError(Box<dyn Error + Send + Sync>),
}

impl TransportError {
    /// Wrap an error as a send failure
    pub fn send_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::SendError(Box::new(err))
    }
}

impl TopologyError {
    /// Wrap an error as a bind failure
    pub fn bind_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::BindError(Box::new(err))
    }
}
