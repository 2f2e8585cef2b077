//! In-process broker backed by flume channels.
//!
//! This topology runs a whole pipeline inside one process, with every stage
//! instance on its own thread. It is the reference implementation of the
//! [Topology] semantics and what the test suite runs against; a networked
//! broker binding plugs in behind the same trait.
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::channels::{CountingConsumer, CountingProducer};

use super::{RawConsumer, RawProducer, Topology, TopologyError, TransportError};

/// Registry of queues and exchanges shared across all endpoint clones
type Shared = Arc<Mutex<BrokerState>>;

#[derive(Default)]
struct BrokerState {
    closed: bool,
    /// One MPMC channel per partitioned queue. The channel distributes each
    /// message to exactly one receiver, which is precisely the competing
    /// consumers pattern.
    queues: IndexMap<String, QueueChannel>,
    /// Per-exchange list of private consumer channels
    exchanges: IndexMap<String, Vec<Binding>>,
}

struct QueueChannel {
    sender: flume::Sender<Vec<u8>>,
    receiver: flume::Receiver<Vec<u8>>,
}

struct Binding {
    key: String,
    sender: flume::Sender<Vec<u8>>,
}

/// The broker was closed or the addressed queue/exchange no longer exists
#[derive(Debug, Error)]
#[error("broker closed or '{0}' not bound")]
pub struct BrokerClosed(String);

/// Provides partitioned and broadcast bindings over in-process channels
#[derive(Clone, Default)]
pub struct InThreadTopology {
    shared: Shared,
}

impl InThreadTopology {
    /// Create a new broker with no queues or exchanges bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the broker. Every pending blocking `recv` on a bound consumer
    /// will drain buffered envelopes and then observe the closed channel;
    /// subsequent sends fail.
    pub fn close(&self) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.shared.lock().unwrap();
        debug!(
            queues = state.queues.len(),
            exchanges = state.exchanges.len(),
            "closing in-thread broker"
        );
        state.closed = true;
        // dropping the registered senders is what disconnects the consumers
        state.queues.clear();
        state.exchanges.clear();
    }
}

impl Topology for InThreadTopology {
    fn partitioned_consumer(&self, queue: &str) -> Result<CountingConsumer, TopologyError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.shared.lock().unwrap();
        if state.closed {
            return Err(TopologyError::bind_error(BrokerClosed(queue.to_string())));
        }
        let channel = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(new_queue_channel);
        Ok(CountingConsumer::new(Box::new(QueueConsumer {
            receiver: channel.receiver.clone(),
        })))
    }

    fn partitioned_producer(&self, queue: &str) -> Result<CountingProducer, TopologyError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.shared.lock().unwrap();
        if state.closed {
            return Err(TopologyError::bind_error(BrokerClosed(queue.to_string())));
        }
        // declare the queue so consumers bound later see earlier messages
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(new_queue_channel);
        Ok(CountingProducer::new(Box::new(QueueProducer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
        })))
    }

    fn broadcast_consumer(
        &self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<CountingConsumer, TopologyError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.shared.lock().unwrap();
        if state.closed {
            return Err(TopologyError::bind_error(BrokerClosed(
                exchange.to_string(),
            )));
        }
        let (sender, receiver) = flume::unbounded();
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                key: binding_key.to_string(),
                sender,
            });
        Ok(CountingConsumer::new(Box::new(QueueConsumer { receiver })))
    }

    fn broadcast_producer(&self, exchange: &str) -> Result<CountingProducer, TopologyError> {
        #[allow(clippy::unwrap_used)]
        let state = self.shared.lock().unwrap();
        if state.closed {
            return Err(TopologyError::bind_error(BrokerClosed(
                exchange.to_string(),
            )));
        }
        Ok(CountingProducer::new(Box::new(ExchangeProducer {
            shared: Arc::clone(&self.shared),
            exchange: exchange.to_string(),
        })))
    }
}

fn new_queue_channel() -> QueueChannel {
    let (sender, receiver) = flume::unbounded();
    QueueChannel { sender, receiver }
}

/// Producer looking up its queue at send time, so a closed broker is
/// observed as a transport failure rather than silently buffering
struct QueueProducer {
    shared: Shared,
    queue: String,
}

impl RawProducer for QueueProducer {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let sender = {
            #[allow(clippy::unwrap_used)]
            let state = self.shared.lock().unwrap();
            state.queues.get(&self.queue).map(|q| q.sender.clone())
        };
        let sender = sender
            .ok_or_else(|| TransportError::send_error(BrokerClosed(self.queue.clone())))?;
        sender
            .send(payload)
            .map_err(|_| TransportError::send_error(BrokerClosed(self.queue.clone())))
    }
}

struct QueueConsumer {
    receiver: flume::Receiver<Vec<u8>>,
}

impl RawConsumer for QueueConsumer {
    fn recv(&self) -> Option<Vec<u8>> {
        // Err means all senders dropped, i.e. the broker closed this queue
        self.receiver.recv().ok()
    }
}

/// Fanout producer: every binding on the exchange gets its own copy
struct ExchangeProducer {
    shared: Shared,
    exchange: String,
}

impl RawProducer for ExchangeProducer {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let bindings: Vec<(String, flume::Sender<Vec<u8>>)> = {
            #[allow(clippy::unwrap_used)]
            let state = self.shared.lock().unwrap();
            if state.closed {
                return Err(TransportError::send_error(BrokerClosed(
                    self.exchange.clone(),
                )));
            }
            state
                .exchanges
                .get(&self.exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .map(|b| (b.key.clone(), b.sender.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        // repeat_n clones for every iteration except the last, which saves
        // one clone on the common single-binding case
        let payloads = itertools::repeat_n(payload, bindings.len());
        for ((key, sender), payload) in bindings.iter().zip(payloads) {
            if sender.send(payload).is_err() {
                debug!(exchange = %self.exchange, binding = %key, "skipping dead binding");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::indexed_rows;
    use crate::types::{Envelope, EnvelopeKind};

    /// An envelope on a partitioned queue goes to exactly one of the bound
    /// consumers
    #[test]
    fn partitioned_exclusivity() {
        let topology = InThreadTopology::new();
        let mut producer = topology.partitioned_producer("rows").unwrap();
        let mut first = topology.partitioned_consumer("rows").unwrap();
        let mut second = topology.partitioned_consumer("rows").unwrap();

        for i in 0..10 {
            producer.send(&indexed_rows(i, 1)).unwrap();
        }

        let mut seen: Vec<i32> = Vec::new();
        for _ in 0..4 {
            let envelope = first.recv().unwrap();
            seen.push(envelope.records[0].get_int("index").unwrap());
        }
        for _ in 0..6 {
            let envelope = second.recv().unwrap();
            seen.push(envelope.records[0].get_int("index").unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    /// An envelope on a broadcast exchange is delivered once to every
    /// independently bound consumer
    #[test]
    fn broadcast_fanout() {
        let topology = InThreadTopology::new();
        let mut consumers: Vec<_> = (0..3)
            .map(|i| {
                topology
                    .broadcast_consumer("results", &format!("sink-{i}"))
                    .unwrap()
            })
            .collect();
        let mut producer = topology.broadcast_producer("results").unwrap();

        for i in 0..2 {
            producer.send(&indexed_rows(i, 1)).unwrap();
        }

        for consumer in consumers.iter_mut() {
            let indices: Vec<i32> = (0..2)
                .map(|_| {
                    let envelope = consumer.recv().unwrap();
                    envelope.records[0].get_int("index").unwrap()
                })
                .collect();
            assert_eq!(indices, vec![0, 1]);
        }
    }

    /// Closing the broker makes a blocked consumer observe end of channel
    /// after draining what was already queued
    #[test]
    fn close_drains_then_disconnects() {
        let topology = InThreadTopology::new();
        let mut producer = topology.partitioned_producer("rows").unwrap();
        let mut consumer = topology.partitioned_consumer("rows").unwrap();

        producer.send(&indexed_rows(0, 1)).unwrap();
        topology.close();

        assert!(consumer.recv().is_some());
        assert!(consumer.recv().is_none());
    }

    /// Sending into a closed broker is a transport failure
    #[test]
    fn send_after_close_errors() {
        let topology = InThreadTopology::new();
        let mut queue_producer = topology.partitioned_producer("rows").unwrap();
        let mut fanout_producer = topology.broadcast_producer("results").unwrap();
        topology.close();

        assert!(queue_producer.send(&indexed_rows(0, 1)).is_err());
        assert!(fanout_producer.send(&indexed_rows(0, 1)).is_err());
        assert!(topology.partitioned_consumer("rows").is_err());
    }

    /// A consumer that went away must not fail the whole fanout
    #[test]
    fn broadcast_skips_dropped_consumer() {
        let topology = InThreadTopology::new();
        let gone = topology.broadcast_consumer("results", "gone").unwrap();
        let mut alive = topology.broadcast_consumer("results", "alive").unwrap();
        let mut producer = topology.broadcast_producer("results").unwrap();

        drop(gone);
        producer.send(&indexed_rows(7, 1)).unwrap();

        let envelope = alive.recv().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::DataRows);
        assert_eq!(envelope.records[0].get_int("index"), Ok(7));
    }

    /// Publishing to an exchange nobody bound simply drops the envelope
    #[test]
    fn broadcast_without_bindings_is_ok() {
        let topology = InThreadTopology::new();
        let mut producer = topology.broadcast_producer("results").unwrap();
        assert!(producer.send(&Envelope::data(vec![])).is_ok());
    }
}
