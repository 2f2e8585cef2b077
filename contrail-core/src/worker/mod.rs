//! The generic consume, transform, produce loop every pipeline stage runs.
//!
//! A stage worker is one instance of a horizontally replicated stage. It is
//! parameterized by an externally supplied transform and is agnostic to the
//! delivery pattern backing its endpoints; all coordination happens through
//! the envelopes themselves.
use thiserror::Error;
use tracing::{info, span, warn, Level};

use crate::channels::{CountingConsumer, CountingProducer};
use crate::completion::{handle_termination, Completion, CompletionError};
use crate::topology::{TopologyError, TransportError};
use crate::types::{Envelope, EnvelopeKind, FieldError, Record};

/// Error terminating a stage worker instance.
///
/// Per-record errors never surface here: a malformed record is dropped and
/// logged, processing continues. Only transport failures abort the loop;
/// process supervision is responsible for restarting the instance.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Broker send/receive failed outside a normal close
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The instance's endpoints could not be bound at startup
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// An instance thread panicked
    #[error("stage instance panicked")]
    InstancePanic,
}

/// One worker instance of a pipeline stage.
///
/// Owns its counting endpoints exclusively: the input consumer, a requeue
/// producer bound to the same partitioned input queue (for recirculating
/// termination tokens), and the downstream outputs. All outputs are written
/// in lockstep with identical payloads, the invariant the
/// [completion detector](crate::completion) relies on.
pub struct StageWorker<F> {
    stage: String,
    instance: usize,
    input: CountingConsumer,
    requeue: CountingProducer,
    outputs: Vec<CountingProducer>,
    transform: F,
}

impl<F> StageWorker<F>
where
    F: FnMut(&Record) -> Result<Option<Record>, FieldError>,
{
    /// Create a worker instance.
    ///
    /// The transform is applied to every record of every data envelope:
    /// `Ok(Some(row))` forwards the row, `Ok(None)` filters it out and
    /// `Err(_)` drops the record as malformed without aborting the stage.
    pub fn new(
        stage: impl Into<String>,
        instance: usize,
        input: CountingConsumer,
        requeue: CountingProducer,
        outputs: Vec<CountingProducer>,
        transform: F,
    ) -> Self {
        Self {
            stage: stage.into(),
            instance,
            input,
            requeue,
            outputs,
            transform,
        }
    }

    /// Run the stage loop until done.
    ///
    /// Returns `Ok(())` when the stage converged or the input channel closed
    /// (both clean exits) and `Err(_)` on an unrecoverable transport failure.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let span = span!(
            Level::INFO,
            "stage_worker",
            stage = %self.stage,
            instance = self.instance
        );
        let _guard = span.enter();
        info!("instance started");
        loop {
            let Some(envelope) = self.input.recv() else {
                info!("input channel closed, shutting down");
                return Ok(());
            };
            match envelope.kind {
                EnvelopeKind::DataRows => self.forward_rows(&envelope)?,
                EnvelopeKind::TerminationToken => {
                    match handle_termination(
                        &envelope,
                        &mut self.input,
                        &mut self.requeue,
                        &mut self.outputs,
                    ) {
                        Ok(Completion::Converged) => {
                            info!("stage converged, instance done");
                            return Ok(());
                        }
                        Ok(Completion::Requeued) => {}
                        Err(CompletionError::Transport(error)) => return Err(error.into()),
                        Err(error) => {
                            warn!(%error, "ignoring malformed termination token");
                        }
                    }
                }
                other => warn!(kind = ?other, "dropping envelope of unexpected kind"),
            }
        }
    }

    /// Transform the rows of one data envelope and forward the survivors to
    /// every output. The envelope is forwarded even when every row was
    /// filtered or dropped, so downstream sees the same stream shape.
    fn forward_rows(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let rows: Vec<Record> = envelope
            .records
            .iter()
            .filter_map(|record| match (self.transform)(record) {
                Ok(kept) => kept,
                Err(error) => {
                    warn!(%error, "dropping malformed record");
                    None
                }
            })
            .collect();
        let outgoing = Envelope::data(rows);
        for output in self.outputs.iter_mut() {
            output.send(&outgoing)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{termination_token, PREV_SENT};
    use crate::testing::{indexed_rows, setup_tracing};
    use crate::topology::{InThreadTopology, Topology};

    fn spawn_worker<F>(
        topology: &InThreadTopology,
        transform: F,
    ) -> std::thread::JoinHandle<Result<(), WorkerError>>
    where
        F: FnMut(&Record) -> Result<Option<Record>, FieldError> + Send + 'static,
    {
        let worker = StageWorker::new(
            "test-stage",
            0,
            topology.partitioned_consumer("in").unwrap(),
            topology.partitioned_producer("in").unwrap(),
            vec![topology.broadcast_producer("out").unwrap()],
            transform,
        );
        std::thread::spawn(move || worker.run())
    }

    /// One well-formed and one field-missing record in the same envelope:
    /// exactly one transformed record is forwarded, the worker keeps going
    #[test]
    fn drops_malformed_record_and_continues() {
        setup_tracing();
        let topology = InThreadTopology::new();
        let mut feed = topology.partitioned_producer("in").unwrap();
        let mut downstream = topology.broadcast_consumer("out", "sink").unwrap();

        let handle = spawn_worker(&topology, |record: &Record| {
            let fare = record.get_float("totalFare")?;
            let mut out = record.clone();
            out.set_float("totalFare", fare * 2.0);
            Ok(Some(out))
        });

        let mut good = Record::default();
        good.set_float("totalFare", 100.0);
        let bad = Record::default();
        feed.send(&Envelope::data(vec![good, bad])).unwrap();
        feed.send(&termination_token(2, 0, 0)).unwrap();

        let envelope = downstream.recv().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::DataRows);
        assert_eq!(envelope.records.len(), 1);
        assert_eq!(envelope.records[0].get_float("totalFare"), Ok(200.0));

        // both rows count as received, so the token converges here
        let token = downstream.recv().unwrap();
        assert_eq!(token.kind, EnvelopeKind::TerminationToken);
        assert_eq!(token.first_record().unwrap().get_int(PREV_SENT), Ok(1));
        assert!(handle.join().unwrap().is_ok());
    }

    /// Rows the transform filters out are not forwarded but still count as
    /// received; the emptied envelope itself still travels downstream
    #[test]
    fn filtered_rows_are_not_forwarded() {
        let topology = InThreadTopology::new();
        let mut feed = topology.partitioned_producer("in").unwrap();
        let mut downstream = topology.broadcast_consumer("out", "sink").unwrap();

        let handle = spawn_worker(&topology, |_record: &Record| Ok(None));

        feed.send(&indexed_rows(0, 5)).unwrap();
        feed.send(&termination_token(5, 0, 0)).unwrap();

        let emptied = downstream.recv().unwrap();
        assert_eq!(emptied.kind, EnvelopeKind::DataRows);
        assert!(emptied.records.is_empty());

        let token = downstream.recv().unwrap();
        assert_eq!(token.kind, EnvelopeKind::TerminationToken);
        assert_eq!(token.first_record().unwrap().get_int(PREV_SENT), Ok(0));
        assert!(handle.join().unwrap().is_ok());
    }

    /// A data envelope with no records crosses the stage unchanged, keeping
    /// the stream shape intact for downstream consumers
    #[test]
    fn empty_envelope_is_forwarded() {
        let topology = InThreadTopology::new();
        let mut feed = topology.partitioned_producer("in").unwrap();
        let mut downstream = topology.broadcast_consumer("out", "sink").unwrap();
        let handle = spawn_worker(&topology, |record: &Record| Ok(Some(record.clone())));

        feed.send(&Envelope::data(vec![])).unwrap();
        feed.send(&termination_token(0, 0, 0)).unwrap();

        let envelope = downstream.recv().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::DataRows);
        assert!(envelope.records.is_empty());

        let token = downstream.recv().unwrap();
        assert_eq!(token.kind, EnvelopeKind::TerminationToken);
        assert!(handle.join().unwrap().is_ok());
    }

    /// A closed input channel is a clean shutdown, not an error, and emits
    /// nothing downstream
    #[test]
    fn closed_input_is_clean_done() {
        let topology = InThreadTopology::new();
        let mut downstream = topology.broadcast_consumer("out", "sink").unwrap();
        let handle = spawn_worker(&topology, |record: &Record| Ok(Some(record.clone())));

        topology.close();
        assert!(handle.join().unwrap().is_ok());
        assert!(downstream.recv().is_none());
    }

    /// A malformed token is logged and skipped, a well-formed one afterwards
    /// still converges the stage
    #[test]
    fn malformed_token_does_not_advance_state() {
        let topology = InThreadTopology::new();
        let mut feed = topology.partitioned_producer("in").unwrap();
        let mut downstream = topology.broadcast_consumer("out", "sink").unwrap();
        let handle = spawn_worker(&topology, |record: &Record| Ok(Some(record.clone())));

        feed.send(&Envelope::termination(Record::default())).unwrap();
        feed.send(&termination_token(0, 0, 0)).unwrap();

        let token = downstream.recv().unwrap();
        assert_eq!(token.kind, EnvelopeKind::TerminationToken);
        assert!(handle.join().unwrap().is_ok());
    }

    /// A transport failure aborts the instance with an error
    #[test]
    fn transport_failure_aborts() {
        let topology = InThreadTopology::new();
        let mut feed = topology.partitioned_producer("in").unwrap();
        // no downstream binding needed, the queue itself disappears on close

        let worker = StageWorker::new(
            "test-stage",
            0,
            topology.partitioned_consumer("in").unwrap(),
            topology.partitioned_producer("in").unwrap(),
            vec![topology.partitioned_producer("out").unwrap()],
            |record: &Record| Ok(Some(record.clone())),
        );

        feed.send(&indexed_rows(0, 1)).unwrap();
        topology.close();

        // the buffered envelope is still delivered, forwarding it then fails
        let result = worker.run();
        assert!(matches!(result, Err(WorkerError::Transport(_))));
    }
}
