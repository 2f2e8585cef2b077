//! Fan-in barrier aggregation, e.g. the final price average.
//!
//! Unlike a regular stage, a fan-in stage does not recirculate termination
//! tokens. It knows how many upstream partial-aggregator instances exist and
//! simply waits for one token from each, combining the partial results they
//! carry before broadcasting a single final envelope downstream.
use thiserror::Error;
use tracing::{debug, error, info, span, warn, Level};

use crate::channels::{CountingConsumer, CountingProducer};
use crate::topology::TransportError;
use crate::types::{Envelope, EnvelopeKind, Record};

/// Error terminating a barrier aggregator
#[derive(Debug, Error)]
pub enum BarrierError {
    /// Broadcasting the final result failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Waits for a fixed count of termination tokens, sums the partial results
/// they carry and broadcasts one combined average.
pub struct BarrierAggregator {
    input: CountingConsumer,
    outputs: Vec<CountingProducer>,
    /// Count of upstream partial-aggregator instances, i.e. tokens to await
    expected: usize,
    sum_field: String,
    count_field: String,
    result_field: String,
}

impl BarrierAggregator {
    /// Create an aggregator awaiting `expected` tokens.
    ///
    /// Each token's record must carry a float `sum_field` and an integer
    /// `count_field`; the combined average is emitted under `result_field`.
    pub fn new(
        input: CountingConsumer,
        outputs: Vec<CountingProducer>,
        expected: usize,
        sum_field: impl Into<String>,
        count_field: impl Into<String>,
        result_field: impl Into<String>,
    ) -> Self {
        Self {
            input,
            outputs,
            expected,
            sum_field: sum_field.into(),
            count_field: count_field.into(),
            result_field: result_field.into(),
        }
    }

    /// Run until all expected tokens arrived and the result was broadcast.
    ///
    /// Tokens of an unexpected kind or with missing fields are logged and do
    /// not count toward the barrier. If the input closes early the
    /// aggregator exits cleanly without emitting anything.
    pub fn run(mut self) -> Result<(), BarrierError> {
        let span = span!(Level::INFO, "barrier_aggregator", expected = self.expected);
        let _guard = span.enter();
        let mut sum = 0f32;
        let mut count: i64 = 0;
        let mut collected = 0usize;
        while collected < self.expected {
            let Some(envelope) = self.input.recv() else {
                error!(
                    collected,
                    "input closed before all partial results arrived, exiting without a result"
                );
                return Ok(());
            };
            if envelope.kind != EnvelopeKind::TerminationToken {
                warn!(kind = ?envelope.kind, "skipping envelope of unexpected kind");
                continue;
            }
            let Some(record) = envelope.first_record() else {
                warn!("skipping token without a record");
                continue;
            };
            let (partial_sum, partial_count) = match self.partials(record) {
                Ok(partials) => partials,
                Err(error) => {
                    warn!(%error, "skipping token with unreadable partial result");
                    continue;
                }
            };
            sum += partial_sum;
            count += i64::from(partial_count);
            collected += 1;
            debug!(
                collected,
                partial_sum, partial_count, "folded partial result"
            );
        }

        // a zero denominator yields zero, never an error
        let average = if count == 0 {
            warn!("combined row count is zero");
            0.0
        } else {
            sum / count as f32
        };
        info!(average, rows = count, "broadcasting final aggregate");
        let mut record = Record::default();
        record.set_float(self.result_field.as_str(), average);
        let envelope = Envelope::final_aggregate(record);
        for output in self.outputs.iter_mut() {
            output.send(&envelope)?;
        }
        Ok(())
    }

    fn partials(&self, record: &Record) -> Result<(f32, i32), crate::types::FieldError> {
        let sum = record.get_float(&self.sum_field)?;
        let count = record.get_int(&self.count_field)?;
        Ok((sum, count))
    }
}
