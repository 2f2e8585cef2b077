//! Shared helpers for the test suite.
use crate::types::{Envelope, Record};

/// A data envelope of `rows` records, each tagged with an `index` field
/// starting at `first`
pub(crate) fn indexed_rows(first: i32, rows: usize) -> Envelope {
    let records = (0..rows)
        .map(|offset| {
            let mut record = Record::default();
            record.set_int("index", first + offset as i32);
            record
        })
        .collect();
    Envelope::data(records)
}

/// Install a test subscriber so tracing output shows up with `--nocapture`.
/// Safe to call from multiple tests, later calls are no-ops.
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeKind;

    #[test]
    fn indexed_rows_are_sequential() {
        let envelope = indexed_rows(5, 3);
        assert_eq!(envelope.kind, EnvelopeKind::DataRows);
        let indices: Vec<i32> = envelope
            .records
            .iter()
            .map(|r| r.get_int("index").unwrap())
            .collect();
        assert_eq!(indices, vec![5, 6, 7]);
    }
}
