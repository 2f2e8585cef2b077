//! Distributed termination detection.
//!
//! When an upstream stage finishes it injects a termination token into its
//! downstream partitioned queue. The token carries three counters and
//! circulates among the downstream instances until the stage has accounted
//! for every row upstream declared:
//!
//! * `prevSent`: total rows upstream claims to have sent,
//! * `localReceived`: rows already folded in by instances of this stage
//!   which handled the token before,
//! * `localSent`: rows those instances forwarded downstream.
//!
//! Each pickup folds the handling instance's own tallies into the token and
//! either requeues it (not every row accounted for yet) or, on convergence,
//! broadcasts a fresh token downstream exactly once. No instance identity,
//! sequence numbers or central coordinator are involved; correctness rests
//! only on the broker delivering each requeued token to exactly one live
//! consumer and on the tallies growing monotonically.
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channels::{CountingConsumer, CountingProducer};
use crate::topology::TransportError;
use crate::types::{Envelope, EnvelopeKind, FieldError, Record};

/// Token field name: total rows upstream declared it sent
pub const PREV_SENT: &str = "prevSent";
/// Token field name: rows already folded in by earlier pickups on this stage
pub const LOCAL_RECEIVED: &str = "localReceived";
/// Token field name: rows earlier pickups on this stage forwarded downstream
pub const LOCAL_SENT: &str = "localSent";

/// Outcome of handling a termination token. Requeueing is a deliberate
/// success path of the protocol, never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every row upstream declared is accounted for; termination was
    /// broadcast downstream. The handling instance is done.
    Converged,
    /// Not every row is accounted for yet; the token went back onto the
    /// input queue for a sibling instance to pick up.
    Requeued,
}

/// Error while handling a termination token.
///
/// Only [CompletionError::Transport] is fatal. The other variants are
/// protocol violations: the caller logs them and keeps running, treating the
/// token as a transient anomaly.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The envelope handed to the detector is not a termination token
    #[error("envelope of kind {0:?} is not a termination token")]
    NotTermination(EnvelopeKind),
    /// The token envelope carries no record
    #[error("termination token carries no record")]
    MissingRecord,
    /// A counter field is absent or malformed
    #[error("termination token counter: {0}")]
    Counter(#[from] FieldError),
    /// The requeue or broadcast send failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Build a termination token envelope with the given counters.
///
/// A stage that finishes producing injects `termination_token(total, 0, 0)`
/// into its downstream queue.
pub fn termination_token(prev_sent: i64, local_received: i64, local_sent: i64) -> Envelope {
    let mut record = Record::default();
    record.set_int(PREV_SENT, wire_counter(prev_sent));
    record.set_int(LOCAL_RECEIVED, wire_counter(local_received));
    record.set_int(LOCAL_SENT, wire_counter(local_sent));
    Envelope::termination(record)
}

/// Narrow an accumulated counter to its wire width. Values outside the
/// supported row volume clamp instead of wrapping, so the wire never
/// carries a negative counter.
fn wire_counter(value: i64) -> i32 {
    i32::try_from(value).unwrap_or_else(|_| {
        warn!(value, "counter exceeds wire range, clamping");
        if value < 0 {
            i32::MIN
        } else {
            i32::MAX
        }
    })
}

/// Handle a termination token received on a stage instance's input.
///
/// Folds the instance's own received/sent tallies into the token and decides:
/// converged (upstream's declared total is fully accounted for) broadcasts a
/// fresh token to every downstream consumer bound to `outputs`; otherwise the
/// accumulated token is requeued onto the same input topology via `requeue`.
/// The instance's input and output tallies are cleared in both cases, so a
/// second pickup by the same instance contributes nothing twice.
///
/// The sent count is read from the first output: all outputs of one stage
/// must be written in lockstep with identical payloads, which makes every
/// branch carry the same count. The caller maintains that invariant.
pub fn handle_termination(
    token: &Envelope,
    input: &mut CountingConsumer,
    requeue: &mut CountingProducer,
    outputs: &mut [CountingProducer],
) -> Result<Completion, CompletionError> {
    if token.kind != EnvelopeKind::TerminationToken {
        return Err(CompletionError::NotTermination(token.kind));
    }
    let record = token.first_record().ok_or(CompletionError::MissingRecord)?;
    let prev_sent = i64::from(record.get_int(PREV_SENT)?);
    let local_received = i64::from(record.get_int(LOCAL_RECEIVED)?);
    let local_sent = i64::from(record.get_int(LOCAL_SENT)?);

    let sent = outputs.first().map(|o| o.sent_count()).unwrap_or(0) as i64;
    debug_assert!(
        outputs.iter().all(|o| o.sent_count() as i64 == sent),
        "outputs of one stage must carry identical payloads"
    );
    let received = input.received_count() as i64;

    let outcome = if received + local_received >= prev_sent {
        info!(
            accumulated = received + local_received,
            prev_sent,
            declaring = local_sent + sent,
            "stage drained upstream's declared rows, broadcasting termination"
        );
        let next = termination_token(local_sent + sent, 0, 0);
        for output in outputs.iter_mut() {
            output.send(&next)?;
        }
        Completion::Converged
    } else {
        debug!(
            accumulated = received + local_received,
            prev_sent, "rows still unaccounted for, requeueing token"
        );
        let next = termination_token(prev_sent, local_received + received, local_sent + sent);
        requeue.send(&next)?;
        Completion::Requeued
    };
    input.clear();
    for output in outputs.iter_mut() {
        output.clear();
    }
    Ok(outcome)
}
