//! Contrail is a horizontally scaled pipeline for processing flight itinerary data.
//! Stages consume from and produce to a shared message broker and are replicated into
//! any number of identical worker instances. The crate's core is the termination
//! detection protocol which propagates an end-of-stream signal exactly once to every
//! downstream consumer without any central coordinator.
pub mod aggregate;
pub mod channels;
pub mod completion;
pub mod config;
pub mod heartbeat;
pub mod runtime;
pub mod topology;
pub mod transforms;
pub mod types;
pub mod wire;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
