//! Spawning and joining replicated stage instances.
//!
//! Every stage of a pipeline runs as a pool of identical instances, one OS
//! thread each. Instances share no mutable state; each one builds its own
//! endpoints from the topology inside its thread.
use std::sync::Arc;
use std::thread::JoinHandle;

use bon::Builder;
use tracing::{error, info};

use crate::worker::WorkerError;

/// Runs the instances of one pipeline stage on dedicated threads
///
/// # Example
/// ```rust
/// use contrail::completion::termination_token;
/// use contrail::runtime::StagePool;
/// use contrail::topology::{InThreadTopology, Topology};
/// use contrail::worker::StageWorker;
///
/// let topology = InThreadTopology::new();
/// let mut feed = topology.partitioned_producer("rows").unwrap();
/// // nothing to process, upstream declares zero rows
/// feed.send(&termination_token(0, 0, 0)).unwrap();
///
/// let handle = {
///     let topology = topology.clone();
///     StagePool::builder()
///         .stage("double-fare")
///         .parallelism(1)
///         .build(move |instance| {
///             let worker = StageWorker::new(
///                 "double-fare",
///                 instance,
///                 topology.partitioned_consumer("rows")?,
///                 topology.partitioned_producer("rows")?,
///                 vec![topology.broadcast_producer("out")?],
///                 |record| Ok(Some(record.clone())),
///             );
///             worker.run()
///         })
///         .spawn()
/// };
/// handle.join().unwrap();
/// ```
#[derive(Builder)]
pub struct StagePool<F> {
    /// Builds and runs one instance; called once per instance on its own
    /// thread with the instance index
    #[builder(finish_fn)]
    run: F,
    /// Stage name used for logging and thread names
    #[builder(into)]
    stage: String,
    /// How many identical instances to run
    parallelism: usize,
}

impl<F> StagePool<F>
where
    F: Fn(usize) -> Result<(), WorkerError> + Send + Sync + 'static,
{
    /// Start all instances. Returns immediately with a handle to join them.
    pub fn spawn(self) -> StagePoolHandle {
        info!(stage = %self.stage, parallelism = self.parallelism, "starting stage pool");
        let run = Arc::new(self.run);
        let handles = (0..self.parallelism)
            .map(|instance| {
                let run = Arc::clone(&run);
                std::thread::spawn(move || run(instance))
            })
            .collect();
        StagePoolHandle {
            stage: self.stage,
            handles,
        }
    }
}

/// Handle to the running instances of one stage
pub struct StagePoolHandle {
    stage: String,
    handles: Vec<JoinHandle<Result<(), WorkerError>>>,
}

impl StagePoolHandle {
    /// Wait for every instance to finish.
    ///
    /// Returns the first instance failure, if any. An instance that
    /// panicked is reported as [WorkerError::InstancePanic].
    pub fn join(self) -> Result<(), WorkerError> {
        let mut first_failure = None;
        for (instance, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(stage = %self.stage, instance, error = %e, "instance failed");
                    first_failure.get_or_insert(e);
                }
                Err(_) => {
                    error!(stage = %self.stage, instance, "instance panicked");
                    first_failure.get_or_insert(WorkerError::InstancePanic);
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
