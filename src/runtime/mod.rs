/// Runtime: DAG execution and everything that keeps a run moving
///
/// - `engine`: walks the operator schedule, suspending at human jobs
/// - `executor`: automatic operators over run tables
/// - `lifecycle`: run creation, job completion, continuation and abort
/// - `pipeline`: streaming partial labels downstream in pipelined runs
/// - `monitor`: periodic abandonment of timed-out assignments
/// - `supervisor`: cancellable per-job background loops

pub mod engine;
pub mod executor;
pub mod lifecycle;
pub mod monitor;
pub mod pipeline;
pub mod supervisor;

pub use engine::{ExecutionEngine, Walk};
pub use executor::{OperatorExecutor, RunScope};
pub use lifecycle::RunController;
pub use monitor::AbandonmentMonitor;
pub use pipeline::StreamTick;
pub use supervisor::{JobSupervisor, LoopControl};
