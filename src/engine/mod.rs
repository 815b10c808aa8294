pub mod executor;
pub mod scheduler;

pub use executor::Executor;
pub use scheduler::{ParallelScheduler, PipelineScheduler, Scheduler, TopologicalScheduler};
