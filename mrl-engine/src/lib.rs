//! The data path of a job: partition the input, map, combine, shuffle and reduce.
//!
//! [`Executor::execute`] runs a [`JobPlan`] end to end against a storage
//! backend. Scheduling, queues and job lifecycle live in `mrl-coordinator`.

pub mod combine;
pub mod executor;
pub mod map;
pub mod partition;
pub mod plan;
pub mod reduce;
pub mod shuffle;

pub use executor::{ExecutionOutcome, ExecutionReport, Executor, Progress};
pub use plan::{JobPlan, JobPlanBuilder, JobPriority};
pub use reduce::ReduceGroupState;
