//! Job submission, lifecycle tracking and cluster observation.
//!
//! A [`JobCoordinator`] validates plans, hands them to a [`ClusterScheduler`]
//! and follows them to a terminal state. A [`ResourceMonitor`] reads cluster
//! capacity and application state without changing either. [`LocalCluster`]
//! is a scheduler that runs everything on the current tokio runtime.

pub mod config;
pub mod coordinator;
pub mod job;
pub mod local;
pub mod monitor;
pub mod retry;
pub mod scheduler;

pub use config::{CoordinatorConfig, LocalClusterConfig, RetryPolicy, SchedulerKind};
pub use coordinator::{JobCoordinator, TerminalState};
pub use job::{JobExecution, JobState};
pub use local::LocalCluster;
pub use monitor::{ClusterMetrics, ClusterSnapshot, ResourceMonitor, Utilization};
pub use scheduler::{ClusterScheduler, SharedScheduler};
