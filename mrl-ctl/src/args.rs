use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use mrl_coordinator::SchedulerKind;
use mrl_engine::JobPriority;
use workload::WorkloadKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show node capacity, utilization and queues of the cluster as JSON.
    Status,

    /// List the workloads that can be submitted.
    Workloads,

    /// Submit a job and wait for it to finish.
    Submit(SubmitArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// Objects live in a Minio / S3 bucket.
    Minio,
    /// Input is loaded from the local filesystem into memory. Output is
    /// printed when the job ends.
    Memory,
}

#[derive(ClapArgs, Debug)]
pub struct ClusterArgs {
    #[arg(long, value_enum, default_value_t = StorageKind::Memory)]
    pub storage: StorageKind,

    #[arg(long, value_enum, default_value_t = SchedulerKind::Capacity)]
    pub scheduler: SchedulerKind,

    /// Number of nodes in the local cluster.
    #[arg(long, default_value_t = 2)]
    pub nodes: usize,

    /// Memory of each node in MB.
    #[arg(long, default_value_t = 8192)]
    pub node_memory: u64,

    /// Virtual cores of each node.
    #[arg(long, default_value_t = 8)]
    pub node_vcores: u32,

    /// Map and reduce tasks that may run at the same time.
    #[arg(long, default_value_t = 8)]
    pub task_slots: usize,

    /// Minio access key / user ID.
    #[arg(long, default_value = "robert")]
    pub access_key_id: String,

    /// Minio secret key / password.
    #[arg(long, default_value = "robertisawesome")]
    pub secret_access_key: String,

    /// Minio region.
    #[arg(long, default_value = "us-east-1")]
    pub region: String,

    #[arg(long, default_value = "http://127.0.0.1:9000")]
    pub minio_url: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Priority {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

impl From<Priority> for JobPriority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::VeryLow => JobPriority::VeryLow,
            Priority::Low => JobPriority::Low,
            Priority::Normal => JobPriority::Normal,
            Priority::High => JobPriority::High,
            Priority::VeryHigh => JobPriority::VeryHigh,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct SubmitArgs {
    /// Input directory, or a single file.
    #[arg(short, long)]
    pub input: String,

    #[arg(short, long, value_enum)]
    pub workload: WorkloadKind,

    /// Output directory.
    #[arg(short, long)]
    pub output: String,

    #[arg(short, long)]
    pub name: Option<String>,

    #[arg(short, long, default_value_t = 1)]
    pub partitions: u32,

    /// Number of reduce groups. 0 runs a map-only job.
    #[arg(short, long, default_value_t = 1)]
    pub reduce_groups: u32,

    #[arg(long)]
    pub no_combiner: bool,

    /// Fail on the first malformed record instead of skipping it.
    #[arg(long)]
    pub strict: bool,

    /// Replace the output directory if it exists.
    #[arg(long)]
    pub overwrite: bool,

    /// Reduce groups that may fail before the job does.
    #[arg(long, default_value_t = 0)]
    pub failure_tolerance: u32,

    #[arg(long, default_value = "default")]
    pub queue: String,

    #[arg(long, value_enum, default_value_t = Priority::Normal)]
    pub priority: Priority,

    /// Memory in MB for the job's container.
    #[arg(long, default_value_t = 1024)]
    pub memory: u64,

    #[arg(long, default_value_t = 1)]
    pub vcores: u32,

    /// Seconds to wait for the job. 0 returns right after submission.
    #[arg(short, long, default_value_t = 600)]
    pub timeout: u64,

    /// Kill the job if the wait times out.
    #[arg(long)]
    pub kill_on_timeout: bool,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Vec<String>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
