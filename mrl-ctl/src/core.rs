use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::minio::{Client, ClientConfig};
use common::storage::{join, CreateOptions, MemoryStorage, SharedStorage, Storage};
use common::Resource;
use mrl_coordinator::config::NodeConfig;
use mrl_coordinator::{
    CoordinatorConfig, JobCoordinator, LocalCluster, LocalClusterConfig, ResourceMonitor,
    TerminalState,
};
use mrl_engine::JobPlan;
use workload::WorkloadKind;

use crate::args::{ClusterArgs, StorageKind, SubmitArgs};

pub struct Session {
    storage: SharedStorage,
    coordinator: JobCoordinator,
    monitor: ResourceMonitor,
}

impl Session {
    pub fn new(args: &ClusterArgs) -> Self {
        let storage: SharedStorage = match args.storage {
            StorageKind::Minio => Arc::new(Client::from_conf(ClientConfig {
                access_key_id: args.access_key_id.clone(),
                secret_access_key: args.secret_access_key.clone(),
                region: args.region.clone(),
                url: args.minio_url.clone(),
            })),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        };

        let capability = Resource::new(args.node_memory, args.node_vcores);
        let cluster_config = LocalClusterConfig {
            scheduler: args.scheduler,
            nodes: (1..=args.nodes)
                .map(|i| NodeConfig::running(format!("node-{i}:8041"), capability))
                .collect(),
            task_slots: args.task_slots,
            ..Default::default()
        };
        let config = CoordinatorConfig {
            max_allocation: cluster_config.max_allocation,
            ..Default::default()
        };

        let scheduler = Arc::new(LocalCluster::new(cluster_config, storage.clone()));
        Self {
            coordinator: JobCoordinator::new(scheduler.clone(), storage.clone(), config.clone()),
            monitor: ResourceMonitor::new(scheduler, config),
            storage,
        }
    }

    pub async fn status(&self) -> Result<()> {
        let snapshot = self.monitor.cluster_snapshot().await?;
        let utilization = ResourceMonitor::utilization(&snapshot);
        let status = json!({
            "utilization": utilization.to_string(),
            "snapshot": snapshot,
            "metrics": self.monitor.cluster_metrics().await?,
            "queues": self.monitor.queues().await?,
            "applications": self.monitor.applications(&[]).await?,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }

    pub async fn submit(&self, args: SubmitArgs, memory_input: bool) -> Result<()> {
        if memory_input {
            let loaded = load_local(&self.storage, &args.input).await?;
            info!("Loaded {loaded} input files from `{}`", args.input);
        }

        let mut builder = JobPlan::builder(args.workload, &args.input, &args.output)
            .aux(args.args)
            .partitions(args.partitions)
            .reduce_groups(args.reduce_groups)
            .combiner(!args.no_combiner)
            .strict(args.strict)
            .overwrite_output(args.overwrite)
            .failure_tolerance(args.failure_tolerance)
            .queue(args.queue)
            .priority(args.priority.into())
            .resources(Resource::new(args.memory, args.vcores));
        if let Some(name) = args.name {
            builder = builder.name(name);
        }
        let execution = self.coordinator.submit(builder.build()).await?;
        println!("Submitted {} as {}", execution.id, execution.application);

        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.cancel();
            }
        });

        let state = self
            .coordinator
            .await_completion(
                &execution,
                self.coordinator.config().poll_interval,
                Duration::from_secs(args.timeout),
                &cancel,
            )
            .await?;
        if matches!(state, TerminalState::TimedOut | TerminalState::Cancelled) {
            if args.kill_on_timeout || state == TerminalState::Cancelled {
                warn!("Stopped waiting for {} ({state}), killing it", execution.id);
                self.coordinator.kill(&execution).await?;
            } else {
                warn!("Stopped waiting for {} ({state})", execution.id);
            }
        }

        let execution = self.coordinator.execution(execution.id)?;
        println!("{execution}");

        if memory_input && state == TerminalState::Finished {
            self.print_output(&args.output).await?;
        }
        if state != TerminalState::Finished {
            bail!("{} ended {state}", execution.id);
        }
        Ok(())
    }

    async fn print_output(&self, output: &str) -> Result<()> {
        for entry in self.storage.list(output).await? {
            let name = entry.path.rsplit('/').next().unwrap_or_default();
            if entry.is_dir || name.starts_with('_') {
                continue;
            }
            let data = self.storage.open(&entry.path).await?;
            println!("==> {} <==", entry.path);
            print!("{}", String::from_utf8_lossy(&data));
        }
        Ok(())
    }
}

pub fn workloads() {
    for kind in WorkloadKind::ALL {
        let workload = kind.workload();
        println!(
            "{:<16} combiner: {}",
            kind.to_string(),
            if workload.combine_fn.is_some() { "yes" } else { "no" }
        );
    }
}

/// Copy a local file, or the files directly inside a local directory, into
/// `storage` under the same path.
async fn load_local(storage: &SharedStorage, path: &str) -> Result<usize> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading `{path}`"))?;
    if meta.is_file() {
        copy_file(storage, Path::new(path), path).await?;
        return Ok(1);
    }

    let mut dir = tokio::fs::read_dir(path).await?;
    let mut loaded = 0;
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        copy_file(storage, &entry.path(), &join(path, &name)).await?;
        loaded += 1;
    }
    Ok(loaded)
}

async fn copy_file(storage: &SharedStorage, from: &Path, to: &str) -> Result<()> {
    let data = tokio::fs::read(from).await?;
    storage
        .create(to, CreateOptions::overwrite(), Bytes::from(data))
        .await
}
