mod args;
use args::{parse_args, Commands, StorageKind};

mod core;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = parse_args();

    match args.command {
        Commands::Workloads => core::workloads(),
        Commands::Status => core::Session::new(&args.cluster).status().await?,
        Commands::Submit(submit) => {
            let memory_input = args.cluster.storage == StorageKind::Memory;
            core::Session::new(&args.cluster)
                .submit(submit, memory_input)
                .await?
        }
    }

    Ok(())
}
