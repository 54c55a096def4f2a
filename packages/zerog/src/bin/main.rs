// Entry points for the zerog server and its worker children.
//
// `zerog serve` supervises one worker; `zerog worker` is what the server
// re-execs as the child process. Embedding services use the library
// directly and register their own job types; this binary wires the broker
// and an in-process datastore for development deployments.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use zerog::mgmt::WORKER_TYPE;
use zerog::queue::BeanstalkQueue;
use zerog::server::ProcessSpawner;
use zerog::{
    Config, MemoryDatastore, MgmtChannel, Server, Worker, WorkerId, JobRegistry,
    UPDATES_CHANNEL_NAME,
};

#[derive(Parser)]
#[command(name = "zerog", about = "Supervised background job processing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervising server.
    Serve,
    /// Run one worker process. Spawned by `serve`; not for direct use.
    Worker(WorkerArgs),
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    service: String,
    #[arg(long, default_value = "localhost")]
    broker_host: String,
    #[arg(long, default_value_t = 11300)]
    broker_port: u16,
}

fn init_tracing(to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,zerog=debug".into());
    let fmt = if to_stderr {
        // the worker's stdout carries pipe frames; logs must stay off it
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(fmt).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Serve => serve().await,
        Commands::Worker(args) => worker(args).await,
    }
}

async fn serve() -> Result<()> {
    init_tracing(false);

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(service = %config.service_name, "starting zerog server");

    let registry = Arc::new(JobRegistry::new());
    let datastore = Arc::new(MemoryDatastore::new());
    let job_queue = Arc::new(
        BeanstalkQueue::connect(&config.broker_host, config.broker_port, &config.jobs_tube())
            .await
            .context("failed to reach the work queue broker")?,
    );

    let worker_id = WorkerId::new(
        WORKER_TYPE,
        &config.host,
        &config.service_name,
        std::process::id(),
    );
    let updates_channel = MgmtChannel::new(Arc::new(
        BeanstalkQueue::connect(&config.broker_host, config.broker_port, UPDATES_CHANNEL_NAME)
            .await
            .context("failed to open the updates channel")?,
    ));
    let ctrl_channel = MgmtChannel::new(Arc::new(
        BeanstalkQueue::connect(
            &config.broker_host,
            config.broker_port,
            &worker_id.to_string(),
        )
        .await
        .context("failed to open the control channel")?,
    ));

    let spawner = ProcessSpawner::new(config);
    let mut server = Server::new(
        worker_id,
        registry,
        datastore,
        job_queue,
        updates_channel,
        ctrl_channel,
        Box::new(spawner),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    server.run(shutdown).await
}

async fn worker(args: WorkerArgs) -> Result<()> {
    init_tracing(true);

    // handles are opened here, in the child process, never inherited
    let registry = Arc::new(JobRegistry::new());
    let datastore = Arc::new(MemoryDatastore::new());
    let jobs_tube = format!("{}_jobs", args.service);
    let queue = Arc::new(
        BeanstalkQueue::connect(&args.broker_host, args.broker_port, &jobs_tube)
            .await
            .context("failed to reach the work queue broker")?,
    );

    let parent_pid = unsafe { libc::getppid() } as u32;
    let mut worker = Worker::new(&args.service, registry, datastore, queue, parent_pid);
    worker.run(&mut zerog::pipe::StdioPipe::new()).await
}
