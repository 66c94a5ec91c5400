//! rktpod - pod supervisor CLI
//!
//! ## Usage
//!
//! ```sh
//! rktpod run pod/                      # runs pod.json or docker-compose.yml
//! rktpod run docker-compose.yml --consul-ip 127.0.0.1
//! rktpod dump docker-compose.yml       # prints the effective model as JSON
//! ```
//!
//! `run` keeps the pod in the foreground until it exits or SIGINT/SIGTERM
//! arrives, then tears everything down in order. Exit code 0 means the pod
//! terminated cleanly.

use clap::{Args, Parser, Subcommand};
use rktpod::consul::ConsulLifecycleFactory;
use rktpod::descriptor::Descriptors;
use rktpod::image::{FetchUser, Images, PullPolicy};
use rktpod::launcher::{LauncherConfig, LifecycleListener, NilListener, PodLauncher};
use rktpod::loader::Loader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "rktpod", version, about = "Runs docker-compose-like pods on rkt")]
struct Cli {
    /// Enables verbose log output.
    #[arg(long, global = true)]
    verbose: bool,
    /// Numeric uid images are fetched with.
    #[arg(long, global = true, default_value_t = 0)]
    fetch_uid: u32,
    /// Numeric gid images are fetched with.
    #[arg(long, global = true, default_value_t = 0)]
    fetch_gid: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs a pod from a pod.json or docker-compose.yml descriptor.
    Run(RunArgs),
    /// Loads a pod descriptor and prints the effective model as JSON.
    Dump(DumpArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Descriptor file or directory.
    podfile: PathBuf,
    /// File the pod UUID is written to; enables removal of the previous pod.
    #[arg(long)]
    uuid_file: Option<PathBuf>,
    /// Overrides the pod name used for service discovery and as hostname.
    #[arg(long)]
    name: Option<String>,
    /// Network to join; repeatable.
    #[arg(long)]
    net: Vec<String>,
    /// DNS server IP; repeatable.
    #[arg(long)]
    dns: Vec<String>,
    /// Base directory for volumes without an explicit source.
    #[arg(long, default_value = "./volumes")]
    default_volume_dir: String,
    /// IP used to publish ports that do not name one.
    #[arg(long, default_value = "")]
    default_publish_ip: String,
    /// Consul agent IP; setting it enables service discovery.
    #[arg(long)]
    consul_ip: Option<String>,
    /// Consul HTTP API port.
    #[arg(long, default_value_t = 8500)]
    consul_api_port: u16,
    /// Consul datacenter used for the DNS search domains.
    #[arg(long, default_value = "dc1")]
    consul_datacenter: String,
    /// TTL of the aggregated Consul health check.
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    consul_check_ttl: Duration,
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// Descriptor file or directory.
    podfile: PathBuf,
    /// Base directory for volumes without an explicit source.
    #[arg(long, default_value = "./volumes")]
    default_volume_dir: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let fetch_as = FetchUser {
        uid: cli.fetch_uid,
        gid: cli.fetch_gid,
    };
    let result = match cli.command {
        Command::Run(args) => run_pod(args, fetch_as).await,
        Command::Dump(args) => dump_pod(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run_pod(args: RunArgs, fetch_as: FetchUser) -> rktpod::Result<()> {
    let fetch_as = (fetch_as.uid != 0 || fetch_as.gid != 0).then_some(fetch_as);
    let mut descriptors = Descriptors::new(args.default_volume_dir.clone());
    let images = Images::new(PullPolicy::New, fetch_as);

    let mut descriptor = descriptors.descriptor(&args.podfile)?;
    if let Some(name) = &args.name {
        descriptor.name = name.clone();
    }
    let mut loader = Loader::new(&mut descriptors, &images, args.default_volume_dir.clone())?;
    let mut pod = loader.load_pod(&descriptor).await?;
    if !args.net.is_empty() {
        pod.net = args.net.clone();
    }
    if !args.dns.is_empty() {
        pod.dns = args.dns.clone();
    }

    let listener: Arc<dyn LifecycleListener> = match &args.consul_ip {
        Some(consul_ip) => {
            // Service discovery also answers the pod's DNS queries.
            let global_ns = format!("service.{}.consul", args.consul_datacenter);
            let local_ns = format!("{}.{global_ns}", pod.name);
            pod.dns = vec![consul_ip.clone()];
            pod.dns_search = vec![local_ns, global_ns];
            let factory = ConsulLifecycleFactory::new(
                format!("http://{consul_ip}:{}", args.consul_api_port),
                args.consul_check_ttl,
            )
            .await?;
            Arc::new(factory.listener(&pod))
        }
        None => Arc::new(NilListener),
    };

    let launcher = Arc::new(PodLauncher::new(LauncherConfig {
        pod,
        uuid_file: args.uuid_file.clone(),
        default_publish_ip: args.default_publish_ip.clone(),
        listener,
    })?);
    handle_signals(Arc::clone(&launcher));

    let result = match launcher.start().await {
        Ok(()) => launcher.wait().await,
        Err(e) => Err(e),
    };
    launcher.mark_garbage_containers_quiet().await;
    result
}

/// Bridges SIGINT/SIGTERM into a pod stop.
fn handle_signals(launcher: Arc<PodLauncher>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
        let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        if let Err(e) = launcher.stop().await {
            error!("failed to stop: {e}");
        }
    });
}

fn dump_pod(args: DumpArgs) -> rktpod::Result<()> {
    let mut descriptors = Descriptors::new(args.default_volume_dir);
    let mut descriptor = descriptors.descriptor(&args.podfile)?;
    descriptors.resolve_extensions(&mut descriptor)?;
    println!("{}", descriptor.to_json_pretty());
    Ok(())
}
