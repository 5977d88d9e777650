mod broadcaster;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use broadcaster::Broadcaster;
use config::Config;
use kubepulse_hub::TopicHub;
use kubepulse_k8s::{ClusterFetcher, GpuProbe, KubeClient};
use kubepulse_logs::{KubeLogSource, LogMultiplexer, Reconciler};

/// Kubepulse - live Kubernetes pod, deployment, metrics and log updates for dashboards
#[derive(Parser, Debug)]
#[command(name = "kubepulse")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.kubepulse/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address viewers connect to
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Kubeconfig file to use instead of the default locations
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes context name (defaults to the current context)
    #[arg(long)]
    context: Option<String>,

    /// Namespace to watch
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector for pods and deployments ("" watches everything)
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Container to follow in multi-container pods
    #[arg(long)]
    container: Option<String>,

    /// Number of historical log lines to send when a log stream opens
    #[arg(long)]
    tail_lines: Option<i64>,

    /// Do not query nvidia-smi for GPU telemetry
    #[arg(long)]
    no_gpu: bool,

    /// Log filter such as "debug" or "kubepulse_logs=trace" (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

impl Args {
    /// Flags win over values from the config file
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(path) = &self.kubeconfig {
            config.kubeconfig = Some(path.clone());
        }
        if let Some(context) = &self.context {
            config.context = Some(context.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(selector) = &self.selector {
            config.label_selector = selector.clone();
        }
        if let Some(container) = &self.container {
            config.log_container = Some(container.clone());
        }
        if let Some(tail_lines) = self.tail_lines {
            config.tail_lines = tail_lines;
        }
        if self.no_gpu {
            config.gpu.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.log_level.as_deref())?;

    let result = run(args).await;

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }

    result
}

fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).context(format!("Invalid log filter '{filter}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Connect to the cluster
    let kube_client = match &config.kubeconfig {
        Some(path) => KubeClient::from_path(path)?,
        None => KubeClient::new(),
    };
    let client = kube_client.connect(config.context.as_deref()).await?;
    let context = config
        .context
        .as_deref()
        .or(kube_client.current_context())
        .unwrap_or("in-cluster");
    tracing::info!(context, namespace = %config.namespace, "using Kubernetes context");

    // Broadcasts retry on every tick, so an unreachable cluster is not fatal here
    if let Err(e) = kube_client.validate_client(&client).await {
        tracing::warn!(error = %format!("{e:#}"), "cluster is not reachable yet");
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .context(format!("Failed to bind {}", config.listen))?;

    let cancel = CancellationToken::new();
    let hub = Arc::new(TopicHub::new());

    let gpu = if config.gpu.enabled {
        GpuProbe::new(config.gpu.command.clone()).with_timeout(config.gpu_timeout())
    } else {
        GpuProbe::disabled()
    };
    tracing::debug!(enabled = gpu.is_enabled(), "gpu telemetry");
    let fetcher = ClusterFetcher::new(
        client.clone(),
        config.namespace.clone(),
        config.label_selector(),
        gpu,
    );
    let mut tasks = Broadcaster::new(Arc::new(fetcher), Arc::clone(&hub))
        .spawn(config.broadcast_periods(), &cancel);

    let (multiplexer, multiplexer_task) = LogMultiplexer::spawn(
        Arc::new(KubeLogSource::new(client)),
        Arc::clone(&hub),
        config.multiplexer_config(),
        cancel.clone(),
    );
    tasks.push(multiplexer_task);

    let reconciler = Reconciler::new(Arc::clone(&hub), multiplexer, config.reconcile_interval());
    tasks.push(tokio::spawn(reconciler.run(cancel.clone())));

    let server = tokio::spawn(kubepulse_hub::serve(
        listener,
        Arc::clone(&hub),
        config.viewer_queue_capacity,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "task ended abnormally");
        }
    }
    server.await.context("Viewer transport panicked")??;

    tracing::info!(dropped_frames = hub.dropped_frames(), "kubepulse stopped");
    Ok(())
}
