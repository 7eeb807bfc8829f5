use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;

use controller::{
    api::{MemberCluster, PropagatedVersion, ReplicaSchedulingPreference},
    kinds::KindRegistry,
    reconcilers,
    registry::{ClusterRegistry, SecretClientFactory},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    /// Seconds between member-cluster health probes
    #[arg(long, env = "CLUSTER_MONITOR_PERIOD", default_value_t = 40)]
    cluster_monitor_period: u64,

    /// Bound on concurrent member-cluster calls within one reconcile
    #[arg(long, env = "CLUSTER_FANOUT", default_value_t = 4)]
    cluster_fanout: usize,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the controller reconciliation loops
    #[command(subcommand)]
    Reconcile(ReconcileTarget),
    /// Output K8s manifest for a given CRD resource
    #[command(subcommand)]
    CrdManifest(Crd),
}

#[derive(Debug, Clone, Subcommand)]
enum ReconcileTarget {
    /// Propagation loops for every registered kind, plus the health monitor
    Federated {
        /// Restrict to one registered kind, e.g. Deployment
        #[arg(long)]
        kind: Option<String>,
    },
    /// Replica scheduling loop, plus the health monitor
    Scheduling,
    /// All loops
    All,
}

#[derive(Debug, Clone, Subcommand)]
enum Crd {
    Cluster,
    PropagatedVersion,
    SchedulingPreference,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command.clone() {
        Some(Commands::Reconcile(target)) => run_controller(&cli, target).await?,
        Some(Commands::CrdManifest(crd)) => {
            let crd = match crd {
                Crd::Cluster => MemberCluster::crd(),
                Crd::PropagatedVersion => PropagatedVersion::crd(),
                Crd::SchedulingPreference => ReplicaSchedulingPreference::crd(),
            };

            println!("{}", serde_yaml_ng::to_string(&crd)?);
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(cli: &Cli, target: ReconcileTarget) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    let kinds = KindRegistry::builtin();
    let registry = Arc::new(ClusterRegistry::new());
    let factory = Arc::new(SecretClientFactory::new(client.clone()));

    // Every loop needs live member clients, so the health monitor runs
    // alongside whichever target was selected.
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let monitor = tokio::spawn(reconcilers::health::run(
        client.clone(),
        registry.clone(),
        factory,
        Duration::from_secs(cli.cluster_monitor_period),
        stop_rx,
    ));

    // The controller streams stop themselves on SIGINT/SIGTERM; the
    // monitor gets the same signal forwarded so everything winds down
    // together.
    let signal_stop = stop_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_stop.send(true);
    });

    let mut loops = Vec::new();

    let run_sync = |only: Option<&str>| {
        let mut streams = Vec::new();
        for kind in kinds.iter() {
            if only.is_some_and(|k| k != kind.target_kind) {
                continue;
            }
            let stream = reconcilers::sync::control_loop(
                client.clone(),
                registry.clone(),
                kind.clone(),
                cli.cluster_fanout,
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => tracing::info!("Reconciled federated object {:?}", o),
                    Err(e) => tracing::error!("Propagation reconcile failed: {:?}", e),
                }
            });
            streams.push(stream);
        }
        streams
    };

    match target {
        ReconcileTarget::Federated { kind } => {
            if let Some(kind) = &kind {
                anyhow::ensure!(kinds.get(kind).is_some(), "unknown kind {kind}");
            }
            for stream in run_sync(kind.as_deref()) {
                loops.push(tokio::spawn(stream));
            }
        }
        ReconcileTarget::Scheduling => {
            let stream = reconcilers::scheduling::control_loop(
                client.clone(),
                registry.clone(),
                kinds.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => tracing::info!("Reconciled scheduling preference {:?}", o),
                    Err(e) => tracing::error!("Scheduling reconcile failed: {:?}", e),
                }
            });
            loops.push(tokio::spawn(stream));
        }
        ReconcileTarget::All => {
            for stream in run_sync(None) {
                loops.push(tokio::spawn(stream));
            }
            let stream = reconcilers::scheduling::control_loop(
                client.clone(),
                registry.clone(),
                kinds.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => tracing::info!("Reconciled scheduling preference {:?}", o),
                    Err(e) => tracing::error!("Scheduling reconcile failed: {:?}", e),
                }
            });
            loops.push(tokio::spawn(stream));
        }
    }

    for handle in loops {
        handle.await?;
    }

    let _ = stop_tx.send(true);
    monitor.await?;

    tracing::info!("controller terminated");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
