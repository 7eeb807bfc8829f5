use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{Api, Client, ResourceExt, runtime::watcher};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    api::MemberCluster,
    registry::{ClusterClientFactory, ClusterRegistry, probe_all},
};

/// Health monitor loop: keeps the cluster registry in sync with the
/// stored MemberCluster set and probes every registered cluster each
/// period, writing the resulting conditions back to the cluster's
/// status. Terminates when the stop signal fires.
pub async fn run(
    client: Client,
    registry: Arc<ClusterRegistry>,
    factory: Arc<dyn ClusterClientFactory>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let clusters = Api::<MemberCluster>::all(client.clone());
    let mut events = watcher(clusters, watcher::Config::default()).boxed();
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("health monitor stopping");
                return;
            }
            _ = ticker.tick() => {
                probe_all(&registry, &client).await;
            }
            event = events.next() => match event {
                Some(Ok(event)) => handle_event(event, &registry, factory.as_ref()).await,
                Some(Err(e)) => warn!(error = %e, "cluster watch error"),
                None => {
                    info!("cluster watch closed, health monitor stopping");
                    return;
                }
            }
        }
    }
}

async fn handle_event(
    event: watcher::Event<MemberCluster>,
    registry: &ClusterRegistry,
    factory: &dyn ClusterClientFactory,
) {
    match event {
        watcher::Event::Apply(cluster) | watcher::Event::InitApply(cluster) => {
            join_cluster(cluster, registry, factory).await;
        }
        watcher::Event::Delete(cluster) => {
            let name = cluster.name_any();
            info!(cluster = %name, "member cluster removed");
            registry.remove_cluster(&name);
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

async fn join_cluster(
    cluster: MemberCluster,
    registry: &ClusterRegistry,
    factory: &dyn ClusterClientFactory,
) {
    let name = cluster.name_any();
    if registry.client(&name).is_some() {
        return;
    }
    match factory.client_for(&cluster).await {
        Ok(client) => {
            info!(cluster = %name, endpoint = %cluster.spec.api_endpoint, "member cluster joined");
            registry.add_cluster(&name, client);
        }
        Err(e) => {
            // The next watch event or process restart retries the join
            warn!(cluster = %name, error = %e, "could not build member cluster client");
        }
    }
}
