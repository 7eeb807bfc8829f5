use std::{sync::Arc, time::Duration};

use futures::Stream;
use garde::Validate;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    core::DynamicObject,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use serde_json::json;
use tracing::{Level, debug, instrument};

use crate::{
    Error, Result,
    adapters::KindAdapter,
    api::ReplicaSchedulingPreference,
    engine::{ControlStore, QualifiedName},
    kinds::KindRegistry,
    reconcilers::Backoff,
    registry::ClusterRegistry,
    scheduler,
};

const MANAGER_NAME: &str = "fedmesh-scheduler";
const SETTLED_REQUEUE: Duration = Duration::from_secs(300);

struct ReconcilerCtx {
    client: Client,
    registry: Arc<ClusterRegistry>,
    kinds: KindRegistry,
    backoff: Backoff,
}

/// Scheduling control loop: turns each ReplicaSchedulingPreference into
/// a per-cluster replica override for the template of the same
/// qualified name. The override write then triggers the propagation
/// loop for that kind. Placement resources of every registered kind
/// are watched too, so a placement edit reschedules immediately rather
/// than waiting out the periodic requeue.
pub fn control_loop(
    client: Client,
    registry: Arc<ClusterRegistry>,
    kinds: KindRegistry,
) -> impl Stream<
    Item = Result<
        (ObjectRef<ReplicaSchedulingPreference>, Action),
        ControllerError<Error, watcher::Error>,
    >,
> {
    let preferences = Api::<ReplicaSchedulingPreference>::all(client.clone());

    let mut controller = Controller::new(preferences, watcher::Config::default());
    for kind in kinds.iter() {
        let placement_ar = kind.placement_resource();
        let placements: Api<DynamicObject> = Api::all_with(client.clone(), &placement_ar);
        controller = controller.watches_with(
            placements,
            placement_ar,
            watcher::Config::default(),
            preference_ref_mapper(),
        );
    }

    let context = Arc::new(ReconcilerCtx {
        client,
        registry,
        kinds,
        backoff: Backoff::new(),
    });

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

/// Placement events reschedule the preference of the same qualified
/// name.
fn preference_ref_mapper()
-> impl Fn(DynamicObject) -> Option<ObjectRef<ReplicaSchedulingPreference>> {
    |obj| {
        let mut object_ref = ObjectRef::new(&obj.name_any());
        if let Some(ns) = obj.namespace() {
            object_ref = object_ref.within(&ns);
        }
        Some(object_ref)
    }
}

#[instrument(level = Level::DEBUG, skip(context))]
async fn reconcile(
    preference: Arc<ReplicaSchedulingPreference>,
    context: Arc<ReconcilerCtx>,
) -> Result<Action> {
    preference
        .spec
        .validate()
        .map_err(|e| Error::validation(e.to_string()))?;

    let kind = context
        .kinds
        .get(&preference.spec.target_kind)
        .ok_or_else(|| {
            Error::config(format!(
                "no registered kind {} for scheduling preference",
                preference.spec.target_kind
            ))
        })?;

    let q = QualifiedName {
        namespace: preference.namespace(),
        name: preference.name_any(),
    };

    let adapter = KindAdapter::new(kind.clone(), context.client.clone(), context.registry.clone());

    let Some(placement) = adapter.placement(&q).await? else {
        debug!(object = %q, "no placement, nothing to schedule");
        return Ok(Action::requeue(SETTLED_REQUEUE));
    };
    let target_clusters = if placement.is_wildcard() {
        context.registry.ready_clusters()
    } else {
        let mut names = placement.cluster_names.clone();
        names.sort();
        names.dedup();
        names
    };

    let previous = adapter
        .overrides(&q)
        .await?
        .map(|(spec, _)| scheduler::previous_assignment(&spec));

    let assignment = scheduler::plan(&preference.spec, &target_clusters, previous.as_ref())?;

    if previous.as_ref() == Some(&assignment) {
        debug!(object = %q, "assignment unchanged");
        context.backoff.clear(&q.to_string());
        return Ok(Action::requeue(SETTLED_REQUEUE));
    }

    let override_ar = kind.override_resource();
    let overrides_api: Api<DynamicObject> = match &q.namespace {
        Some(ns) => Api::namespaced_with(context.client.clone(), ns, &override_ar),
        None => Api::all_with(context.client.clone(), &override_ar),
    };

    let mut desired = DynamicObject::new(&q.name, &override_ar);
    desired.metadata.namespace = q.namespace.clone();
    desired.data = json!({
        "spec": serde_json::to_value(scheduler::override_entries(&assignment))?
    });

    let pp = PatchParams::apply(MANAGER_NAME).force();
    overrides_api
        .patch(&q.name, &pp, &Patch::Apply(&desired))
        .await?;

    debug!(object = %q, ?assignment, "wrote replica override");
    context.backoff.clear(&q.to_string());
    Ok(Action::requeue(SETTLED_REQUEUE))
}

fn error_policy(
    preference: Arc<ReplicaSchedulingPreference>,
    error: &Error,
    context: Arc<ReconcilerCtx>,
) -> Action {
    let key = match preference.namespace() {
        Some(ns) => format!("{}/{}", ns, preference.name_any()),
        None => preference.name_any(),
    };
    let delay = context.backoff.next_delay(&key);
    tracing::warn!(object = %key, error = %error, retry_in = ?delay, "scheduling failed");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_events_map_to_the_preference_of_the_same_name() {
        let kind = KindRegistry::builtin().get("Deployment").unwrap().clone();
        let mapper = preference_ref_mapper();

        let placement =
            DynamicObject::new("web", &kind.placement_resource()).within("default");
        let object_ref = mapper(placement).unwrap();
        assert_eq!(object_ref.name, "web");
        assert_eq!(object_ref.namespace.as_deref(), Some("default"));
    }
}
