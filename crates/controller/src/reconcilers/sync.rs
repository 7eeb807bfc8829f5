use std::{sync::Arc, time::Duration};

use futures::Stream;
use kube::{
    Api, Client, ResourceExt,
    core::{ApiResource, DynamicObject},
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    adapters::KindAdapter,
    engine::{Engine, QualifiedName},
    kinds::FederatedKind,
    reconcilers::Backoff,
    registry::ClusterRegistry,
};

/// How long a settled object waits before its periodic re-check.
const SETTLED_REQUEUE: Duration = Duration::from_secs(300);

struct ReconcilerCtx {
    engine: Engine<KindAdapter, KindAdapter, Arc<ClusterRegistry>>,
    backoff: Backoff,
}

/// Propagation control loop for one federated kind: watches the kind's
/// template resource, plus its placement and override resources mapped
/// back to the owning template, and reconciles through the engine.
pub fn control_loop(
    client: Client,
    registry: Arc<ClusterRegistry>,
    kind: FederatedKind,
    fanout: usize,
) -> impl Stream<
    Item = Result<(ObjectRef<DynamicObject>, Action), ControllerError<Error, watcher::Error>>,
> {
    let template_ar = kind.template_resource();
    let placement_ar = kind.placement_resource();
    let override_ar = kind.override_resource();

    let templates: Api<DynamicObject> = Api::all_with(client.clone(), &template_ar);
    let placements: Api<DynamicObject> = Api::all_with(client.clone(), &placement_ar);
    let overrides: Api<DynamicObject> = Api::all_with(client.clone(), &override_ar);

    let store = KindAdapter::new(kind.clone(), client.clone(), registry.clone());
    let members = KindAdapter::new(kind.clone(), client.clone(), registry.clone());
    let context = Arc::new(ReconcilerCtx {
        engine: Engine::new(kind, store, members, registry).with_fanout(fanout),
        backoff: Backoff::new(),
    });

    Controller::new_with(templates, watcher::Config::default(), template_ar.clone())
        .watches_with(
            placements,
            placement_ar,
            watcher::Config::default(),
            template_ref_mapper(template_ar.clone()),
        )
        .watches_with(
            overrides,
            override_ar,
            watcher::Config::default(),
            template_ref_mapper(template_ar),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

/// Placement/override events reconcile the template of the same
/// qualified name.
fn template_ref_mapper(
    template_ar: ApiResource,
) -> impl Fn(DynamicObject) -> Option<ObjectRef<DynamicObject>> {
    move |obj| {
        let mut object_ref = ObjectRef::new_with(&obj.name_any(), template_ar.clone());
        if let Some(ns) = obj.namespace() {
            object_ref = object_ref.within(&ns);
        }
        Some(object_ref)
    }
}

#[instrument(level = Level::DEBUG, skip(context))]
async fn reconcile(obj: Arc<DynamicObject>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let q = QualifiedName {
        namespace: obj.namespace(),
        name: obj.name_any(),
    };
    context.engine.reconcile(&q).await?;
    context.backoff.clear(&q.to_string());
    Ok(Action::requeue(SETTLED_REQUEUE))
}

fn error_policy(
    obj: Arc<DynamicObject>,
    error: &Error,
    context: Arc<ReconcilerCtx>,
) -> Action {
    let key = match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    };
    let delay = context.backoff.next_delay(&key);
    tracing::warn!(object = %key, error = %error, retry_in = ?delay, "propagation failed");
    Action::requeue(delay)
}
