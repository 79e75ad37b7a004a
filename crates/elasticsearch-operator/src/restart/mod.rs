//! Cluster node restart orchestration.
//!
//! A restart cycle is requested with a single annotation on the owning
//! cluster object and then carried entirely by per-pod annotations: a
//! phase, a strategy, and the cycle's start time. Each reconciliation pass
//! reads the annotations, advances whatever can advance, and returns
//! whether the cycle is complete; the outer runtime handles requeueing.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};

use crate::{
    Duration,
    client::{self, ObjectStore, StoreObject, apply_annotations},
    elasticsearch::{self, ElasticsearchClient},
    events::{Event, EventRecorder, emit},
    labels,
    names::{self, Namer},
};

pub mod coordinated;
pub mod process_manager;

pub use coordinated::CoordinatedRestart;

/// A per-pod restart gives up after this long and surfaces a warning
/// event instead of blocking the cluster forever.
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_minutes(15);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object store access failed"))]
    Store { source: client::Error },

    #[snafu(display("failed to adjust shard allocation"))]
    ShardAllocation { source: elasticsearch::Error },

    #[snafu(display("process manager call for pod {pod} failed"))]
    ProcessManager {
        source: process_manager::Error,
        pod: String,
    },

    #[snafu(display("owning object has no namespace"))]
    MissingNamespace,
}

/// Where a pod stands in its restart cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RestartPhase {
    Schedule,
    Stop,
    Start,
}

/// How the pods of a cluster are cycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RestartStrategy {
    /// Pods restart independently.
    Simple,
    /// The whole cluster stops, then starts, as one cohort.
    Coordinated,
    /// One pod at a time.
    Rolling,
}

pub fn restart_phase(pod: &Pod) -> Option<RestartPhase> {
    pod.annotations()
        .get(labels::RESTART_PHASE_ANNOTATION)?
        .parse()
        .ok()
}

pub fn restart_strategy(pod: &Pod) -> Option<RestartStrategy> {
    pod.annotations()
        .get(labels::RESTART_STRATEGY_ANNOTATION)?
        .parse()
        .ok()
}

pub fn restart_start_time(pod: &Pod) -> Option<DateTime<Utc>> {
    let raw = pod.annotations().get(labels::RESTART_START_TIME_ANNOTATION)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

pub(crate) async fn annotate_pod_for_restart<S>(
    store: &S,
    pod: &Pod,
    phase: RestartPhase,
    strategy: RestartStrategy,
    start_time: DateTime<Utc>,
) -> Result<(), client::Error>
where
    S: ObjectStore,
{
    apply_annotations(
        store,
        pod,
        BTreeMap::from([
            (labels::RESTART_PHASE_ANNOTATION, Some(phase.to_string())),
            (
                labels::RESTART_STRATEGY_ANNOTATION,
                Some(strategy.to_string()),
            ),
            (
                labels::RESTART_START_TIME_ANNOTATION,
                Some(start_time.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            ),
        ]),
    )
    .await
}

pub(crate) async fn set_restart_phase<S>(
    store: &S,
    pod: &Pod,
    phase: RestartPhase,
) -> Result<(), client::Error>
where
    S: ObjectStore,
{
    apply_annotations(
        store,
        pod,
        BTreeMap::from([(labels::RESTART_PHASE_ANNOTATION, Some(phase.to_string()))]),
    )
    .await
}

/// Removes all three restart annotations from a pod, ending its
/// participation in the cycle.
pub(crate) async fn clear_restart_annotations<S>(
    store: &S,
    pod: &Pod,
) -> Result<(), client::Error>
where
    S: ObjectStore,
{
    apply_annotations(
        store,
        pod,
        BTreeMap::from([
            (labels::RESTART_PHASE_ANNOTATION, None),
            (labels::RESTART_STRATEGY_ANNOTATION, None),
            (labels::RESTART_START_TIME_ANNOTATION, None),
        ]),
    )
    .await
}

/// Turns a cluster-level restart request into per-pod state: every pod to
/// keep is stamped `schedule`/`coordinated`/now, the cluster annotation is
/// cleared, and an event announces the cycle.
///
/// Returns whether a restart was scheduled.
#[instrument(skip_all, fields(owner = %owner.name_any()))]
pub async fn schedule_coordinated_restart<S, O, R>(
    store: &S,
    recorder: &R,
    owner: &O,
    pods_to_keep: &[Pod],
) -> Result<bool>
where
    S: ObjectStore,
    O: StoreObject,
    R: EventRecorder,
{
    let Some(requested) = owner.annotations().get(labels::CLUSTER_RESTART_ANNOTATION) else {
        return Ok(false);
    };

    let strategy = match requested.parse::<RestartStrategy>() {
        Ok(RestartStrategy::Coordinated) => RestartStrategy::Coordinated,
        Ok(other) => {
            debug!(strategy = %other, "restart strategy is not handled by this controller");
            return Ok(false);
        }
        Err(_) => {
            warn!(
                requested,
                "unknown restart strategy requested, ignoring the annotation"
            );
            return Ok(false);
        }
    };

    let start_time = Utc::now();
    for pod in pods_to_keep {
        annotate_pod_for_restart(store, pod, RestartPhase::Schedule, strategy, start_time)
            .await
            .context(StoreSnafu)?;
    }

    apply_annotations(
        store,
        owner,
        BTreeMap::from([(labels::CLUSTER_RESTART_ANNOTATION, None)]),
    )
    .await
    .context(StoreSnafu)?;

    info!(pods = pods_to_keep.len(), "coordinated restart scheduled");
    emit(
        recorder,
        Event::normal(
            "Restart",
            "RestartScheduled",
            format!(
                "Coordinated restart scheduled for {count} nodes",
                count = pods_to_keep.len()
            ),
        ),
    )
    .await;

    Ok(true)
}

/// One full restart-reconciliation pass for a cluster: handle a pending
/// cluster-level request, then drive the coordinated cohort.
///
/// Returns `true` when nothing is left to do, `false` when the outer loop
/// should requeue.
pub async fn reconcile<S, O, E, P, R>(
    store: &S,
    recorder: &R,
    es: &E,
    process_manager: &P,
    namer: &Namer,
    owner: &O,
    pods: Vec<Pod>,
    timeout: Duration,
) -> Result<bool>
where
    S: ObjectStore,
    O: StoreObject,
    E: ElasticsearchClient,
    P: process_manager::ProcessManagerClient,
    R: EventRecorder,
{
    if schedule_coordinated_restart(store, recorder, owner, &pods).await? {
        // pod annotations just changed; let the next pass observe them
        return Ok(false);
    }

    let cohort: Vec<Pod> = pods
        .into_iter()
        .filter(|pod| restart_strategy(pod) == Some(RestartStrategy::Coordinated))
        .collect();
    if cohort.is_empty() {
        return Ok(true);
    }

    let namespace = owner.namespace().context(MissingNamespaceSnafu)?;
    let owner_name = owner.name_any();
    let restart = CoordinatedRestart {
        store,
        es,
        process_manager,
        recorder,
        namespace,
        service_name: names::external_service_name(namer, &owner_name),
        timeout,
    };

    restart.exec(cohort).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventType,
        testing::{FakeRecorder, MemoryStore, owner_config_map, pod_with_ip},
    };

    #[tokio::test]
    async fn cluster_annotation_seeds_pod_annotations() {
        let store = MemoryStore::new();
        let recorder = FakeRecorder::default();
        let mut owner = owner_config_map("ns1", "foo");
        owner.metadata.annotations = Some(
            [(
                labels::CLUSTER_RESTART_ANNOTATION.to_string(),
                "coordinated".to_string(),
            )]
            .into(),
        );
        store.create(&owner).await.unwrap();

        let pods: Vec<Pod> = (0..3)
            .map(|i| pod_with_ip("ns1", &format!("foo-es-{i}"), "foo", "1.2.3.4"))
            .collect();
        for pod in &pods {
            store.create(pod).await.unwrap();
        }

        let scheduled = schedule_coordinated_restart(&store, &recorder, &owner, &pods)
            .await
            .unwrap();
        assert!(scheduled);

        for i in 0..3 {
            let pod: Pod = store
                .get("ns1", &format!("foo-es-{i}"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(restart_phase(&pod), Some(RestartPhase::Schedule));
            assert_eq!(restart_strategy(&pod), Some(RestartStrategy::Coordinated));
            let start = restart_start_time(&pod).expect("start time annotation missing");
            assert!(Utc::now().signed_duration_since(start).num_seconds() < 10);
        }

        // the cluster-level annotation is gone
        let owner: k8s_openapi::api::core::v1::ConfigMap =
            store.get("ns1", "foo").await.unwrap().unwrap();
        assert!(
            !owner
                .metadata
                .annotations
                .unwrap_or_default()
                .contains_key(labels::CLUSTER_RESTART_ANNOTATION)
        );

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Normal);
        assert_eq!(events[0].reason, "RestartScheduled");
    }

    #[tokio::test]
    async fn no_annotation_schedules_nothing() {
        let store = MemoryStore::new();
        let recorder = FakeRecorder::default();
        let owner = owner_config_map("ns1", "foo");

        let scheduled = schedule_coordinated_restart(&store, &recorder, &owner, &[])
            .await
            .unwrap();
        assert!(!scheduled);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn phase_and_strategy_roundtrip_through_strings() {
        assert_eq!(RestartPhase::Schedule.to_string(), "schedule");
        assert_eq!("stop".parse::<RestartPhase>().unwrap(), RestartPhase::Stop);
        assert_eq!(
            "coordinated".parse::<RestartStrategy>().unwrap(),
            RestartStrategy::Coordinated
        );
        assert!("unknown".parse::<RestartPhase>().is_err());
    }
}
