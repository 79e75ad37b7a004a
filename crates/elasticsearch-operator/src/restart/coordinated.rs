//! The coordinated stop/start state machine.
//!
//! All pods of the cohort move through `schedule → stop → start` together;
//! a step only runs once no pod remains in an earlier phase. Nothing here
//! blocks waiting for the cluster: every pass either advances the cohort
//! or reports "not done" and lets the outer loop requeue.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{debug, info, instrument, warn};

use super::{
    Error, ProcessManagerSnafu, RestartPhase, Result, ShardAllocationSnafu, StoreSnafu,
    clear_restart_annotations, restart_phase, restart_start_time, set_restart_phase,
};
use crate::{
    Duration,
    client::ObjectStore,
    elasticsearch::{self, ElasticsearchClient},
    events::{Event, EventRecorder, emit},
    restart::process_manager::{ProcessManagerClient, ProcessState},
};

/// One coordinated restart pass over a cluster's pod cohort.
pub struct CoordinatedRestart<'a, S, E, P, R> {
    pub store: &'a S,
    pub es: &'a E,
    pub process_manager: &'a P,
    pub recorder: &'a R,
    pub namespace: String,
    /// External service whose endpoints signal cluster readiness.
    pub service_name: String,
    pub timeout: Duration,
}

impl<S, E, P, R> CoordinatedRestart<'_, S, E, P, R>
where
    S: ObjectStore,
    E: ElasticsearchClient,
    P: ProcessManagerClient,
    R: EventRecorder,
{
    /// Advances the cohort as far as possible. Returns `true` once every
    /// pod finished its cycle.
    #[instrument(skip_all, fields(pods = pods.len()))]
    pub async fn exec(&self, pods: Vec<Pod>) -> Result<bool> {
        let pods = self.abort_timed_out(pods).await?;

        let in_phase = |phase: RestartPhase| {
            pods.iter()
                .filter(move |pod| restart_phase(pod) == Some(phase))
                .collect::<Vec<_>>()
        };

        // A step never runs while a pod sits in an earlier phase: the
        // cohort moves as one.
        let scheduled = in_phase(RestartPhase::Schedule);
        if !scheduled.is_empty() {
            self.schedule_stop(&scheduled).await?;
            return Ok(false);
        }

        let stopping = in_phase(RestartPhase::Stop);
        if !stopping.is_empty() {
            self.stop(&stopping).await?;
            return Ok(false);
        }

        let starting = in_phase(RestartPhase::Start);
        if !starting.is_empty() {
            return self.start(&starting).await;
        }

        Ok(true)
    }

    /// Drops pods whose cycle has been running longer than the timeout:
    /// their annotations are cleared, a warning event is emitted, and the
    /// rest of the cohort continues without them.
    async fn abort_timed_out(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        let now = Utc::now();
        let mut kept = Vec::with_capacity(pods.len());

        for pod in pods {
            let timed_out = restart_start_time(&pod).is_some_and(|start_time| {
                now.signed_duration_since(start_time) > self.timeout.as_chrono()
            });

            if !timed_out {
                kept.push(pod);
                continue;
            }

            warn!(
                pod = %pod.name_any(),
                timeout = %self.timeout,
                "aborting coordinated restart, timeout exceeded"
            );
            clear_restart_annotations(self.store, &pod)
                .await
                .context(StoreSnafu)?;
            emit(
                self.recorder,
                Event::warning(
                    "Restart",
                    "RestartTimeout",
                    format!(
                        "Aborting coordinated restart for pod {pod}, timeout exceeded",
                        pod = pod.name_any()
                    ),
                ),
            )
            .await;
        }

        Ok(kept)
    }

    /// schedule → stop: prepare the cluster to lose all its nodes, then
    /// flip every pod to the stop phase.
    async fn schedule_stop(&self, pods: &[&Pod]) -> Result<()> {
        self.es
            .disable_replicas_shard_allocation()
            .await
            .context(ShardAllocationSnafu)?;

        // a synced flush speeds up recovery but is not required for
        // correctness
        if let Err(error) = self.es.synced_flush().await {
            warn!(
                error = &error as &dyn std::error::Error,
                "synced flush failed, continuing"
            );
        }

        for pod in pods {
            set_restart_phase(self.store, pod, RestartPhase::Stop)
                .await
                .context(StoreSnafu)?;
        }

        info!(pods = pods.len(), "cluster prepared, pods moving to stop");
        Ok(())
    }

    /// stop → start: ask every process manager to stop; only when all of
    /// them report `Stopped` does the cohort move on.
    async fn stop(&self, pods: &[&Pod]) -> Result<()> {
        let mut all_stopped = true;

        for pod in pods {
            let status = self
                .process_manager
                .stop(pod)
                .await
                .context(ProcessManagerSnafu {
                    pod: pod.name_any(),
                })?;

            if status.state != ProcessState::Stopped {
                debug!(pod = %pod.name_any(), state = ?status.state, "still stopping");
                all_stopped = false;
            }
        }

        if !all_stopped {
            return Ok(());
        }

        for pod in pods {
            set_restart_phase(self.store, pod, RestartPhase::Start)
                .await
                .context(StoreSnafu)?;
        }

        info!(pods = pods.len(), "all nodes stopped, pods moving to start");
        Ok(())
    }

    /// start → done: start every node, wait for the cluster service to be
    /// routable again, re-enable shard allocation, and clear the restart
    /// state.
    async fn start(&self, pods: &[&Pod]) -> Result<bool> {
        let mut all_started = true;

        for pod in pods {
            let status = self
                .process_manager
                .start(pod)
                .await
                .context(ProcessManagerSnafu {
                    pod: pod.name_any(),
                })?;

            if status.state != ProcessState::Started {
                debug!(pod = %pod.name_any(), state = ?status.state, "still starting");
                all_started = false;
            }
        }

        if !all_started {
            return Ok(false);
        }

        if !elasticsearch::is_service_ready(self.store, &self.namespace, &self.service_name)
            .await
            .context(StoreSnafu)?
        {
            debug!(service = %self.service_name, "cluster service not ready yet");
            return Ok(false);
        }

        self.es
            .enable_shard_allocation()
            .await
            .context(ShardAllocationSnafu)?;

        for pod in pods {
            clear_restart_annotations(self.store, pod)
                .await
                .context(StoreSnafu)?;
        }

        info!(pods = pods.len(), "coordinated restart complete");
        emit(
            self.recorder,
            Event::normal("Restart", "RestartCompleted", "Coordinated restart complete"),
        )
        .await;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::atomic::Ordering};

    use chrono::TimeDelta;
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;
    use crate::{
        events::EventType,
        labels, names,
        restart::{self, RestartStrategy},
        testing::{
            FakeElasticsearch, FakeProcessManager, FakeRecorder, MemoryStore, owner_config_map,
            pod_with_ip, ready_endpoints,
        },
    };

    async fn seeded_pod(
        store: &MemoryStore,
        name: &str,
        phase: RestartPhase,
        start_offset: TimeDelta,
    ) -> Pod {
        let mut pod = pod_with_ip("ns1", name, "foo", "1.2.3.4");
        pod.metadata.annotations = Some(BTreeMap::from([
            (
                labels::RESTART_PHASE_ANNOTATION.to_string(),
                phase.to_string(),
            ),
            (
                labels::RESTART_STRATEGY_ANNOTATION.to_string(),
                RestartStrategy::Coordinated.to_string(),
            ),
            (
                labels::RESTART_START_TIME_ANNOTATION.to_string(),
                (Utc::now() - start_offset).to_rfc3339(),
            ),
        ]));
        store.create(&pod).await.unwrap();
        pod
    }

    async fn fetch_pods(store: &MemoryStore, names: &[&str]) -> Vec<Pod> {
        let mut pods = Vec::new();
        for name in names {
            pods.push(store.get::<Pod>("ns1", name).await.unwrap().unwrap());
        }
        pods
    }

    struct Harness {
        store: MemoryStore,
        es: FakeElasticsearch,
        process_manager: FakeProcessManager,
        recorder: FakeRecorder,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                es: FakeElasticsearch::default(),
                process_manager: FakeProcessManager::default(),
                recorder: FakeRecorder::default(),
            }
        }

        fn restart(&self) -> CoordinatedRestart<'_, MemoryStore, FakeElasticsearch, FakeProcessManager, FakeRecorder>
        {
            CoordinatedRestart {
                store: &self.store,
                es: &self.es,
                process_manager: &self.process_manager,
                recorder: &self.recorder,
                namespace: "ns1".to_string(),
                service_name: "foo-es".to_string(),
                timeout: restart::DEFAULT_RESTART_TIMEOUT,
            }
        }
    }

    #[tokio::test]
    async fn full_cycle_completes_and_clears_annotations() {
        let harness = Harness::new();
        harness
            .store
            .create(&ready_endpoints("ns1", "foo-es"))
            .await
            .unwrap();

        seeded_pod(&harness.store, "foo-es-0", RestartPhase::Schedule, TimeDelta::zero()).await;
        seeded_pod(&harness.store, "foo-es-1", RestartPhase::Schedule, TimeDelta::zero()).await;
        let names = ["foo-es-0", "foo-es-1"];

        // pass 1: schedule → stop
        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(harness.es.disable_allocation_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.es.synced_flush_calls.load(Ordering::SeqCst), 1);
        for pod in fetch_pods(&harness.store, &names).await {
            assert_eq!(restart_phase(&pod), Some(RestartPhase::Stop));
        }

        // pass 2: stop → start
        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(!done);
        for pod in fetch_pods(&harness.store, &names).await {
            assert_eq!(restart_phase(&pod), Some(RestartPhase::Start));
        }

        // pass 3: start → done
        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(done);
        assert_eq!(harness.es.enable_allocation_calls.load(Ordering::SeqCst), 1);
        for pod in fetch_pods(&harness.store, &names).await {
            assert!(restart_phase(&pod).is_none());
            assert!(restart::restart_strategy(&pod).is_none());
            assert!(restart_start_time(&pod).is_none());
        }

        let events = harness.recorder.events.lock().unwrap();
        assert_eq!(events.last().unwrap().reason, "RestartCompleted");
    }

    #[tokio::test]
    async fn no_pod_starts_until_every_pod_stopped() {
        let harness = Harness::new();
        seeded_pod(&harness.store, "foo-es-0", RestartPhase::Stop, TimeDelta::zero()).await;
        seeded_pod(&harness.store, "foo-es-1", RestartPhase::Stop, TimeDelta::zero()).await;
        let names = ["foo-es-0", "foo-es-1"];

        // one node lags behind
        harness
            .process_manager
            .queue_stop_response("foo-es-1", ProcessState::Stopping);

        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(!done);
        for pod in fetch_pods(&harness.store, &names).await {
            assert_eq!(restart_phase(&pod), Some(RestartPhase::Stop));
        }

        // next pass reports everything stopped, the cohort moves together
        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(!done);
        for pod in fetch_pods(&harness.store, &names).await {
            assert_eq!(restart_phase(&pod), Some(RestartPhase::Start));
        }

        // both pods were asked to stop on both passes
        assert_eq!(harness.process_manager.stop_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn timed_out_pod_is_dropped_from_the_cohort() {
        let harness = Harness::new();
        seeded_pod(
            &harness.store,
            "foo-es-0",
            RestartPhase::Stop,
            restart::DEFAULT_RESTART_TIMEOUT.as_chrono() + TimeDelta::seconds(1),
        )
        .await;
        seeded_pod(&harness.store, "foo-es-1", RestartPhase::Stop, TimeDelta::zero()).await;
        let names = ["foo-es-0", "foo-es-1"];

        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &names).await)
            .await
            .unwrap();
        assert!(!done);

        // the late pod lost its annotations and got a warning event
        let aborted: Pod = harness.store.get("ns1", "foo-es-0").await.unwrap().unwrap();
        assert!(restart_phase(&aborted).is_none());
        assert!(restart::restart_strategy(&aborted).is_none());
        assert!(restart_start_time(&aborted).is_none());

        let events = harness.recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Warning);
        assert!(events[0].message.contains("foo-es-0"));

        // the healthy pod continued through the stop step
        let healthy: Pod = harness.store.get("ns1", "foo-es-1").await.unwrap().unwrap();
        assert_eq!(restart_phase(&healthy), Some(RestartPhase::Start));
    }

    #[tokio::test]
    async fn start_waits_for_the_cluster_service() {
        let harness = Harness::new();
        seeded_pod(&harness.store, "foo-es-0", RestartPhase::Start, TimeDelta::zero()).await;

        // no endpoints object yet: not done, annotations stay
        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &["foo-es-0"]).await)
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(harness.es.enable_allocation_calls.load(Ordering::SeqCst), 0);

        harness
            .store
            .create(&ready_endpoints("ns1", "foo-es"))
            .await
            .unwrap();

        let done = harness
            .restart()
            .exec(fetch_pods(&harness.store, &["foo-es-0"]).await)
            .await
            .unwrap();
        assert!(done);
        assert_eq!(harness.es.enable_allocation_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.process_manager.start_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn end_to_end_from_cluster_annotation() {
        let harness = Harness::new();
        harness
            .store
            .create(&ready_endpoints("ns1", "foo-es"))
            .await
            .unwrap();

        let mut owner = owner_config_map("ns1", "foo");
        owner.metadata.annotations = Some(BTreeMap::from([(
            labels::CLUSTER_RESTART_ANNOTATION.to_string(),
            "coordinated".to_string(),
        )]));
        harness.store.create(&owner).await.unwrap();

        for name in ["foo-es-0", "foo-es-1"] {
            harness
                .store
                .create(&pod_with_ip("ns1", name, "foo", "1.2.3.4"))
                .await
                .unwrap();
        }

        let namer = names::es_namer();
        let mut passes = 0;
        loop {
            passes += 1;
            assert!(passes <= 10, "restart did not converge");

            let owner: ConfigMap = harness.store.get("ns1", "foo").await.unwrap().unwrap();
            let pods = fetch_pods(&harness.store, &["foo-es-0", "foo-es-1"]).await;
            let done = restart::reconcile(
                &harness.store,
                &harness.recorder,
                &harness.es,
                &harness.process_manager,
                &namer,
                &owner,
                pods,
                restart::DEFAULT_RESTART_TIMEOUT,
            )
            .await
            .unwrap();

            if done {
                break;
            }
        }

        // trigger + schedule + stop + start
        assert!(passes >= 4);

        for pod in fetch_pods(&harness.store, &["foo-es-0", "foo-es-1"]).await {
            assert!(pod.annotations().get(labels::RESTART_PHASE_ANNOTATION).is_none());
            assert!(pod.annotations().get(labels::RESTART_STRATEGY_ANNOTATION).is_none());
            assert!(
                pod.annotations()
                    .get(labels::RESTART_START_TIME_ANNOTATION)
                    .is_none()
            );
        }

        let events = harness.recorder.events.lock().unwrap();
        let reasons: Vec<&str> = events.iter().map(|event| event.reason.as_str()).collect();
        assert_eq!(reasons, vec!["RestartScheduled", "RestartCompleted"]);
    }
}
