//! Test doubles shared by the reconciler tests: an in-memory object store
//! with the [`ObjectStore`] contract, object builders, and fakes for the
//! outbound capabilities.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{
        ConfigMap, ContainerState, ContainerStateRunning, ContainerStatus, EndpointAddress,
        EndpointSubset, Endpoints, Pod, PodStatus,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::api::ObjectMeta;
use serde_json::Value;

use crate::{
    client::{
        AlreadyExistsSnafu, MissingNamespaceSnafu, NotFoundSnafu, ObjectStore, Result, StoreObject,
        kind_of,
    },
    elasticsearch::{self, ElasticsearchClient},
    events::{Event, EventRecorder},
    labels,
    nodecerts::csr::{self, CsrClient},
    restart::process_manager::{self, ProcessManagerClient, ProcessState, ProcessStatus},
};

type ObjectKey = (String, String, String);

/// In-memory [`ObjectStore`] with RFC 7386 merge-patch semantics.
#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn key<T: StoreObject>(namespace: &str, name: &str) -> ObjectKey {
        (kind_of::<T>(), namespace.to_string(), name.to_string())
    }

    fn object_key<T: StoreObject>(object: &T) -> Result<ObjectKey> {
        use kube::ResourceExt;

        let namespace = object.namespace().ok_or_else(|| {
            MissingNamespaceSnafu {
                kind: kind_of::<T>(),
                name: object.name_any(),
            }
            .build()
        })?;
        Ok(Self::key::<T>(&namespace, &object.name_any()))
    }

    fn labels_match(value: &Value, selector: &BTreeMap<String, String>) -> bool {
        let object_labels = &value["metadata"]["labels"];
        selector.iter().all(|(key, expected)| {
            object_labels
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == expected)
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&Self::key::<T>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).expect("stored object roundtrips")))
    }

    async fn list<T: StoreObject>(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<T>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((kind, object_namespace, _), value)| {
                kind == &kind_of::<T>()
                    && object_namespace == namespace
                    && Self::labels_match(value, label_selector)
            })
            .map(|(_, value)| {
                serde_json::from_value(value.clone()).expect("stored object roundtrips")
            })
            .collect())
    }

    async fn create<T: StoreObject>(&self, object: &T) -> Result<()> {
        let key = Self::object_key(object)?;
        let mut objects = self.objects.lock().unwrap();

        if objects.contains_key(&key) {
            return AlreadyExistsSnafu {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            }
            .fail();
        }

        let mut value = serde_json::to_value(object).expect("object serializes");
        let created = &mut value["metadata"]["creationTimestamp"];
        if created.is_null() {
            *created = serde_json::to_value(Time(Utc::now())).expect("timestamp serializes");
        }

        objects.insert(key, value);
        Ok(())
    }

    async fn update<T: StoreObject>(&self, object: &T) -> Result<()> {
        let key = Self::object_key(object)?;
        let mut objects = self.objects.lock().unwrap();

        if !objects.contains_key(&key) {
            return NotFoundSnafu {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            }
            .fail();
        }

        objects.insert(key, serde_json::to_value(object).expect("object serializes"));
        Ok(())
    }

    async fn delete<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&Self::key::<T>(namespace, name));
        Ok(())
    }

    async fn merge_patch<T: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        let key = Self::key::<T>(namespace, name);
        let mut objects = self.objects.lock().unwrap();

        let Some(target) = objects.get_mut(&key) else {
            return NotFoundSnafu {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            }
            .fail();
        };

        apply_merge_patch(target, &patch);
        Ok(())
    }
}

/// RFC 7386: objects merge recursively, `null` removes, everything else
/// replaces.
fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let target_map = target.as_object_mut().expect("target is an object");

    for (key, patch_value) in patch_map {
        if patch_value.is_null() {
            target_map.remove(key);
        } else {
            apply_merge_patch(
                target_map.entry(key.clone()).or_insert(Value::Null),
                patch_value,
            );
        }
    }
}

/// A stand-in owning cluster object. Carries a uid so it can hold owner
/// references.
pub(crate) fn owner_config_map(namespace: &str, name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

/// A cluster member pod with an assigned IP.
pub(crate) fn pod_with_ip(namespace: &str, name: &str, cluster_name: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                labels::CLUSTER_NAME_LABEL.to_string(),
                cluster_name.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

/// Marks the pod's `cert-initializer` init container as running.
pub(crate) fn run_cert_initializer(pod: &mut Pod) {
    pod.status
        .get_or_insert_with(PodStatus::default)
        .init_container_statuses = Some(vec![ContainerStatus {
        name: crate::nodecerts::CERT_INITIALIZER_CONTAINER_NAME.to_string(),
        state: Some(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        }),
        ..ContainerStatus::default()
    }]);
}

/// Endpoints with one ready address, i.e. a routable service.
pub(crate) fn ready_endpoints(namespace: &str, name: &str) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.2".to_string(),
                ..EndpointAddress::default()
            }]),
            ..EndpointSubset::default()
        }]),
    }
}

/// Captures published events.
#[derive(Default)]
pub(crate) struct FakeRecorder {
    pub(crate) events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn publish(&self, event: Event) -> crate::events::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Counts Elasticsearch settings calls.
#[derive(Default)]
pub(crate) struct FakeElasticsearch {
    pub(crate) disable_allocation_calls: AtomicUsize,
    pub(crate) enable_allocation_calls: AtomicUsize,
    pub(crate) synced_flush_calls: AtomicUsize,
}

#[async_trait]
impl ElasticsearchClient for FakeElasticsearch {
    async fn disable_replicas_shard_allocation(&self) -> elasticsearch::Result<()> {
        self.disable_allocation_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_shard_allocation(&self) -> elasticsearch::Result<()> {
        self.enable_allocation_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn synced_flush(&self) -> elasticsearch::Result<()> {
        self.synced_flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scriptable process manager: per-pod response queues, with `Stopped` /
/// `Started` as the defaults once a queue runs dry.
#[derive(Default)]
pub(crate) struct FakeProcessManager {
    stop_responses: Mutex<BTreeMap<String, VecDeque<ProcessState>>>,
    start_responses: Mutex<BTreeMap<String, VecDeque<ProcessState>>>,
    pub(crate) stop_calls: AtomicUsize,
    pub(crate) start_calls: AtomicUsize,
}

impl FakeProcessManager {
    pub(crate) fn queue_stop_response(&self, pod: &str, state: ProcessState) {
        self.stop_responses
            .lock()
            .unwrap()
            .entry(pod.to_string())
            .or_default()
            .push_back(state);
    }

    #[allow(dead_code)]
    pub(crate) fn queue_start_response(&self, pod: &str, state: ProcessState) {
        self.start_responses
            .lock()
            .unwrap()
            .entry(pod.to_string())
            .or_default()
            .push_back(state);
    }

    fn next_response(
        queues: &Mutex<BTreeMap<String, VecDeque<ProcessState>>>,
        pod: &str,
        default: ProcessState,
    ) -> ProcessState {
        queues
            .lock()
            .unwrap()
            .get_mut(pod)
            .and_then(VecDeque::pop_front)
            .unwrap_or(default)
    }
}

#[async_trait]
impl ProcessManagerClient for FakeProcessManager {
    async fn start(&self, pod: &Pod) -> process_manager::Result<ProcessStatus> {
        use kube::ResourceExt;

        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessStatus {
            state: Self::next_response(&self.start_responses, &pod.name_any(), ProcessState::Started),
        })
    }

    async fn stop(&self, pod: &Pod) -> process_manager::Result<ProcessStatus> {
        use kube::ResourceExt;

        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessStatus {
            state: Self::next_response(&self.stop_responses, &pod.name_any(), ProcessState::Stopped),
        })
    }

    async fn status(&self, _pod: &Pod) -> process_manager::Result<ProcessStatus> {
        Ok(ProcessStatus {
            state: ProcessState::Started,
        })
    }
}

/// Serves a fixed CSR payload and counts how often it was asked.
#[derive(Default)]
pub(crate) struct FakeCsrClient {
    csr: Vec<u8>,
    pub(crate) calls: AtomicUsize,
}

impl FakeCsrClient {
    pub(crate) fn serving(csr: Vec<u8>) -> Self {
        Self {
            csr,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CsrClient for FakeCsrClient {
    async fn retrieve_candidate_csr(&self, _pod: &Pod) -> csr::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.csr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_patch_merges_and_removes() {
        let store = MemoryStore::new();
        let mut pod = pod_with_ip("ns1", "p", "c", "1.2.3.4");
        pod.metadata.annotations = Some(BTreeMap::from([
            ("keep".to_string(), "yes".to_string()),
            ("drop".to_string(), "yes".to_string()),
        ]));
        store.create(&pod).await.unwrap();

        store
            .merge_patch::<Pod>(
                "ns1",
                "p",
                serde_json::json!({
                    "metadata": {
                        "annotations": {
                            "drop": null,
                            "added": "now",
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let patched: Pod = store.get("ns1", "p").await.unwrap().unwrap();
        let annotations = patched.metadata.annotations.unwrap();
        assert_eq!(annotations.get("keep").map(String::as_str), Some("yes"));
        assert_eq!(annotations.get("added").map(String::as_str), Some("now"));
        assert!(!annotations.contains_key("drop"));
    }

    #[tokio::test]
    async fn create_sets_a_creation_timestamp() {
        let store = MemoryStore::new();
        store
            .create(&pod_with_ip("ns1", "p", "c", "1.2.3.4"))
            .await
            .unwrap();

        let pod: Pod = store.get("ns1", "p").await.unwrap().unwrap();
        assert!(pod.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn list_filters_on_labels() {
        let store = MemoryStore::new();
        store
            .create(&pod_with_ip("ns1", "mine", "foo", "1.2.3.4"))
            .await
            .unwrap();
        store
            .create(&pod_with_ip("ns1", "other", "bar", "1.2.3.5"))
            .await
            .unwrap();

        let selector = BTreeMap::from([(
            labels::CLUSTER_NAME_LABEL.to_string(),
            "foo".to_string(),
        )]);
        let pods: Vec<Pod> = store.list("ns1", &selector).await.unwrap();
        assert_eq!(pods.len(), 1);

        use kube::ResourceExt;
        assert_eq!(pods[0].name_any(), "mine");
    }
}
