//! Typed access to the Kubernetes object store.
//!
//! Reconcilers depend on the [`ObjectStore`] capability instead of a
//! concrete API client: absence is an [`Option`], deletes are idempotent,
//! and listing uses label equality. [`Client`] is the production
//! implementation on top of [`kube`]; tests run against an in-memory store
//! with the same contract.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Resource, ResourceExt,
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to get {kind} {namespace}/{name}"))]
    GetObject {
        source: kube::Error,
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to list {kind} objects in {namespace}"))]
    ListObjects {
        source: kube::Error,
        kind: String,
        namespace: String,
    },

    #[snafu(display("failed to create {kind} {namespace}/{name}"))]
    CreateObject {
        source: kube::Error,
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to update {kind} {namespace}/{name}"))]
    UpdateObject {
        source: kube::Error,
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {namespace}/{name}"))]
    DeleteObject {
        source: kube::Error,
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to patch {kind} {namespace}/{name}"))]
    PatchObject {
        source: kube::Error,
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {name} has no namespace"))]
    MissingNamespace { kind: String, name: String },

    #[snafu(display("{kind} {namespace}/{name} already exists"))]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} not found"))]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
}

/// Object types the store can traffic in: namespaced, statically typed,
/// serializable.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub(crate) fn kind_of<T>() -> String
where
    T: Resource<DynamicType = ()>,
{
    T::kind(&()).into_owned()
}

/// The object-store capability the reconcilers are written against.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads one object; absence is `Ok(None)`, never an error.
    async fn get<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<T>>;

    /// Lists objects whose labels contain every `(key, value)` pair of
    /// `label_selector`.
    async fn list<T: StoreObject>(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<T>>;

    async fn create<T: StoreObject>(&self, object: &T) -> Result<()>;

    async fn update<T: StoreObject>(&self, object: &T) -> Result<()>;

    /// Deletes an object. Deleting an absent object is not an error.
    async fn delete<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Applies an RFC 7386 merge patch.
    async fn merge_patch<T: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>;
}

/// Merge-patches `metadata.annotations` of `object`. A `None` value removes
/// the key.
pub async fn apply_annotations<S, T>(
    store: &S,
    object: &T,
    annotations: BTreeMap<&str, Option<String>>,
) -> Result<()>
where
    S: ObjectStore + ?Sized,
    T: StoreObject,
{
    let namespace = object.namespace().context(MissingNamespaceSnafu {
        kind: kind_of::<T>(),
        name: object.name_any(),
    })?;
    let patch = serde_json::json!({
        "metadata": {
            "annotations": annotations,
        }
    });

    store
        .merge_patch::<T>(&namespace, &object.name_any(), patch)
        .await
}

/// Kubernetes-backed [`ObjectStore`].
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    post_params: PostParams,
    patch_params: PatchParams,
}

impl Client {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            post_params: PostParams::default(),
            patch_params: PatchParams::default(),
        }
    }

    /// The underlying [`kube::Client`], e.g. for event recording.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    fn namespaced_api<T: StoreObject>(&self, namespace: &str) -> Api<T> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn object_namespace<T: StoreObject>(object: &T) -> Result<String> {
        object.namespace().context(MissingNamespaceSnafu {
            kind: kind_of::<T>(),
            name: object.name_any(),
        })
    }
}

#[async_trait]
impl ObjectStore for Client {
    async fn get<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        self.namespaced_api(namespace)
            .get_opt(name)
            .await
            .context(GetObjectSnafu {
                kind: kind_of::<T>(),
                namespace,
                name,
            })
    }

    async fn list<T: StoreObject>(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<T>> {
        let selector = label_selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&selector);

        let objects = self
            .namespaced_api(namespace)
            .list(&params)
            .await
            .context(ListObjectsSnafu {
                kind: kind_of::<T>(),
                namespace,
            })?;

        Ok(objects.items)
    }

    async fn create<T: StoreObject>(&self, object: &T) -> Result<()> {
        let namespace = Self::object_namespace(object)?;

        self.namespaced_api(&namespace)
            .create(&self.post_params, object)
            .await
            .map(|_| ())
            .context(CreateObjectSnafu {
                kind: kind_of::<T>(),
                namespace,
                name: object.name_any(),
            })
    }

    async fn update<T: StoreObject>(&self, object: &T) -> Result<()> {
        let namespace = Self::object_namespace(object)?;

        self.namespaced_api(&namespace)
            .replace(&object.name_any(), &self.post_params, object)
            .await
            .map(|_| ())
            .context(UpdateObjectSnafu {
                kind: kind_of::<T>(),
                namespace,
                name: object.name_any(),
            })
    }

    async fn delete<T: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .namespaced_api::<T>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(source).context(DeleteObjectSnafu {
                kind: kind_of::<T>(),
                namespace,
                name,
            }),
        }
    }

    async fn merge_patch<T: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        self.namespaced_api::<T>(namespace)
            .patch(name, &self.patch_params, &Patch::Merge(patch))
            .await
            .map(|_| ())
            .context(PatchObjectSnafu {
                kind: kind_of::<T>(),
                namespace,
                name,
            })
    }
}
