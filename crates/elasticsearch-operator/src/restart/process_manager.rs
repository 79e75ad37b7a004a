//! HTTPS client for the per-node process manager.
//!
//! Each node container runs a small process manager next to Elasticsearch,
//! exposing `/start`, `/stop` and `/status` over TLS. The client trusts
//! the cluster's HTTP CA, read fresh from the owner's public-certs secret
//! on construction, so certificate rotation needs no cache invalidation.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use reqwest::StatusCode;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    client::{self, ObjectStore},
    labels,
    names::{self, Namer},
    pods,
};

/// Port the process manager listens on.
pub const PROCESS_MANAGER_PORT: u16 = 8080;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object store access failed"))]
    Store { source: client::Error },

    #[snafu(display("public certs secret {secret} not found"))]
    MissingPublicCerts { secret: String },

    #[snafu(display("public certs secret {secret} has no {key} entry", key = labels::CA_CERT_KEY))]
    MissingCaEntry { secret: String },

    #[snafu(display("failed to parse the HTTP CA certificate"))]
    ParseCaCertificate { source: reqwest::Error },

    #[snafu(display("failed to build HTTPS client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("pod {pod} does not yet have an IP"))]
    MissingPodIp { pod: String },

    #[snafu(display("process manager request to {url} failed"))]
    Request { source: reqwest::Error, url: String },

    #[snafu(display("process manager request to {url} returned status {status}"))]
    UnexpectedStatus { url: String, status: StatusCode },

    #[snafu(display("failed to parse process status from {url}"))]
    ParseStatus { source: reqwest::Error, url: String },
}

/// State of the managed Elasticsearch process.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
}

/// Start/stop/status operations against one pod's process manager.
#[async_trait]
pub trait ProcessManagerClient: Send + Sync {
    async fn start(&self, pod: &Pod) -> Result<ProcessStatus>;
    async fn stop(&self, pod: &Pod) -> Result<ProcessStatus>;
    async fn status(&self, pod: &Pod) -> Result<ProcessStatus>;
}

/// HTTPS implementation of [`ProcessManagerClient`].
pub struct HttpProcessManager {
    http: reqwest::Client,
    port: u16,
}

impl HttpProcessManager {
    /// Builds a client for one cluster, trusting its HTTP CA as published
    /// in the `<owner>-http-certs-public` secret.
    pub async fn for_cluster<S>(
        store: &S,
        namer: &Namer,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Self>
    where
        S: ObjectStore,
    {
        let secret_name = names::http_public_certs_secret_name(namer, cluster_name);
        let secret: Secret = store
            .get(namespace, &secret_name)
            .await
            .context(StoreSnafu)?
            .context(MissingPublicCertsSnafu {
                secret: secret_name.as_str(),
            })?;

        let ca_pem = secret
            .data
            .as_ref()
            .and_then(|data| data.get(labels::CA_CERT_KEY))
            .context(MissingCaEntrySnafu {
                secret: secret_name.as_str(),
            })?;

        let certificate =
            reqwest::Certificate::from_pem(&ca_pem.0).context(ParseCaCertificateSnafu)?;
        let http = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildHttpClientSnafu)?;

        Ok(Self {
            http,
            port: PROCESS_MANAGER_PORT,
        })
    }

    async fn call(&self, pod: &Pod, action: &str) -> Result<ProcessStatus> {
        let ip = pods::pod_ip(pod).context(MissingPodIpSnafu {
            pod: pod.name_any(),
        })?;
        let url = format!("https://{ip}:{port}/{action}", port = self.port);

        debug!(%url, "calling process manager");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.as_str() })?;

        ensure!(
            response.status() == StatusCode::OK,
            UnexpectedStatusSnafu {
                url: url.as_str(),
                status: response.status(),
            }
        );

        response
            .json::<ProcessStatus>()
            .await
            .context(ParseStatusSnafu { url: url.as_str() })
    }
}

#[async_trait]
impl ProcessManagerClient for HttpProcessManager {
    async fn start(&self, pod: &Pod) -> Result<ProcessStatus> {
        self.call(pod, "start").await
    }

    async fn stop(&self, pod: &Pod) -> Result<ProcessStatus> {
        self.call(pod, "stop").await
    }

    async fn status(&self, pod: &Pod) -> Result<ProcessStatus> {
        self.call(pod, "status").await
    }
}
