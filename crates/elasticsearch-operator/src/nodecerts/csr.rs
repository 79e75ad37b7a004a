//! Retrieval of certificate signing requests from node init containers.
//!
//! Each node pod runs a `cert-initializer` init container serving its raw
//! DER CSR over plain HTTP on the pod network. The operator polls that
//! endpoint; TLS bootstrapping happens precisely because this exchange
//! needs no certificates yet.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use reqwest::StatusCode;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

use crate::pods;

/// Port the `cert-initializer` init container listens on.
pub const CSR_PORT: u16 = 8001;

/// Route serving the raw DER CSR.
pub const CSR_ROUTE: &str = "/csr";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pod {pod} does not yet have an IP"))]
    MissingPodIp { pod: String },

    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("CSR request to {url} failed"))]
    RequestCsr { source: reqwest::Error, url: String },

    #[snafu(display("CSR request to {url} returned status {status}"))]
    UnexpectedStatus { url: String, status: StatusCode },
}

/// Capability to fetch a pod's current CSR. An empty response means the
/// init container has nothing new to offer.
#[async_trait]
pub trait CsrClient: Send + Sync {
    async fn retrieve_candidate_csr(&self, pod: &Pod) -> Result<Vec<u8>>;
}

/// HTTP implementation of [`CsrClient`].
pub struct HttpCsrClient {
    http: reqwest::Client,
    port: u16,
}

impl HttpCsrClient {
    pub fn new() -> Result<Self> {
        Self::with_port(CSR_PORT)
    }

    pub fn with_port(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildHttpClientSnafu)?;

        Ok(Self { http, port })
    }
}

#[async_trait]
impl CsrClient for HttpCsrClient {
    async fn retrieve_candidate_csr(&self, pod: &Pod) -> Result<Vec<u8>> {
        let ip = pods::pod_ip(pod).context(MissingPodIpSnafu {
            pod: pod.name_any(),
        })?;
        let url = format!("http://{ip}:{port}{CSR_ROUTE}", port = self.port);

        debug!(%url, "requesting CSR from init container");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context(RequestCsrSnafu { url: url.as_str() })?;

        ensure!(
            response.status() == StatusCode::OK,
            UnexpectedStatusSnafu {
                url: url.as_str(),
                status: response.status(),
            }
        );

        match response.bytes().await {
            Ok(bytes) => Ok(bytes.to_vec()),
            // a connection torn down before the body completes counts as
            // "nothing to offer yet"
            Err(_) => Ok(Vec::new()),
        }
    }
}
