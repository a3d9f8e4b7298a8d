//! A client for the Dynatrace deployment API
//!
//! Only the calls needed to provision agents are implemented. Requests are
//! not retried; callers bound them with a deadline and try again on their
//! next pass.

use crate::{
    cluster::{self, Cluster},
    crd::DynaKube,
};
use kube::ResourceExt;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The operating system queried for unix agents.
pub const OS_UNIX: &str = "unix";

/// The zip package installer type.
pub const INSTALLER_TYPE_PAAS: &str = "paas";

/// The self-extracting shell installer type.
pub const INSTALLER_TYPE_PAAS_SH: &str = "paas-sh";

/// The flavor containing both glibc and musl binaries.
pub const FLAVOR_MULTIDISTRO: &str = "multidistro";

const PAAS_TOKEN: &str = "paasToken";

/// Errors from the Dynatrace API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request could not be sent or its response could not be read.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server responded with an error status.
    #[error("server responded with {status}: {message}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// The error message reported by the server.
        message: String,
    },

    /// The downloaded payload could not be written.
    #[error("failed to write download: {0}")]
    Io(#[from] std::io::Error),

    /// The tokens secret lacks a required key.
    #[error("secret {secret} is missing the {key} key")]
    MissingToken {
        /// The secret's name.
        secret: String,
        /// The missing key.
        key: &'static str,
    },

    /// The tokens secret could not be read.
    #[error("failed to read tokens: {0}")]
    Tokens(#[from] cluster::Error),
}

/// Describes the environment the API belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// The environment's tenant UUID.
    #[serde(rename = "tenantUUID")]
    pub tenant_uuid: String,
}

/// Calls made against a Dynatrace environment.
#[async_trait::async_trait]
pub trait DynatraceClient: Send + Sync {
    /// Returns the environment's connection info.
    async fn get_connection_info(&self) -> Result<ConnectionInfo, Error>;

    /// Returns the latest agent version for the given OS and installer type.
    async fn get_latest_agent_version(
        &self,
        os: &str,
        installer_type: &str,
    ) -> Result<String, Error>;

    /// Streams the latest agent installer into `writer`.
    async fn get_latest_agent(
        &self,
        os: &str,
        installer_type: &str,
        flavor: &str,
        arch: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), Error>;
}

/// Builds clients for a DynaKube.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Returns a client for the DynaKube's environment.
    async fn client(&self, dk: &DynaKube) -> Result<Arc<dyn DynatraceClient>, Error>;
}

/// A [`DynatraceClient`] over HTTPS.
#[derive(Clone, Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    api_url: String,
    paas_token: String,
}

/// Builds [`HttpClient`]s from the DynaKube's tokens secret.
pub struct SecretClientFactory {
    cluster: Arc<dyn Cluster>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ServerError,
}

#[derive(Deserialize)]
struct ServerError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestAgentVersion {
    latest_agent_version: String,
}

// === impl HttpClient ===

impl HttpClient {
    /// Creates a client for the API at `api_url`.
    pub fn new(
        api_url: &str,
        paas_token: String,
        skip_cert_check: bool,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_cert_check)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            paas_token,
        })
    }

    fn agent_url(&self, path: &str) -> String {
        format!(
            "{}/v1/deployment/installer/agent/{}",
            self.api_url,
            path.trim_start_matches('/')
        )
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, Error> {
        tracing::debug!(%url, "GET");
        let rsp = self
            .http
            .get(url)
            .query(query)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Api-Token {}", self.paas_token),
            )
            .send()
            .await?;

        let status = rsp.status();
        if status.is_success() {
            return Ok(rsp);
        }
        let body = rsp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        Err(Error::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait::async_trait]
impl DynatraceClient for HttpClient {
    async fn get_connection_info(&self) -> Result<ConnectionInfo, Error> {
        let rsp = self.get(&self.agent_url("connectioninfo"), &[]).await?;
        Ok(rsp.json().await?)
    }

    async fn get_latest_agent_version(
        &self,
        os: &str,
        installer_type: &str,
    ) -> Result<String, Error> {
        let url = self.agent_url(&format!("{os}/{installer_type}/latest/metainfo"));
        let rsp = self.get(&url, &[]).await?;
        let LatestAgentVersion {
            latest_agent_version,
        } = rsp.json().await?;
        Ok(latest_agent_version)
    }

    async fn get_latest_agent(
        &self,
        os: &str,
        installer_type: &str,
        flavor: &str,
        arch: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), Error> {
        let url = self.agent_url(&format!("{os}/{installer_type}/latest"));
        let mut rsp = self
            .get(
                &url,
                &[("flavor", flavor), ("arch", arch), ("bitness", "64")],
            )
            .await?;

        let mut written = 0;
        while let Some(chunk) = rsp.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len();
        }
        writer.flush().await?;
        tracing::debug!(bytes = written, "Downloaded agent");
        Ok(())
    }
}

// === impl SecretClientFactory ===

impl SecretClientFactory {
    /// Reads tokens through `cluster`; `timeout` bounds connection setup.
    pub fn new(cluster: Arc<dyn Cluster>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }
}

#[async_trait::async_trait]
impl ClientFactory for SecretClientFactory {
    async fn client(&self, dk: &DynaKube) -> Result<Arc<dyn DynatraceClient>, Error> {
        let namespace = dk.namespace().unwrap_or_default();
        let secret = dk.tokens_secret();
        let data = self.cluster.secret_data(&namespace, &secret).await?;
        let token = data
            .get(PAAS_TOKEN)
            .map(|t| String::from_utf8_lossy(t).trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingToken {
                secret,
                key: PAAS_TOKEN,
            })?;
        let client = HttpClient::new(
            &dk.spec.api_url,
            token,
            dk.spec.skip_cert_check,
            self.timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Serves a fixed environment.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub(crate) tenant_uuid: String,
        pub(crate) version: String,
        pub(crate) payload: Vec<u8>,
        pub(crate) fail: AtomicBool,
        pub(crate) downloads: AtomicUsize,
        /// How long each download takes.
        pub(crate) delay: Duration,
        /// The number of upcoming downloads served as garbage.
        pub(crate) corrupt: AtomicUsize,
    }

    impl FakeClient {
        fn check(&self) -> Result<(), Error> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl DynatraceClient for FakeClient {
        async fn get_connection_info(&self) -> Result<ConnectionInfo, Error> {
            self.check()?;
            Ok(ConnectionInfo {
                tenant_uuid: self.tenant_uuid.clone(),
            })
        }

        async fn get_latest_agent_version(&self, _: &str, _: &str) -> Result<String, Error> {
            self.check()?;
            Ok(self.version.clone())
        }

        async fn get_latest_agent(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            writer: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<(), Error> {
            self.check()?;
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let corrupt = self
                .corrupt
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let payload = if corrupt {
                &b"not a zip"[..]
            } else {
                &self.payload[..]
            };
            writer.write_all(payload).await?;
            writer.flush().await?;
            Ok(())
        }
    }

    /// Hands out the same client for every DynaKube.
    pub(crate) struct FakeFactory(pub(crate) Arc<FakeClient>);

    #[async_trait::async_trait]
    impl ClientFactory for FakeFactory {
        async fn client(&self, _: &DynaKube) -> Result<Arc<dyn DynatraceClient>, Error> {
            Ok(self.0.clone())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn agent_urls() {
        let client = HttpClient::new(
            "https://tenant.live.dynatrace.com/api/",
            "token".to_string(),
            false,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.agent_url("connectioninfo"),
            "https://tenant.live.dynatrace.com/api/v1/deployment/installer/agent/connectioninfo"
        );
        assert_eq!(
            client.agent_url(&format!("{OS_UNIX}/{INSTALLER_TYPE_PAAS}/latest/metainfo")),
            "https://tenant.live.dynatrace.com/api/v1/deployment/installer/agent/unix/paas/latest/metainfo"
        );
    }

    #[test]
    fn decodes_responses() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"tenantUUID":"abc123","tenantToken":"x"}"#).unwrap();
        assert_eq!(info.tenant_uuid, "abc123");

        let LatestAgentVersion {
            latest_agent_version,
        } = serde_json::from_str(r#"{"latestAgentVersion":"1.203.0.20200908-220956"}"#)
            .unwrap();
        assert_eq!(latest_agent_version, "1.203.0.20200908-220956");

        let ErrorBody { error } =
            serde_json::from_str(r#"{"error":{"code":401,"message":"Token Authentication failed"}}"#)
                .unwrap();
        assert_eq!(error.message, "Token Authentication failed");
    }
}
