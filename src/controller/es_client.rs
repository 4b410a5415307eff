//! Elasticsearch REST client
//!
//! Covers the secure settings reload endpoint and the cross-cluster API key
//! endpoints. Every request is raced against the reconciliation's
//! cancellation token.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::resources::{
    es_http_url, http_certs_public_secret_name, internal_users_secret_name, CA_FILE_NAME,
    INTERNAL_USER,
};
use super::secret_store::SecretStore;
use crate::crd::{CrossClusterAccess, Elasticsearch};
use crate::error::{Error, Result};

/// Answer of `POST /_nodes/reload_secure_settings`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ReloadSecureSettingsResponse {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub nodes: HashMap<String, NodeReload>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct NodeReload {
    #[serde(default)]
    pub name: String,
    /// Digest of the keystore the node loaded, absent on older versions
    #[serde(default)]
    pub keystore_digest: Option<String>,
    #[serde(default)]
    pub reload_exception: Option<serde_json::Value>,
}

/// An active API key as returned by `GET /_security/api_key`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CrossClusterApiKey {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CrossClusterApiKey {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ApiKeyList {
    #[serde(default)]
    api_keys: Vec<CrossClusterApiKey>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CrossClusterApiKeyUpdateRequest {
    pub access: CrossClusterAccess,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CrossClusterApiKeyCreateRequest {
    pub name: String,
    #[serde(flatten)]
    pub update: CrossClusterApiKeyUpdateRequest,
}

#[derive(Clone, Deserialize, PartialEq)]
pub struct CrossClusterApiKeyCreateResponse {
    pub id: String,
    pub name: String,
    /// Base64 `id:api_key`, the credential stored in the client keystore
    pub encoded: String,
}

impl std::fmt::Debug for CrossClusterApiKeyCreateResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossClusterApiKeyCreateResponse")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait EsClient: Send + Sync {
    async fn reload_secure_settings(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReloadSecureSettingsResponse>;

    /// Active API keys whose name matches `pattern` (wildcards allowed)
    async fn get_cross_cluster_api_keys(
        &self,
        cancel: &CancellationToken,
        pattern: &str,
    ) -> Result<Vec<CrossClusterApiKey>>;

    async fn create_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        request: &CrossClusterApiKeyCreateRequest,
    ) -> Result<CrossClusterApiKeyCreateResponse>;

    async fn update_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        id: &str,
        request: &CrossClusterApiKeyUpdateRequest,
    ) -> Result<()>;

    /// Invalidate the API key(s) named `name`
    async fn invalidate_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<()>;
}

/// Resolve `fut` unless `cancel` fires first
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Connection settings for one Elasticsearch cluster
#[derive(Clone)]
pub struct EsClientConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub ca_pem: Option<Vec<u8>>,
    pub timeout: Duration,
    pub insecure_skip_tls_verify: bool,
}

impl std::fmt::Debug for EsClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsClientConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// [`EsClient`] speaking HTTP to the cluster service
#[derive(Clone, Debug)]
pub struct HttpEsClient {
    http: reqwest::Client,
    config: EsClientConfig,
}

impl HttpEsClient {
    pub fn new(config: EsClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(pem) = &config.ca_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(pem)?);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(Error::HttpError)?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: RequestBuilder,
    ) -> Result<T> {
        cancellable(cancel, async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::EsApiError {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response.json::<T>().await?)
        })
        .await
    }
}

#[async_trait]
impl EsClient for HttpEsClient {
    async fn reload_secure_settings(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReloadSecureSettingsResponse> {
        debug!("Reloading secure settings on {}", self.config.url);
        self.send(
            cancel,
            self.request(Method::POST, "/_nodes/reload_secure_settings"),
        )
        .await
    }

    async fn get_cross_cluster_api_keys(
        &self,
        cancel: &CancellationToken,
        pattern: &str,
    ) -> Result<Vec<CrossClusterApiKey>> {
        let request = self
            .request(Method::GET, "/_security/api_key")
            .query(&[("active_only", "true"), ("name", pattern)]);
        let list: ApiKeyList = self.send(cancel, request).await?;
        Ok(list.api_keys)
    }

    async fn create_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        request: &CrossClusterApiKeyCreateRequest,
    ) -> Result<CrossClusterApiKeyCreateResponse> {
        let builder = self
            .request(Method::POST, "/_security/cross_cluster/api_key")
            .json(request);
        self.send(cancel, builder).await
    }

    async fn update_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        id: &str,
        request: &CrossClusterApiKeyUpdateRequest,
    ) -> Result<()> {
        let builder = self
            .request(
                Method::PUT,
                &format!("/_security/cross_cluster/api_key/{id}"),
            )
            .json(request);
        let _: serde_json::Value = self.send(cancel, builder).await?;
        Ok(())
    }

    async fn invalidate_cross_cluster_api_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<()> {
        let builder = self
            .request(Method::DELETE, "/_security/api_key")
            .json(&serde_json::json!({ "name": name }));
        let _: serde_json::Value = self.send(cancel, builder).await?;
        Ok(())
    }
}

/// Builds clients for the clusters being reconciled
#[async_trait]
pub trait EsClientProvider: Send + Sync {
    async fn client_for(&self, es: &Elasticsearch) -> Result<Arc<dyn EsClient>>;
}

/// Builds [`HttpEsClient`]s from the credentials and CA the main operator publishes
pub struct HttpEsClientProvider {
    store: Arc<dyn SecretStore>,
    timeout: Duration,
    insecure_skip_tls_verify: bool,
}

impl HttpEsClientProvider {
    pub fn new(
        store: Arc<dyn SecretStore>,
        timeout: Duration,
        insecure_skip_tls_verify: bool,
    ) -> Self {
        Self {
            store,
            timeout,
            insecure_skip_tls_verify,
        }
    }
}

#[async_trait]
impl EsClientProvider for HttpEsClientProvider {
    async fn client_for(&self, es: &Elasticsearch) -> Result<Arc<dyn EsClient>> {
        let key = es.key();

        let users_secret = internal_users_secret_name(&key.name);
        let password = self
            .store
            .get(&key.namespace, &users_secret)
            .await?
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(INTERNAL_USER))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "password of {INTERNAL_USER} in {}/{users_secret}",
                    key.namespace
                ))
            })?;
        let password = String::from_utf8(password.0)
            .map_err(|e| Error::ConfigError(format!("invalid {INTERNAL_USER} password: {e}")))?;

        let ca_pem = self
            .store
            .get(&key.namespace, &http_certs_public_secret_name(&key.name))
            .await?
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(CA_FILE_NAME))
            .map(|ca| ca.0);

        let client = HttpEsClient::new(EsClientConfig {
            url: es_http_url(&key),
            username: INTERNAL_USER.to_string(),
            password,
            ca_pem,
            timeout: self.timeout,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        })?;
        Ok(Arc::new(client))
    }
}
