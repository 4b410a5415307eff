//! Cross-cluster API keys minted in a server cluster for one client cluster

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::catalog::ApiKeyCatalog;
use super::pending::PendingChangesRegistry;
use crate::controller::es_client::{
    CrossClusterApiKey, CrossClusterApiKeyCreateRequest, CrossClusterApiKeyUpdateRequest, EsClient,
};
use crate::controller::secret_store::SecretStore;
use crate::crd::{ClusterKey, Elasticsearch, RemoteCluster, RemoteClusterApiKey};
use crate::error::{Error, Result};

pub const CONFIG_HASH_METADATA: &str = "elasticsearch.k8s.elastic.co/config-hash";
pub const NAME_METADATA: &str = "elasticsearch.k8s.elastic.co/name";
pub const NAMESPACE_METADATA: &str = "elasticsearch.k8s.elastic.co/namespace";
pub const UID_METADATA: &str = "elasticsearch.k8s.elastic.co/uid";
pub const MANAGED_BY_METADATA: &str = "elasticsearch.k8s.elastic.co/managed-by";
pub const MANAGED_BY_VALUE: &str = "eck";

/// Prefix shared by every key this controller creates
pub const API_KEY_NAME_PREFIX: &str = "eck-";

/// Name of the key minted for `alias` of `client`
pub fn api_key_name(client: &ClusterKey, alias: &str) -> String {
    format!(
        "{API_KEY_NAME_PREFIX}{}-{}-{}",
        client.namespace, client.name, alias
    )
}

/// Hex SHA-256 of the JSON form of an `apiKey` block
pub fn config_hash(api_key: &RemoteClusterApiKey) -> Result<String> {
    let json = serde_json::to_vec(api_key)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

/// Metadata attached to a key minted for `client`
pub fn metadata_for(client: &Elasticsearch, hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CONFIG_HASH_METADATA.to_string(), hash.to_string()),
        (NAME_METADATA.to_string(), client.name_any()),
        (
            NAMESPACE_METADATA.to_string(),
            client.namespace().unwrap_or_default(),
        ),
        (UID_METADATA.to_string(), client.uid().unwrap_or_default()),
        (MANAGED_BY_METADATA.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Whether a key was created by this controller
pub fn is_managed_by_eck(key: &CrossClusterApiKey) -> bool {
    key.metadata_str(MANAGED_BY_METADATA) == Some(MANAGED_BY_VALUE)
}

/// Client cluster a key was minted for, read from its metadata
pub fn client_cluster_of(key: &CrossClusterApiKey) -> Result<ClusterKey> {
    match (
        key.metadata_str(NAMESPACE_METADATA).filter(|s| !s.is_empty()),
        key.metadata_str(NAME_METADATA).filter(|s| !s.is_empty()),
    ) {
        (Some(namespace), Some(name)) => Ok(ClusterKey::new(namespace, name)),
        _ => Err(Error::ValidationError(format!(
            "API key {} ({}) has no client cluster metadata",
            key.name, key.id
        ))),
    }
}

fn record_operation(operation: &str) {
    #[cfg(feature = "metrics")]
    crate::controller::metrics::inc_api_key_operations(operation);
    #[cfg(not(feature = "metrics"))]
    let _ = operation;
}

/// Invalidate one key in the server cluster
pub async fn invalidate_api_key(
    es_client: &dyn EsClient,
    cancel: &CancellationToken,
    name: &str,
) -> Result<()> {
    es_client
        .invalidate_cross_cluster_api_key(cancel, name)
        .await?;
    record_operation("invalidate");
    Ok(())
}

/// Everything needed to reconcile the keys of one client cluster
pub struct ApiKeysContext<'a> {
    pub store: &'a dyn SecretStore,
    pub registry: &'a PendingChangesRegistry,
    pub es_client: &'a dyn EsClient,
    pub cancel: &'a CancellationToken,
    /// Active `eck-*` keys of the server cluster
    pub active_keys: &'a [CrossClusterApiKey],
}

/// Create, update and invalidate the keys of `client` in `server`, then save
/// the client's catalog.
///
/// `refs` are the remote cluster references of `client` pointing at `server`.
/// A failing alias does not stop the others; all errors are returned together.
#[instrument(skip_all, fields(server = %server.key(), client = %client.key()))]
pub async fn reconcile_api_keys(
    ctx: &ApiKeysContext<'_>,
    server: &Elasticsearch,
    client: &Elasticsearch,
    refs: &[RemoteCluster],
) -> Result<()> {
    let (server_key, client_key) = (server.key(), client.key());
    let pending = ctx.registry.get_or_create(&client_key);
    let mut catalog = ApiKeyCatalog::load(ctx.store, &client_key, pending).await?;

    let active_by_name: BTreeMap<&str, &CrossClusterApiKey> = ctx
        .active_keys
        .iter()
        .map(|k| (k.name.as_str(), k))
        .collect();

    let mut errors = Vec::new();
    let mut expected_keys = BTreeSet::new();
    let mut expected_aliases = BTreeSet::new();

    for remote in refs {
        let alias = remote.name.as_str();
        let key_name = api_key_name(&client_key, alias);
        expected_keys.insert(key_name.clone());
        expected_aliases.insert(alias.to_string());

        let Some(api_key) = &remote.api_key else {
            if active_by_name.contains_key(key_name.as_str()) {
                info!(alias, "Invalidating API key as remote cluster is not configured to use it");
                if let Err(e) = invalidate_api_key(ctx.es_client, ctx.cancel, &key_name).await {
                    errors.push(e);
                }
            }
            continue;
        };

        let outcome = match active_by_name.get(key_name.as_str()) {
            None => {
                create_api_key(ctx, &mut catalog, &server_key, client, alias, &key_name, api_key)
                    .await
            }
            Some(active) => {
                maybe_update_api_key(ctx, &catalog, client, alias, active, api_key).await
            }
        };
        if let Err(e) = outcome {
            errors.push(e);
        }
    }

    // keys of this client that are no longer declared
    for key in ctx.active_keys {
        let belongs_to_client = client_cluster_of(key).ok().as_ref() == Some(&client_key);
        if belongs_to_client && !expected_keys.contains(&key.name) {
            info!(key = %key.name, "Invalidating unexpected API key");
            if let Err(e) = invalidate_api_key(ctx.es_client, ctx.cancel, &key.name).await {
                errors.push(e);
            }
        }
    }

    for alias in catalog.for_cluster(&server_key.namespace, &server_key.name) {
        if !expected_aliases.contains(&alias) {
            info!(alias = %alias, "Removing API key from catalog");
            catalog.delete(&alias);
        }
    }

    if let Err(e) = catalog.save(ctx.store, client).await {
        errors.push(e);
    }
    Error::aggregate(errors)
}

async fn create_api_key(
    ctx: &ApiKeysContext<'_>,
    catalog: &mut ApiKeyCatalog,
    server_key: &ClusterKey,
    client: &Elasticsearch,
    alias: &str,
    key_name: &str,
    api_key: &RemoteClusterApiKey,
) -> Result<()> {
    info!(alias, key = key_name, "Creating API key");
    let request = CrossClusterApiKeyCreateRequest {
        name: key_name.to_string(),
        update: CrossClusterApiKeyUpdateRequest {
            access: api_key.access.clone(),
            metadata: metadata_for(client, &config_hash(api_key)?),
        },
    };
    let created = ctx
        .es_client
        .create_cross_cluster_api_key(ctx.cancel, &request)
        .await?;
    record_operation("create");
    catalog.update(server_key, alias, &created.id, &created.encoded);
    Ok(())
}

async fn maybe_update_api_key(
    ctx: &ApiKeysContext<'_>,
    catalog: &ApiKeyCatalog,
    client: &Elasticsearch,
    alias: &str,
    active: &CrossClusterApiKey,
    api_key: &RemoteClusterApiKey,
) -> Result<()> {
    if catalog.key_id_for(alias) != Some(active.id.as_str()) {
        // the encoded key is lost, a new one is created on the next pass
        info!(alias, key = %active.name, "Invalidating API key as it does not match the one in the catalog");
        invalidate_api_key(ctx.es_client, ctx.cancel, &active.name).await?;
        return Err(Error::ConflictError(format!(
            "key id for alias {} {} ({}) does not match the one stored in the catalog of {}",
            alias,
            active.name,
            active.id,
            client.key()
        )));
    }

    let expected_hash = config_hash(api_key)?;
    if active.metadata_str(CONFIG_HASH_METADATA) != Some(expected_hash.as_str()) {
        info!(alias, "Updating API key");
        let request = CrossClusterApiKeyUpdateRequest {
            access: api_key.access.clone(),
            metadata: metadata_for(client, &expected_hash),
        };
        ctx.es_client
            .update_cross_cluster_api_key(ctx.cancel, &active.id, &request)
            .await?;
        record_operation("update");
    }
    Ok(())
}
