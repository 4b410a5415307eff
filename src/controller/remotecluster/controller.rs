//! Remote-cluster pass for a server cluster
//!
//! The reconciled cluster acts as the server of every cluster that declares it
//! in `spec.remoteClusters`, and each cluster it declares itself is treated as
//! an association too, so trust is set up in both directions. Every pass
//! computes the expected associations from scratch and removes whatever is
//! not expected anymore.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::apikey::{
    client_cluster_of, invalidate_api_key, is_managed_by_eck, reconcile_api_keys,
    ApiKeysContext, API_KEY_NAME_PREFIX,
};
use super::catalog::ApiKeyCatalog;
use super::pending::PendingChangesRegistry;
use super::remote_ca::{associated_remote_cas, create_or_update_remote_cas, delete_remote_cas};
use crate::controller::es_client::{CrossClusterApiKey, EsClient, EsClientProvider};
use crate::controller::secret_store::SecretStore;
use crate::crd::{ClusterKey, Elasticsearch, RemoteCluster};
use crate::error::{Error, Result};

/// Shared dependencies of a remote-cluster pass
pub struct RemoteClusterContext<'a> {
    pub store: &'a dyn SecretStore,
    pub registry: &'a PendingChangesRegistry,
    pub es_clients: &'a dyn EsClientProvider,
    pub cancel: &'a CancellationToken,
}

/// What a pass achieved, used for status reporting
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteClustersSummary {
    /// Clusters associated with the reconciled one
    pub associations: usize,
    /// Associations whose CA exchange waits for a transport certificate
    pub waiting_for_ca: Vec<ClusterKey>,
}

impl RemoteClustersSummary {
    pub fn is_ready(&self) -> bool {
        self.waiting_for_ca.is_empty()
    }
}

/// Clusters associated with `server`, each with the references that point at
/// `server`.
///
/// Clusters `server` declares itself map to the references they hold on
/// `server`, usually none. Undefined references are ignored.
pub fn get_expected_remote_clusters(
    server: &Elasticsearch,
    all: &[Elasticsearch],
) -> BTreeMap<ClusterKey, Vec<RemoteCluster>> {
    let server_key = server.key();
    let mut expected: BTreeMap<ClusterKey, Vec<RemoteCluster>> = BTreeMap::new();

    for remote in &server.spec.remote_clusters {
        if !remote.elasticsearch_ref.is_defined() {
            continue;
        }
        expected
            .entry(remote.elasticsearch_ref.with_default_namespace(&server_key.namespace))
            .or_default();
    }

    for es in all {
        let es_key = es.key();
        for remote in &es.spec.remote_clusters {
            if !remote.elasticsearch_ref.is_defined() {
                continue;
            }
            if remote.elasticsearch_ref.with_default_namespace(&es_key.namespace) == server_key {
                expected
                    .entry(es_key.clone())
                    .or_default()
                    .push(remote.clone());
            }
        }
    }
    expected
}

/// Aliases `server` may keep in its own catalog: those declared with an API
/// key towards an expected cluster
pub fn expected_aliases(
    server: &Elasticsearch,
    expected: &BTreeMap<ClusterKey, Vec<RemoteCluster>>,
) -> BTreeSet<String> {
    let namespace = server.key().namespace;
    server
        .spec
        .remote_clusters
        .iter()
        .filter(|r| r.api_key.is_some())
        .filter(|r| expected.contains_key(&r.elasticsearch_ref.with_default_namespace(&namespace)))
        .map(|r| r.name.clone())
        .collect()
}

/// Whether API keys can be reconciled between `server` and `client`
fn api_keys_enabled(server_supported: Option<bool>, client: &Elasticsearch) -> Result<bool> {
    let client_key = client.key();
    let Some(client_supported) = client
        .supports_remote_cluster_api_keys()
        .transpose()
        .map_err(Error::ValidationError)?
    else {
        info!(client = %client_key, "Client cluster version is not available in status yet, skipping API keys reconciliation");
        return Ok(false);
    };
    let Some(server_supported) = server_supported else {
        info!("Cluster version is not available in status yet, skipping API keys reconciliation");
        return Ok(false);
    };
    if server_supported && !client_supported {
        error!(
            client = %client_key,
            version = %client.spec.version,
            "Client cluster does not support remote cluster API keys"
        );
        return Ok(false);
    }
    Ok(server_supported)
}

/// Reconcile trust and cross-cluster API keys between `server` and every
/// associated cluster.
///
/// `all` is the current list of Elasticsearch resources. Failures on one
/// association do not stop the others; they are returned together once the
/// whole pass ran.
#[instrument(skip_all, fields(name = %server.name_any(), namespace = server.namespace()))]
pub async fn reconcile_remote_clusters(
    ctx: &RemoteClusterContext<'_>,
    server: &Elasticsearch,
    all: &[Elasticsearch],
) -> Result<RemoteClustersSummary> {
    let server_key = server.key();
    let expected = get_expected_remote_clusters(server, all);
    let mut stale_cas = associated_remote_cas(ctx.store, &server_key).await?;

    let server_supported = server
        .supports_remote_cluster_api_keys()
        .transpose()
        .map_err(Error::ValidationError)?;

    let mut es_client = None;
    let mut active_keys: Vec<CrossClusterApiKey> = Vec::new();
    if server_supported == Some(true) {
        let client = ctx.es_clients.client_for(server).await?;
        active_keys = client
            .get_cross_cluster_api_keys(ctx.cancel, &format!("{API_KEY_NAME_PREFIX}*"))
            .await?;
        es_client = Some(client);
    }

    let mut errors = Vec::new();
    let mut summary = RemoteClustersSummary {
        associations: expected.len(),
        ..Default::default()
    };
    let mut reconciled_clients = BTreeSet::new();

    for (client_key, refs) in &expected {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Some(client) = all.iter().find(|es| &es.key() == client_key) else {
            // the client is gone, only its keys in this cluster are left to clean up
            if let Some(es_client) = &es_client {
                reconciled_clients.insert(client_key.clone());
                if let Err(e) =
                    invalidate_client_keys(es_client.as_ref(), ctx.cancel, &active_keys, client_key)
                        .await
                {
                    errors.push(e);
                }
            }
            continue;
        };

        stale_cas.remove(client_key);
        match create_or_update_remote_cas(ctx.store, server, client).await {
            Ok(true) => {}
            Ok(false) => summary.waiting_for_ca.push(client_key.clone()),
            Err(e) => {
                errors.push(e);
                continue;
            }
        }

        let Some(es_client) = &es_client else {
            continue;
        };
        match api_keys_enabled(server_supported, client) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                errors.push(e);
                continue;
            }
        }

        reconciled_clients.insert(client_key.clone());
        let keys_ctx = ApiKeysContext {
            store: ctx.store,
            registry: ctx.registry,
            es_client: es_client.as_ref(),
            cancel: ctx.cancel,
            active_keys: &active_keys,
        };
        if let Err(e) = reconcile_api_keys(&keys_ctx, server, client, refs).await {
            errors.push(e);
        }
    }

    if let Some(es_client) = &es_client {
        // a failed client is missing from the reconciled set, its live keys must survive
        if errors.is_empty() {
            if let Err(e) = invalidate_orphan_keys(
                es_client.as_ref(),
                ctx.cancel,
                &active_keys,
                &reconciled_clients,
            )
            .await
            {
                errors.push(e);
            }
        }

        if let Err(e) = prune_own_catalog(ctx, server, &expected).await {
            errors.push(e);
        }
    }

    for remote in &stale_cas {
        debug!(remote = %remote, "Deleting remote CA");
        if let Err(e) = delete_remote_cas(ctx.store, &server_key, remote).await {
            errors.push(e);
        }
    }

    Error::aggregate(errors)?;
    Ok(summary)
}

/// Invalidate every key this cluster holds for a deleted client
async fn invalidate_client_keys(
    es_client: &dyn EsClient,
    cancel: &CancellationToken,
    active_keys: &[CrossClusterApiKey],
    client: &ClusterKey,
) -> Result<()> {
    let mut errors = Vec::new();
    for key in active_keys {
        if client_cluster_of(key).ok().as_ref() != Some(client) {
            continue;
        }
        info!(key = %key.name, client = %client, "Invalidating API key of deleted client cluster");
        if let Err(e) = invalidate_api_key(es_client, cancel, &key.name).await {
            errors.push(e);
        }
    }
    Error::aggregate(errors)
}

/// Invalidate keys whose client cluster was not reconciled in this pass
async fn invalidate_orphan_keys(
    es_client: &dyn EsClient,
    cancel: &CancellationToken,
    active_keys: &[CrossClusterApiKey],
    reconciled: &BTreeSet<ClusterKey>,
) -> Result<()> {
    let mut errors = Vec::new();
    for key in active_keys {
        if !is_managed_by_eck(key) {
            continue;
        }
        let client = match client_cluster_of(key) {
            Ok(client) => client,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if reconciled.contains(&client) {
            continue;
        }
        info!(key = %key.name, client = %client, "Invalidating API key which belongs to unknown cluster");
        if let Err(e) = invalidate_api_key(es_client, cancel, &key.name).await {
            errors.push(e);
        }
    }
    Error::aggregate(errors)
}

/// Drop aliases `server` no longer declares with an API key from its own catalog
async fn prune_own_catalog(
    ctx: &RemoteClusterContext<'_>,
    server: &Elasticsearch,
    expected: &BTreeMap<ClusterKey, Vec<RemoteCluster>>,
) -> Result<()> {
    let server_key = server.key();
    let keep = expected_aliases(server, expected);
    let pending = ctx.registry.get_or_create(&server_key);
    let mut catalog = ApiKeyCatalog::load(ctx.store, &server_key, pending).await?;

    let unexpected: Vec<String> = catalog
        .aliases()
        .keys()
        .filter(|alias| !keep.contains(*alias))
        .cloned()
        .collect();
    for alias in unexpected {
        info!(alias = %alias, "Removing unexpected remote API key");
        catalog.delete(&alias);
    }
    catalog.save(ctx.store, server).await
}
