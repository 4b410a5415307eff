//! Transport CA exchange between two associated clusters
//!
//! Each side of an association gets a copy of the other side's transport CA
//! in `<owner>-es-<remote ns>-<remote name>-remote-ca`, so both clusters trust
//! each other's nodes.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::resources::{
    owner_reference, remote_ca_secret_name, transport_certs_public_secret_name, CA_FILE_NAME,
    CLUSTER_NAME_LABEL, REMOTE_CLUSTER_NAMESPACE_LABEL, REMOTE_CLUSTER_NAME_LABEL, TYPE_LABEL,
};
use crate::controller::secret_store::{reconcile_secret, DeletePreconditions, SecretStore};
use crate::crd::{ClusterKey, Elasticsearch};
use crate::error::Result;

/// Value of the type label on remote CA Secrets
pub const REMOTE_CA_TYPE: &str = "remote-ca";

/// Labels of the remote CA Secret owned by `owner_name` for `remote`
pub fn remote_ca_labels(owner_name: &str, remote: &ClusterKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TYPE_LABEL.to_string(), REMOTE_CA_TYPE.to_string()),
        (CLUSTER_NAME_LABEL.to_string(), owner_name.to_string()),
        (
            REMOTE_CLUSTER_NAMESPACE_LABEL.to_string(),
            remote.namespace.clone(),
        ),
        (REMOTE_CLUSTER_NAME_LABEL.to_string(), remote.name.clone()),
    ])
}

/// Clusters `es` currently exchanges CAs with, in either direction
pub async fn associated_remote_cas(
    store: &dyn SecretStore,
    es: &ClusterKey,
) -> Result<BTreeSet<ClusterKey>> {
    let mut associated = BTreeSet::new();

    // CAs of other clusters copied next to `es`
    let local = BTreeMap::from([
        (TYPE_LABEL.to_string(), REMOTE_CA_TYPE.to_string()),
        (CLUSTER_NAME_LABEL.to_string(), es.name.clone()),
    ]);
    for secret in store.list(Some(&es.namespace), &local).await? {
        let labels = secret.labels();
        if let (Some(ns), Some(name)) = (
            labels.get(REMOTE_CLUSTER_NAMESPACE_LABEL),
            labels.get(REMOTE_CLUSTER_NAME_LABEL),
        ) {
            associated.insert(ClusterKey::new(ns, name));
        }
    }

    // CA of `es` copied next to other clusters
    let remote = BTreeMap::from([
        (TYPE_LABEL.to_string(), REMOTE_CA_TYPE.to_string()),
        (
            REMOTE_CLUSTER_NAMESPACE_LABEL.to_string(),
            es.namespace.clone(),
        ),
        (REMOTE_CLUSTER_NAME_LABEL.to_string(), es.name.clone()),
    ]);
    for secret in store.list(None, &remote).await? {
        if let (Some(ns), Some(name)) = (secret.namespace(), secret.labels().get(CLUSTER_NAME_LABEL)) {
            associated.insert(ClusterKey::new(&ns, name));
        }
    }

    Ok(associated)
}

async fn transport_ca(store: &dyn SecretStore, cluster: &ClusterKey) -> Result<Option<Vec<u8>>> {
    let secret = store
        .get(
            &cluster.namespace,
            &transport_certs_public_secret_name(&cluster.name),
        )
        .await?;
    Ok(secret
        .and_then(|s| s.data)
        .and_then(|mut d| d.remove(CA_FILE_NAME))
        .map(|ca| ca.0)
        .filter(|ca| !ca.is_empty()))
}

/// Copy the CA of `remote` next to `owner`
pub async fn reconcile_remote_ca(
    store: &dyn SecretStore,
    owner: &Elasticsearch,
    remote: &ClusterKey,
    ca: Vec<u8>,
) -> Result<()> {
    let owner_key = owner.key();
    let expected = Secret {
        metadata: ObjectMeta {
            name: Some(remote_ca_secret_name(&owner_key.name, remote)),
            namespace: Some(owner_key.namespace),
            labels: Some(remote_ca_labels(&owner_key.name, remote)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CA_FILE_NAME.to_string(), ByteString(ca))])),
        ..Default::default()
    };
    reconcile_secret(store, expected, Some(owner_reference(owner))).await?;
    Ok(())
}

/// Set up mutual trust between `local` and `remote`.
///
/// Returns `false` when one of the transport CAs is not published yet, the
/// exchange is retried on a later pass.
pub async fn create_or_update_remote_cas(
    store: &dyn SecretStore,
    local: &Elasticsearch,
    remote: &Elasticsearch,
) -> Result<bool> {
    let (local_key, remote_key) = (local.key(), remote.key());

    let Some(local_ca) = transport_ca(store, &local_key).await? else {
        info!("Cannot find CA certificate of cluster {}", local_key);
        return Ok(false);
    };
    let Some(remote_ca) = transport_ca(store, &remote_key).await? else {
        info!("Cannot find CA certificate of cluster {}", remote_key);
        return Ok(false);
    };

    debug!("Exchanging transport CAs between {} and {}", local_key, remote_key);
    reconcile_remote_ca(store, local, &remote_key, remote_ca).await?;
    reconcile_remote_ca(store, remote, &local_key, local_ca).await?;
    Ok(true)
}

/// Remove the CA copies in both directions
pub async fn delete_remote_cas(
    store: &dyn SecretStore,
    local: &ClusterKey,
    remote: &ClusterKey,
) -> Result<()> {
    store
        .delete(
            &local.namespace,
            &remote_ca_secret_name(&local.name, remote),
            DeletePreconditions::default(),
        )
        .await?;
    store
        .delete(
            &remote.namespace,
            &remote_ca_secret_name(&remote.name, local),
            DeletePreconditions::default(),
        )
        .await
}

/// Remove every CA exchange `es` takes part in
pub async fn delete_all_remote_cas(store: &dyn SecretStore, es: &ClusterKey) -> Result<()> {
    let mut errors = Vec::new();
    for remote in associated_remote_cas(store, es).await? {
        debug!("Deleting remote CAs between {} and {}", es, remote);
        if let Err(e) = delete_remote_cas(store, es, &remote).await {
            errors.push(e);
        }
    }
    crate::error::Error::aggregate(errors)
}
