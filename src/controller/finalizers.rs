//! Finalizer handling for Elasticsearch cleanup
//!
//! Owned Secrets are garbage collected by Kubernetes. The finalizer covers
//! what owner references cannot: the CA copies living next to other
//! clusters and the in-memory pending changes of the deleted cluster.

use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::publisher::delete_keystore_secret;
use super::remotecluster::{delete_all_remote_cas, PendingChangesRegistry};
use super::secret_store::SecretStore;
use crate::crd::Elasticsearch;
use crate::error::Result;

/// Finalizer name used to protect Elasticsearch resources
pub const ES_KEYSTORE_FINALIZER: &str = "keystore.k8s.elastic.co/finalizer";

/// Release everything held for a deleted cluster
#[instrument(skip(store, registry, es), fields(name = %es.name_any(), namespace = es.namespace()))]
pub async fn cleanup(
    store: &dyn SecretStore,
    registry: &PendingChangesRegistry,
    es: &Elasticsearch,
) -> Result<()> {
    let key = es.key();
    info!("Cleaning up keystore resources of {}", key);

    registry.forget_cluster(&key);
    #[cfg(feature = "metrics")]
    super::metrics::forget_cluster(&key.namespace, &key.name);

    if let Err(e) = delete_keystore_secret(store, es).await {
        warn!("Failed to delete keystore secret: {:?}", e);
    }
    delete_all_remote_cas(store, &key).await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::controller::remotecluster::remote_ca::remote_ca_labels;
    use crate::controller::secret_store::InMemorySecretStore;
    use crate::crd::{ClusterKey, ElasticsearchSpec};

    fn secret(ns: &str, name: &str, labels: BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(ES_KEYSTORE_FINALIZER, "keystore.k8s.elastic.co/finalizer");
    }

    #[tokio::test]
    async fn test_cleanup_releases_everything() {
        let store = InMemorySecretStore::new();
        let es1 = ClusterKey::new("ns1", "es1");
        let es2 = ClusterKey::new("ns2", "es2");
        store.insert(secret("ns1", "es1-es-keystore", BTreeMap::new()));
        store.insert(secret(
            "ns1",
            "es1-es-ns2-es2-remote-ca",
            remote_ca_labels("es1", &es2),
        ));
        store.insert(secret(
            "ns2",
            "es2-es-ns1-es1-remote-ca",
            remote_ca_labels("es2", &es1),
        ));
        store.insert(secret("ns2", "es2-es-keystore", BTreeMap::new()));

        let registry = PendingChangesRegistry::new();
        registry.get_or_create(&es1).delete_alias("rc1");

        let mut es = Elasticsearch::new("es1", ElasticsearchSpec::default());
        es.metadata.namespace = Some("ns1".to_string());
        cleanup(&store, &registry, &es).await.unwrap();

        assert!(registry.get(&es1).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.snapshot("ns2", "es2-es-keystore").is_some());
    }
}
