//! Cross-cluster API key catalog of a client cluster
//!
//! Stored in `<es>-es-remote-api-keys`:
//!
//! * annotation `elasticsearch.k8s.elastic.co/remote-cluster-api-keys` maps each
//!   alias to the server cluster and the id of the key minted there, as JSON
//! * data key `cluster.remote.<alias>.credentials` holds the encoded key
//!
//! The credentials are merged into the client's keystore, see
//! [`crate::controller::secure_settings`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::pending::{PendingChange, PendingChanges};
use crate::controller::resources::{
    cluster_labels, owner_reference, remote_api_keys_secret_name, CREDENTIALS_LABEL, TYPE_LABEL,
};
use crate::controller::secret_store::{DeletePreconditions, SecretStore};
use crate::crd::{ClusterKey, Elasticsearch};
use crate::error::Result;

pub const ALIASES_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/remote-cluster-api-keys";

/// Value of the type label on catalog Secrets
pub const REMOTE_CLUSTER_API_KEYS_TYPE: &str = "remote-cluster-api-keys";

static CREDENTIALS_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^cluster\.remote\.([A-Za-z0-9_-]+)\.credentials$").expect("valid regex")
});

/// Keystore setting holding the encoded key of `alias`
pub fn credentials_key(alias: &str) -> String {
    format!("cluster.remote.{alias}.credentials")
}

/// Alias embedded in a `cluster.remote.<alias>.credentials` setting name
pub fn alias_from_credentials_key(key: &str) -> Option<&str> {
    CREDENTIALS_KEY
        .captures(key)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Server cluster and key id behind an alias
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasValue {
    pub namespace: String,
    pub name: String,
    pub id: String,
}

/// In-memory view of a client cluster's catalog, including changes not yet
/// visible in the Secret
pub struct ApiKeyCatalog {
    owner: ClusterKey,
    aliases: BTreeMap<String, AliasValue>,
    encoded_keys: BTreeMap<String, String>,
    /// Secret as loaded or last saved, `None` if it did not exist
    loaded: Option<Secret>,
    pending: Arc<PendingChanges>,
}

impl std::fmt::Debug for ApiKeyCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyCatalog")
            .field("owner", &self.owner.to_string())
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

impl ApiKeyCatalog {
    /// Empty catalog, as if no Secret existed
    pub fn empty(owner: ClusterKey, pending: Arc<PendingChanges>) -> Self {
        Self {
            owner,
            aliases: BTreeMap::new(),
            encoded_keys: BTreeMap::new(),
            loaded: None,
            pending,
        }
    }

    /// Read the catalog of `owner` and overlay its pending changes
    pub async fn load(
        store: &dyn SecretStore,
        owner: &ClusterKey,
        pending: Arc<PendingChanges>,
    ) -> Result<Self> {
        let name = remote_api_keys_secret_name(&owner.name);
        let Some(secret) = store.get(&owner.namespace, &name).await? else {
            debug!("No API key catalog found for {}", owner);
            return Ok(Self::empty(owner.clone(), pending).with_pending_changes());
        };

        let aliases: BTreeMap<String, AliasValue> =
            match secret.annotations().get(ALIASES_ANNOTATION) {
                Some(raw) => serde_json::from_str(raw)?,
                None => BTreeMap::new(),
            };

        let mut encoded_keys = BTreeMap::new();
        for (setting, value) in secret.data.iter().flatten() {
            let Some(alias) = alias_from_credentials_key(setting) else {
                debug!("Unknown remote cluster credential setting: {}", setting);
                continue;
            };
            encoded_keys.insert(
                alias.to_string(),
                String::from_utf8_lossy(&value.0).into_owned(),
            );
        }

        Ok(Self {
            owner: owner.clone(),
            aliases,
            encoded_keys,
            loaded: Some(secret),
            pending,
        }
        .with_pending_changes())
    }

    /// Reconcile recorded intent with what was loaded: observed changes are
    /// forgotten, the others are applied to this view
    fn with_pending_changes(mut self) -> Self {
        let (mut adds, mut deletions) = (0, 0);
        for change in self.pending.get() {
            match change {
                PendingChange::Delete { alias } => {
                    if self.key_id_for(&alias).is_none() {
                        info!("Deletion of alias {} observed in API key catalog", alias);
                        self.pending.forget_delete_alias(&alias);
                        continue;
                    }
                    deletions += 1;
                    self.remove(&alias);
                }
                PendingChange::Add {
                    remote,
                    alias,
                    key_id,
                    encoded,
                } => {
                    if self.key_id_for(&alias) == Some(key_id.as_str()) {
                        info!("Key {} for alias {} observed in API key catalog", key_id, alias);
                        self.pending.forget_add_key(&alias, &key_id);
                        continue;
                    }
                    adds += 1;
                    self.insert(&remote, &alias, &key_id, &encoded);
                }
            }
        }
        if adds > 0 || deletions > 0 {
            info!(
                add = adds,
                deletion = deletions,
                "Pending changes in API key catalog of {}",
                self.owner
            );
        }
        self
    }

    /// Record a key minted in `remote` for `alias`
    pub fn update(&mut self, remote: &ClusterKey, alias: &str, key_id: &str, encoded: &str) {
        self.pending.add_key(remote, alias, key_id, encoded);
        self.insert(remote, alias, key_id, encoded);
    }

    pub fn delete(&mut self, alias: &str) {
        self.pending.delete_alias(alias);
        self.remove(alias);
    }

    fn insert(&mut self, remote: &ClusterKey, alias: &str, key_id: &str, encoded: &str) {
        self.aliases.insert(
            alias.to_string(),
            AliasValue {
                namespace: remote.namespace.clone(),
                name: remote.name.clone(),
                id: key_id.to_string(),
            },
        );
        self.encoded_keys
            .insert(alias.to_string(), encoded.to_string());
    }

    fn remove(&mut self, alias: &str) {
        self.aliases.remove(alias);
        self.encoded_keys.remove(alias);
    }

    pub fn aliases(&self) -> &BTreeMap<String, AliasValue> {
        &self.aliases
    }

    pub fn key_id_for(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(|v| v.id.as_str())
    }

    /// Aliases pointing at the server cluster `namespace/name`
    pub fn for_cluster(&self, namespace: &str, name: &str) -> BTreeSet<String> {
        self.aliases
            .iter()
            .filter(|(_, v)| v.namespace == namespace && v.name == name)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn expected_data(&self) -> BTreeMap<String, ByteString> {
        // credentials without an alias entry are dropped
        self.aliases
            .keys()
            .filter_map(|alias| {
                self.encoded_keys.get(alias).map(|encoded| {
                    (
                        credentials_key(alias),
                        ByteString(encoded.clone().into_bytes()),
                    )
                })
            })
            .collect()
    }

    fn expected_labels(&self) -> BTreeMap<String, String> {
        let mut labels = cluster_labels(&self.owner.name);
        labels.insert(CREDENTIALS_LABEL.to_string(), "true".to_string());
        labels.insert(
            TYPE_LABEL.to_string(),
            REMOTE_CLUSTER_API_KEYS_TYPE.to_string(),
        );
        labels
    }

    /// Persist this view.
    ///
    /// The resource version and UID captured at load time guard the write, so
    /// a catalog modified in between makes the save fail with a conflict. An
    /// empty catalog deletes the Secret.
    pub async fn save(&mut self, store: &dyn SecretStore, owner: &Elasticsearch) -> Result<()> {
        let name = remote_api_keys_secret_name(&self.owner.name);

        if self.is_empty() {
            let loaded_meta = self.loaded.as_ref().map(|s| &s.metadata);
            let preconditions = DeletePreconditions {
                uid: loaded_meta.and_then(|m| m.uid.clone()),
                resource_version: loaded_meta.and_then(|m| m.resource_version.clone()),
            };
            if self.loaded.is_some() {
                info!("Deleting empty API key catalog {}/{}", self.owner.namespace, name);
            }
            store
                .delete(&self.owner.namespace, &name, preconditions)
                .await?;
            self.loaded = None;
            return Ok(());
        }

        let aliases = serde_json::to_string(&self.aliases)?;
        let data = self.expected_data();

        if let Some(loaded) = &self.loaded {
            let unchanged = loaded.annotations().get(ALIASES_ANNOTATION) == Some(&aliases)
                && loaded.data.as_ref() == Some(&data)
                && loaded.metadata.owner_references.is_some();
            if unchanged {
                return Ok(());
            }
        }

        let mut meta = match &self.loaded {
            Some(loaded) => loaded.metadata.clone(),
            None => ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.owner.namespace.clone()),
                ..Default::default()
            },
        };

        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(self.expected_labels());
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ALIASES_ANNOTATION.to_string(), aliases);
        meta.owner_references = Some(vec![owner_reference(owner)]);

        let secret = Secret {
            metadata: meta,
            data: Some(data),
            ..Default::default()
        };

        let saved = if self.loaded.is_some() {
            debug!("Updating API key catalog {}/{}", self.owner.namespace, name);
            store.replace(&secret).await?
        } else {
            debug!("Creating API key catalog {}/{}", self.owner.namespace, name);
            store.create(&secret).await?
        };
        self.loaded = Some(saved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::secret_store::InMemorySecretStore;
    use crate::crd::ElasticsearchSpec;

    fn owner_es() -> Elasticsearch {
        let mut es = Elasticsearch::new("myes", ElasticsearchSpec::default());
        es.metadata.namespace = Some("ns".to_string());
        es.metadata.uid = Some("uid-myes".to_string());
        es
    }

    fn owner() -> ClusterKey {
        ClusterKey::new("ns", "myes")
    }

    fn catalog_secret(annotation: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("myes-es-remote-api-keys".to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(BTreeMap::from([(
                    ALIASES_ANNOTATION.to_string(),
                    annotation.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn data_keys(secret: &Secret) -> Vec<String> {
        secret.data.as_ref().unwrap().keys().cloned().collect()
    }

    async fn load(store: &InMemorySecretStore, pending: &Arc<PendingChanges>) -> ApiKeyCatalog {
        ApiKeyCatalog::load(store, &owner(), pending.clone())
            .await
            .unwrap()
    }

    #[test]
    fn test_credentials_key_pattern() {
        assert_eq!(credentials_key("rc1"), "cluster.remote.rc1.credentials");
        assert_eq!(
            alias_from_credentials_key("cluster.remote.my-alias_2.credentials"),
            Some("my-alias_2")
        );
        assert_eq!(alias_from_credentials_key("cluster.remote.a.b.credentials"), None);
        assert_eq!(alias_from_credentials_key("cluster.remote..credentials"), None);
        assert_eq!(alias_from_credentials_key("xpack.security.foo"), None);
    }

    #[tokio::test]
    async fn test_save_new_catalog() {
        let store = InMemorySecretStore::new();
        let pending = Arc::new(PendingChanges::new());
        let mut catalog = load(&store, &pending).await;

        catalog.update(&ClusterKey::new("ns1", "es1"), "rc1", "k1", "e1");
        catalog.update(&ClusterKey::new("ns2", "es2"), "rc2", "k2", "e2");
        catalog.save(&store, &owner_es()).await.unwrap();

        let saved = store.snapshot("ns", "myes-es-remote-api-keys").unwrap();
        assert_eq!(
            saved.annotations()[ALIASES_ANNOTATION],
            r#"{"rc1":{"namespace":"ns1","name":"es1","id":"k1"},"rc2":{"namespace":"ns2","name":"es2","id":"k2"}}"#
        );
        let data = saved.data.clone().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["cluster.remote.rc1.credentials"], ByteString(b"e1".to_vec()));
        assert_eq!(data["cluster.remote.rc2.credentials"], ByteString(b"e2".to_vec()));
        assert_eq!(saved.labels()[TYPE_LABEL], REMOTE_CLUSTER_API_KEYS_TYPE);
        assert_eq!(saved.labels()[CREDENTIALS_LABEL], "true");
        assert_eq!(
            saved.labels()["elasticsearch.k8s.elastic.co/cluster-name"],
            "myes"
        );
        assert_eq!(saved.owner_references()[0].uid, "uid-myes");
    }

    #[tokio::test]
    async fn test_load_parses_aliases_and_ignores_unknown_keys() {
        let store = InMemorySecretStore::new();
        store.insert(catalog_secret(
            r#"{ "rc2" : { "namespace" : "ns2", "name" : "es2", "id": "SecretKeyID2" }, "rc1" : { "namespace" : "ns1", "name" : "es1", "id": "SecretKeyID1" } }"#,
            &[
                ("cluster.remote.rc1.credentials", "SecretKeyValue1"),
                ("cluster.remote.rc2.credentials", "SecretKeyValue2"),
                ("something.else", "x"),
            ],
        ));
        let catalog = load(&store, &Arc::new(PendingChanges::new())).await;

        assert_eq!(catalog.aliases().len(), 2);
        assert_eq!(catalog.key_id_for("rc1"), Some("SecretKeyID1"));
        assert_eq!(catalog.key_id_for("rc3"), None);
        assert_eq!(
            catalog.for_cluster("ns2", "es2"),
            BTreeSet::from(["rc2".to_string()])
        );
        assert!(catalog.for_cluster("ns3", "es3").is_empty());
    }

    #[tokio::test]
    async fn test_pending_add_overlaid_until_observed() {
        let store = InMemorySecretStore::new();
        let pending = Arc::new(PendingChanges::new());

        let mut catalog = load(&store, &pending).await;
        catalog.update(&ClusterKey::new("ns1", "es1"), "rc1", "k1", "e1");

        // the Secret has not been written yet, the key is still visible
        let reloaded = load(&store, &pending).await;
        assert_eq!(reloaded.key_id_for("rc1"), Some("k1"));
        assert_eq!(pending.len(), 1);

        catalog.save(&store, &owner_es()).await.unwrap();
        let observed = load(&store, &pending).await;
        assert_eq!(observed.key_id_for("rc1"), Some("k1"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_pending_add_wins_over_stale_key_id() {
        let store = InMemorySecretStore::new();
        store.insert(catalog_secret(
            r#"{"rc1":{"namespace":"ns1","name":"es1","id":"old"}}"#,
            &[("cluster.remote.rc1.credentials", "old-encoded")],
        ));
        let pending = Arc::new(PendingChanges::new());
        pending.add_key(&ClusterKey::new("ns1", "es1"), "rc1", "new", "new-encoded");

        let catalog = load(&store, &pending).await;
        assert_eq!(catalog.key_id_for("rc1"), Some("new"));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_delete_kept_until_absence_observed() {
        let store = InMemorySecretStore::new();
        store.insert(catalog_secret(
            r#"{"rc1":{"namespace":"ns1","name":"es1","id":"k1"}}"#,
            &[("cluster.remote.rc1.credentials", "e1")],
        ));
        let pending = Arc::new(PendingChanges::new());

        let mut catalog = load(&store, &pending).await;
        catalog.delete("rc1");

        let stale = load(&store, &pending).await;
        assert_eq!(stale.key_id_for("rc1"), None);
        assert_eq!(pending.len(), 1);

        catalog.save(&store, &owner_es()).await.unwrap();
        assert!(store.snapshot("ns", "myes-es-remote-api-keys").is_none());

        let observed = load(&store, &pending).await;
        assert!(observed.is_empty());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_save_keeps_only_aliased_credentials() {
        let store = InMemorySecretStore::new();
        store.insert(catalog_secret(
            r#"{"rc1":{"namespace":"ns1","name":"es1","id":"k1"},"rc2":{"namespace":"ns1","name":"es1","id":"k2"}}"#,
            &[
                ("cluster.remote.rc1.credentials", "e1"),
                ("cluster.remote.rc2.credentials", "e2"),
                ("cluster.remote.orphan.credentials", "e3"),
            ],
        ));
        let mut catalog = load(&store, &Arc::new(PendingChanges::new())).await;
        catalog.delete("rc2");
        catalog.save(&store, &owner_es()).await.unwrap();

        let saved = store.snapshot("ns", "myes-es-remote-api-keys").unwrap();
        assert_eq!(data_keys(&saved), vec!["cluster.remote.rc1.credentials"]);
    }

    #[tokio::test]
    async fn test_save_unchanged_catalog_does_not_write() {
        let store = InMemorySecretStore::new();
        let pending = Arc::new(PendingChanges::new());
        let mut catalog = load(&store, &pending).await;
        catalog.update(&ClusterKey::new("ns1", "es1"), "rc1", "k1", "e1");
        catalog.save(&store, &owner_es()).await.unwrap();
        catalog.save(&store, &owner_es()).await.unwrap();
        assert_eq!(store.write_count(), 1);

        let mut reloaded = load(&store, &pending).await;
        reloaded.save(&store, &owner_es()).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_save_conflicts_when_modified_since_load() {
        let store = InMemorySecretStore::new();
        store.insert(catalog_secret(
            r#"{"rc1":{"namespace":"ns1","name":"es1","id":"k1"}}"#,
            &[("cluster.remote.rc1.credentials", "e1")],
        ));
        let mut first = load(&store, &Arc::new(PendingChanges::new())).await;
        let mut second = load(&store, &Arc::new(PendingChanges::new())).await;

        first.update(&ClusterKey::new("ns1", "es1"), "rc2", "k2", "e2");
        first.save(&store, &owner_es()).await.unwrap();

        second.delete("rc1");
        let err = second.save(&store, &owner_es()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.snapshot("ns", "myes-es-remote-api-keys").is_some());
    }
}
