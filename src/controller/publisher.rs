//! Publication of the keystore Secret
//!
//! The keystore is stored in `<es>-es-keystore` together with two annotations:
//! the digest of the file, which nodes echo back after a reload, and the hash
//! of the settings it was built from, which decides whether it must be rebuilt.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::resources::{
    keystore_secret_name, legacy_secure_settings_secret_name, owner_reference, KEYSTORE_FILE_NAME,
};
use super::secret_store::{reconcile_secret, DeletePreconditions, SecretStore};
use crate::crd::Elasticsearch;
use crate::error::Result;
use crate::keystore::KeystoreArtifact;

/// Hex SHA-256 of the keystore file, compared with the digest reported by nodes
pub const KEYSTORE_DIGEST_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/keystore-digest";

/// Hex SHA-256 of the settings the keystore was built from
pub const SETTINGS_HASH_ANNOTATION: &str = "keystore.k8s.elastic.co/settings-hash";

/// Labels and annotations inherited from the owning cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn with_labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            annotations: BTreeMap::new(),
        }
    }
}

pub fn published_digest(secret: &Secret) -> Option<&str> {
    secret
        .annotations()
        .get(KEYSTORE_DIGEST_ANNOTATION)
        .map(String::as_str)
        .filter(|d| !d.is_empty())
}

pub fn published_settings_hash(secret: &Secret) -> Option<&str> {
    secret
        .annotations()
        .get(SETTINGS_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Fetch the keystore Secret of `es` if it was built from `settings_hash`
pub async fn find_current(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    settings_hash: &str,
) -> Result<Option<Secret>> {
    let key = es.key();
    let existing = store
        .get(&key.namespace, &keystore_secret_name(&key.name))
        .await?;
    Ok(existing.filter(|s| published_settings_hash(s) == Some(settings_hash)))
}

fn build_keystore_secret(es: &Elasticsearch, artifact: &KeystoreArtifact, meta: &Metadata) -> Secret {
    let key = es.key();
    let mut annotations = meta.annotations.clone();
    annotations.insert(
        KEYSTORE_DIGEST_ANNOTATION.to_string(),
        artifact.digest.clone(),
    );
    annotations.insert(
        SETTINGS_HASH_ANNOTATION.to_string(),
        artifact.settings_hash.clone(),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(keystore_secret_name(&key.name)),
            namespace: Some(key.namespace),
            labels: Some(meta.labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KEYSTORE_FILE_NAME.to_string(),
            ByteString(artifact.content.clone()),
        )])),
        ..Default::default()
    }
}

/// Create or update the keystore Secret of `es`.
///
/// A Secret already carrying the same settings hash is returned untouched so
/// that an unchanged configuration never produces a new keystore on disk.
pub async fn publish_keystore(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    artifact: &KeystoreArtifact,
    meta: &Metadata,
) -> Result<Secret> {
    if let Some(existing) = find_current(store, es, &artifact.settings_hash).await? {
        debug!(
            "Keystore Secret {} already built from settings {}",
            existing.name_any(),
            artifact.settings_hash
        );
        return Ok(existing);
    }

    let expected = build_keystore_secret(es, artifact, meta);
    info!(
        "Publishing keystore Secret {} (digest {})",
        expected.name_any(),
        artifact.digest
    );
    reconcile_secret(store, expected, Some(owner_reference(es))).await
}

/// Delete the Secret written by the init-container keystore strategy
pub async fn delete_legacy_secret(store: &dyn SecretStore, es: &Elasticsearch) -> Result<()> {
    let key = es.key();
    store
        .delete(
            &key.namespace,
            &legacy_secure_settings_secret_name(&key.name),
            DeletePreconditions::default(),
        )
        .await
}

/// Delete the keystore Secret, used when another strategy owns the keystore
pub async fn delete_keystore_secret(store: &dyn SecretStore, es: &Elasticsearch) -> Result<()> {
    let key = es.key();
    store
        .delete(
            &key.namespace,
            &keystore_secret_name(&key.name),
            DeletePreconditions::default(),
        )
        .await
}
