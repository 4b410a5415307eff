//! Reloadable keystore reconciliation
//!
//! One pass collects the secure settings of a cluster, hashes them and only
//! rebuilds the keystore when the hash differs from the one recorded on the
//! published Secret. Nodes mount the Secret as a directory so an updated
//! keystore reaches them without a restart.

use k8s_openapi::api::core::v1::{Secret, Volume, VolumeMount};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::publisher::{self, Metadata};
use super::resources::{cluster_labels, keystore_secret_name, keystore_volume};
use super::secret_store::SecretStore;
use super::secure_settings::{collect_secure_settings, NamespacedSecretSource};
use crate::crd::{Elasticsearch, Version};
use crate::error::{Error, Result};
use crate::keystore::{settings_hash, KeystoreArtifact, KeystoreConfig, CONFIG};

/// First version whose reload API reports the loaded keystore digest
pub const MIN_ES_VERSION: Version = Version::new(9, 3, 0);

/// What pods need to consume the published keystore
#[derive(Clone, Debug, PartialEq)]
pub struct KeystoreResources {
    pub secret_name: String,
    pub digest: Option<String>,
    pub settings_hash: String,
    pub volume: Volume,
    pub volume_mount: VolumeMount,
}

impl KeystoreResources {
    fn from_secret(es_name: &str, secret: &Secret) -> Self {
        let (volume, volume_mount) = keystore_volume(es_name);
        Self {
            secret_name: secret.name_any(),
            digest: publisher::published_digest(secret).map(str::to_string),
            settings_hash: publisher::published_settings_hash(secret)
                .unwrap_or_default()
                .to_string(),
            volume,
            volume_mount,
        }
    }
}

/// Version used to gate the feature: the lowest of the desired and the running one
pub fn gating_version(es: &Elasticsearch) -> Result<Version> {
    let desired: Version = es.spec.version.parse().map_err(Error::ValidationError)?;
    match es.running_version() {
        Some(running) => Ok(desired.min(running.map_err(Error::ValidationError)?)),
        None => Ok(desired),
    }
}

/// Whether the reloadable keystore should be produced for `es`
pub fn is_enabled(es: &Elasticsearch, version: &Version) -> bool {
    !es.reloadable_keystore_disabled() && *version >= MIN_ES_VERSION
}

/// Reconcile the keystore when the feature applies to `es`.
///
/// Returns `None` and removes any keystore Secret left behind when another
/// strategy owns keystore production.
pub async fn reconcile_if_enabled(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    meta: &Metadata,
    additional_sources: &[NamespacedSecretSource],
) -> Result<Option<KeystoreResources>> {
    reconcile_if_enabled_with(store, es, meta, additional_sources, &CONFIG).await
}

#[instrument(skip(store, es, meta, additional_sources, config), fields(name = %es.name_any(), namespace = es.namespace()))]
pub async fn reconcile_if_enabled_with(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    meta: &Metadata,
    additional_sources: &[NamespacedSecretSource],
    config: &KeystoreConfig,
) -> Result<Option<KeystoreResources>> {
    let version = gating_version(es)?;
    if !is_enabled(es, &version) {
        debug!(
            "Reloadable keystore not enabled (version {}, disabled by annotation: {})",
            version,
            es.reloadable_keystore_disabled()
        );
        publisher::delete_keystore_secret(store, es).await?;
        return Ok(None);
    }
    reconcile_with(store, es, meta, additional_sources, config)
        .await
        .map(Some)
}

/// Build and publish the keystore of `es` if its settings changed
pub async fn reconcile(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    meta: &Metadata,
    additional_sources: &[NamespacedSecretSource],
) -> Result<KeystoreResources> {
    reconcile_with(store, es, meta, additional_sources, &CONFIG).await
}

pub async fn reconcile_with(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    meta: &Metadata,
    additional_sources: &[NamespacedSecretSource],
    config: &KeystoreConfig,
) -> Result<KeystoreResources> {
    let es_name = es.name_any();
    let settings = collect_secure_settings(store, es, additional_sources).await?;

    publisher::delete_legacy_secret(store, es).await?;

    let hash = settings_hash(&settings);
    if let Some(existing) = publisher::find_current(store, es, &hash).await? {
        debug!(settings_hash = %hash, "Keystore settings unchanged, skipping regeneration");
        return Ok(KeystoreResources::from_secret(&es_name, &existing));
    }

    info!(
        settings_hash = %hash,
        settings_count = settings.len(),
        "Keystore settings changed, regenerating"
    );

    // Key derivation is CPU bound
    let config = *config;
    let artifact =
        tokio::task::spawn_blocking(move || KeystoreArtifact::build_with(&settings, &config))
            .await
            .map_err(|e| Error::CryptoError(format!("keystore generation task failed: {e}")))??;

    let mut meta = meta.clone();
    meta.labels.extend(cluster_labels(&es_name));
    let secret = publisher::publish_keystore(store, es, &artifact, &meta).await?;

    #[cfg(feature = "metrics")]
    super::metrics::inc_keystore_regenerations(&es.namespace().unwrap_or_default(), &es_name);

    debug!("Keystore published in {}", keystore_secret_name(&es_name));
    Ok(KeystoreResources::from_secret(&es_name, &secret))
}
