//! Collection of the settings that end up in the keystore
//!
//! Sources are read in order and later sources win for the same setting name:
//! the cluster's own `spec.secureSettings`, additional sources supplied by the
//! caller, then the cross-cluster API keys catalog of the cluster.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::remotecluster::catalog::alias_from_credentials_key;
use super::resources::remote_api_keys_secret_name;
use super::secret_store::SecretStore;
use crate::crd::{Elasticsearch, SecretSource};
use crate::error::{Error, Result};
use crate::keystore::Settings;

/// A secure settings source living in an explicit namespace
#[derive(Clone, Debug, PartialEq)]
pub struct NamespacedSecretSource {
    pub namespace: String,
    pub source: SecretSource,
}

impl NamespacedSecretSource {
    pub fn new(namespace: &str, source: SecretSource) -> Self {
        Self {
            namespace: namespace.to_string(),
            source,
        }
    }
}

/// Gather every setting that must be present in the keystore of `es`
pub async fn collect_secure_settings(
    store: &dyn SecretStore,
    es: &Elasticsearch,
    additional_sources: &[NamespacedSecretSource],
) -> Result<Settings> {
    let key = es.key();
    let mut settings = Settings::new();

    let own_sources = es
        .spec
        .secure_settings
        .iter()
        .map(|s| NamespacedSecretSource::new(&key.namespace, s.clone()));

    for source in own_sources.chain(additional_sources.iter().cloned()) {
        let Some(secret) = store
            .get(&source.namespace, &source.source.secret_name)
            .await?
        else {
            warn!(
                "Secure settings Secret {}/{} not found, skipping",
                source.namespace, source.source.secret_name
            );
            continue;
        };
        settings.extend(settings_from_secret(&secret, &source.source)?);
    }

    let catalog_name = remote_api_keys_secret_name(&key.name);
    if let Some(catalog) = store.get(&key.namespace, &catalog_name).await? {
        let credentials = remote_credentials(&catalog);
        debug!(
            "Adding {} remote cluster credentials from {}",
            credentials.len(),
            catalog_name
        );
        settings.extend(credentials);
    }

    Ok(settings)
}

/// Project the data of `secret` into settings according to `source`
pub fn settings_from_secret(secret: &Secret, source: &SecretSource) -> Result<Settings> {
    let data = secret.data.clone().unwrap_or_default();

    let Some(entries) = &source.entries else {
        return Ok(data.into_iter().map(|(k, v)| (k, v.0)).collect());
    };
    if entries.is_empty() {
        return Err(Error::ValidationError(format!(
            "secure settings Secret {} lists no entries",
            secret.name_any()
        )));
    }

    let mut settings = Settings::new();
    for entry in entries {
        let value = data.get(&entry.key).ok_or_else(|| {
            Error::ValidationError(format!(
                "key {} not found in secure settings Secret {}",
                entry.key,
                secret.name_any()
            ))
        })?;
        let name = entry
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&entry.key);
        settings.insert(name.to_string(), value.0.clone());
    }
    Ok(settings)
}

fn remote_credentials(catalog: &Secret) -> Settings {
    catalog
        .data
        .iter()
        .flatten()
        .filter(|(k, _)| alias_from_credentials_key(k).is_some())
        .map(|(k, v)| (k.clone(), v.0.clone()))
        .collect()
}
