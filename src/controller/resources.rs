//! Kubernetes resource builders for Elasticsearch keystore objects
//!
//! Naming of the Secrets shared with the main Elasticsearch operator, the
//! labels and owner references put on them, and the volume through which
//! nodes read the keystore.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::{ClusterKey, Elasticsearch};

/// Label carrying the name of the owning Elasticsearch cluster
pub const CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";

/// Label describing the role of an operator-managed Secret
pub const TYPE_LABEL: &str = "common.k8s.elastic.co/type";

/// Marks Secrets holding credentials
pub const CREDENTIALS_LABEL: &str = "eck.k8s.elastic.co/credentials";

pub const REMOTE_CLUSTER_NAMESPACE_LABEL: &str =
    "elasticsearch.k8s.elastic.co/remote-cluster-namespace";
pub const REMOTE_CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/remote-cluster-name";

/// Data key of the keystore file inside the keystore Secret
pub const KEYSTORE_FILE_NAME: &str = "elasticsearch.keystore";

/// Volume exposing the keystore Secret to Elasticsearch containers
pub const KEYSTORE_VOLUME_NAME: &str = "elasticsearch-keystore";

/// Keystore mount path. The whole directory is mounted (no `subPath`) so that
/// kubelet propagates Secret updates into running pods.
pub const KEYSTORE_MOUNT_PATH: &str = "/mnt/elastic-internal/keystore";

/// Data key of a CA certificate
pub const CA_FILE_NAME: &str = "ca.crt";

/// Internal user the operator authenticates as
pub const INTERNAL_USER: &str = "elastic-internal";

/// HTTP port of the Elasticsearch service
pub const HTTP_PORT: u16 = 9200;

pub fn keystore_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-keystore")
}

/// Secret produced by the init-container keystore strategy
pub fn legacy_secure_settings_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-secure-settings")
}

pub fn remote_api_keys_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-remote-api-keys")
}

pub fn transport_certs_public_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-transport-certs-public")
}

pub fn http_certs_public_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-http-certs-public")
}

pub fn internal_users_secret_name(es_name: &str) -> String {
    format!("{es_name}-es-internal-users")
}

/// Secret in the namespace of `owner` holding the CA of `remote`
pub fn remote_ca_secret_name(owner_name: &str, remote: &ClusterKey) -> String {
    format!(
        "{owner_name}-es-{}-{}-remote-ca",
        remote.namespace, remote.name
    )
}

/// URL of the Elasticsearch HTTP service
pub fn es_http_url(cluster: &ClusterKey) -> String {
    format!(
        "https://{}-es-http.{}.svc:{HTTP_PORT}",
        cluster.name, cluster.namespace
    )
}

/// Labels identifying the owning cluster
pub fn cluster_labels(es_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), es_name.to_string())])
}

/// Owner reference so Secrets are garbage collected with their cluster
pub fn owner_reference(es: &Elasticsearch) -> OwnerReference {
    OwnerReference {
        api_version: Elasticsearch::api_version(&()).to_string(),
        kind: Elasticsearch::kind(&()).to_string(),
        name: es.name_any(),
        uid: es.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Volume and read-only mount for the published keystore
pub fn keystore_volume(es_name: &str) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: KEYSTORE_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(keystore_secret_name(es_name)),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: KEYSTORE_VOLUME_NAME.to_string(),
        mount_path: KEYSTORE_MOUNT_PATH.to_string(),
        read_only: Some(true),
        sub_path: None,
        ..Default::default()
    };
    (volume, mount)
}
