//! Elasticsearch Custom Resource Definition
//!
//! Only the fields read by the keystore and remote-cluster controllers are
//! modelled. The resource is owned by the main Elasticsearch operator; this
//! crate reads its spec and patches a few status fields.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterKey, Condition, NodeSet, RemoteCluster, SecretSource, Version};

/// Annotation that turns the reloadable keystore off for a cluster
pub const DISABLE_RELOADABLE_KEYSTORE_ANNOTATION: &str =
    "eck.k8s.elastic.co/disable-reloadable-keystore";

/// First version supporting cross-cluster API keys
pub const REMOTE_CLUSTER_API_KEYS_MIN_VERSION: Version = Version::new(8, 10, 0);

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "elasticsearch.k8s.elastic.co",
    version = "v1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    namespaced,
    status = "ElasticsearchStatus",
    shortname = "es",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Keystore","type":"string","jsonPath":".status.conditions[?(@.type=='KeystoreConverged')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    pub version: String,

    #[serde(default)]
    pub node_sets: Vec<NodeSet>,

    /// Secrets whose keys end up in the Elasticsearch keystore
    #[serde(default)]
    pub secure_settings: Vec<SecretSource>,

    #[serde(default)]
    pub remote_clusters: Vec<RemoteCluster>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    /// Lowest version currently running in the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Keystore digest every node has confirmed loading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_keystore_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Elasticsearch {
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(
            &self.namespace().unwrap_or_else(|| "default".to_string()),
            &self.name_any(),
        )
    }

    /// Total number of nodes declared across node sets
    pub fn expected_node_count(&self) -> usize {
        self.spec
            .node_sets
            .iter()
            .map(|ns| ns.count.max(0) as usize)
            .sum()
    }

    /// Version reported by the running cluster, if any
    pub fn running_version(&self) -> Option<Result<Version, String>> {
        self.status
            .as_ref()
            .and_then(|s| s.version.as_deref())
            .filter(|v| !v.is_empty())
            .map(str::parse)
    }

    /// Whether the running cluster supports cross-cluster API keys.
    ///
    /// `None` while the version is not reported yet.
    pub fn supports_remote_cluster_api_keys(&self) -> Option<Result<bool, String>> {
        self.running_version()
            .map(|v| v.map(|v| v >= REMOTE_CLUSTER_API_KEYS_MIN_VERSION))
    }

    pub fn reloadable_keystore_disabled(&self) -> bool {
        self.annotations()
            .get(DISABLE_RELOADABLE_KEYSTORE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn observed_keystore_digest(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.observed_keystore_digest.as_deref())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
