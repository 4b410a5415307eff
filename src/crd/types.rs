//! Shared types used by the Elasticsearch CRD

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A group of Elasticsearch nodes sharing the same configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    pub name: String,
    #[serde(default)]
    pub count: i32,
}

/// A Secret whose keys are added to the Elasticsearch keystore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    pub secret_name: String,

    /// Keys to project. All keys of the Secret are used when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<KeyToPath>>,
}

/// Maps a Secret key to a keystore setting name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyToPath {
    pub key: String,

    /// Setting name in the keystore, defaults to the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Reference to another Elasticsearch resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchRef {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ElasticsearchRef {
    pub fn is_defined(&self) -> bool {
        !self.name.is_empty()
    }

    /// Resolve the reference, falling back to the namespace of the referencing resource
    pub fn with_default_namespace(&self, namespace: &str) -> ClusterKey {
        ClusterKey::new(
            self.namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .unwrap_or(namespace),
            &self.name,
        )
    }
}

/// A remote cluster declared by a client cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCluster {
    /// Alias under which the client cluster refers to the remote
    pub name: String,

    #[serde(default)]
    pub elasticsearch_ref: ElasticsearchRef,

    /// When set, the connection uses a cross-cluster API key instead of certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<RemoteClusterApiKey>,
}

/// Access granted by a cross-cluster API key, in Elasticsearch request format
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RemoteClusterApiKey {
    pub access: CrossClusterAccess,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CrossClusterAccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<CrossClusterSearch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<Vec<CrossClusterReplication>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CrossClusterSearch {
    pub names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub query: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_security: Option<FieldSecurity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_restricted_indices: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FieldSecurity {
    #[serde(default)]
    pub grant: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CrossClusterReplication {
    pub names: Vec<String>,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Namespace and name of a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Elasticsearch version, `major.minor.patch` with an optional pre-release suffix
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.trim().split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |what: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {what} version in {s:?}"))?
                .parse::<u32>()
                .map_err(|e| format!("invalid {what} version in {s:?}: {e}"))
        };
        let version = Version::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(format!("too many version components in {s:?}"));
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
